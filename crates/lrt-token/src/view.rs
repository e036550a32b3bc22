//! Token views: map/reduce definitions that bucket tokens by state.
//!
//! Each view renders to the CouchDB JavaScript a real server runs and to a
//! [`ViewSpec`] the embedded store evaluates. Both come from the same
//! condition text, parsed once by the predicate language in `lrt-store`.

use lrt_store::{EmitRule, Operand, Predicate, Reducer, ViewCode, ViewSpec};
use serde_json::{Value, json};

use crate::error::TokenResult;

/// Name of the reduce view installed by [`TokenList::add_token_views`](crate::TokenList::add_token_views).
pub const OVERVIEW_VIEW: &str = "overview_view";

/// Name of the reduce view installed by the handler's overview.
pub const OVERVIEW_TOTAL: &str = "overview_total";

/// Sum reduce shared by every overview view.
pub const SUM_REDUCE: &str = "function (key, values, rereduce) {\n   return sum(values);\n}\n";

/// State buckets of the overview, in emit order.
pub const OVERVIEW_BRANCHES: [(&str, &str); 6] = [
    ("todo", "doc.lock == 0 && doc.done == 0"),
    ("downloading", "doc.lock > 0 && doc.status == 'downloading'"),
    ("done", "doc.lock > 0 && doc.done > 0 && doc.output == 0"),
    ("error", "doc.lock > 0 && doc.output != 0 && doc.output != \"\""),
    ("waiting", "doc.lock > 0 && doc.status == 'launched'"),
    ("running", "doc.lock > 0 && doc.done == 0 && doc.status != 'downloading'"),
];

/// A view that can be installed into a token type's design document.
pub trait ViewCodes: Send + Sync {
    fn name(&self) -> &str;

    /// `(map, reduce)` JavaScript for documents of `token_type`.
    fn get_codes(&self, token_type: &str) -> (String, Option<String>);

    /// The same view as data.
    fn spec(&self, token_type: &str) -> TokenResult<ViewSpec>;

    /// Wire form for a design document.
    fn view_code(&self, token_type: &str) -> ViewCode {
        let (map, reduce) = self.get_codes(token_type);
        ViewCode { map, reduce }
    }
}

fn quoted(token_type: &str) -> String {
    Value::String(token_type.to_string()).to_string()
}

/// A filter view: emits `(key, value)` for tokens matching a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenView {
    name: String,
    condition: String,
    emit: (String, String),
}

impl TokenView {
    /// Emits `(doc._id, doc._id)` for every matching token.
    pub fn new(name: &str, condition: &str) -> Self {
        Self::with_emit(name, condition, ("doc._id", "doc._id"))
    }

    pub fn with_emit(name: &str, condition: &str, emit: (&str, &str)) -> Self {
        Self {
            name: name.to_string(),
            condition: condition.to_string(),
            emit: (emit.0.to_string(), emit.1.to_string()),
        }
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    pub fn emit_values(&self) -> (&str, &str) {
        (&self.emit.0, &self.emit.1)
    }
}

impl ViewCodes for TokenView {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_codes(&self, token_type: &str) -> (String, Option<String>) {
        let map = format!(
            "function(doc) {{\n   if(doc.type == {}) {{\n      if({}) {{\n         emit({}, {});\n      }}\n   }}\n}}\n",
            quoted(token_type),
            self.condition,
            self.emit.0,
            self.emit.1
        );
        (map, None)
    }

    fn spec(&self, token_type: &str) -> TokenResult<ViewSpec> {
        Ok(ViewSpec {
            doc_type: token_type.to_string(),
            rules: vec![EmitRule {
                when: Predicate::parse(&self.condition)?,
                key: Operand::parse(&self.emit.0)?,
                value: Operand::parse(&self.emit.1)?,
            }],
            reduce: None,
        })
    }
}

/// The overview: counts tokens per state with a sum reduce.
///
/// Branches are not exclusive. A locked, unfinished token with status
/// `launched` counts as both `waiting` and `running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReduceView {
    name: String,
    filter: Option<String>,
}

impl TokenReduceView {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            filter: None,
        }
    }

    /// An overview restricted to tokens matching `condition`.
    pub fn filtered(name: &str, condition: &str) -> Self {
        Self {
            name: name.to_string(),
            filter: Some(condition.to_string()),
        }
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }
}

impl ViewCodes for TokenReduceView {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_codes(&self, token_type: &str) -> (String, Option<String>) {
        let mut branches = String::new();
        for (label, condition) in OVERVIEW_BRANCHES {
            branches.push_str(&format!(
                "       if({condition}) {{\n          emit('{label}', 1);\n       }}\n"
            ));
        }
        let body = match &self.filter {
            Some(filter) => format!("     if({filter}) {{\n{branches}     }}\n"),
            None => branches,
        };
        let map = format!(
            "function(doc) {{\n   if(doc.type == {}) {{\n{body}   }}\n}}\n",
            quoted(token_type)
        );
        (map, Some(SUM_REDUCE.to_string()))
    }

    fn spec(&self, token_type: &str) -> TokenResult<ViewSpec> {
        let filter = self.filter.as_deref().map(Predicate::parse).transpose()?;
        let mut rules = Vec::with_capacity(OVERVIEW_BRANCHES.len());
        for (label, condition) in OVERVIEW_BRANCHES {
            let branch = Predicate::parse(condition)?;
            let when = match &filter {
                Some(filter) => filter.clone().and(branch),
                None => branch,
            };
            rules.push(EmitRule {
                when,
                key: Operand::Literal(json!(label)),
                value: Operand::Literal(json!(1)),
            });
        }
        Ok(ViewSpec {
            doc_type: token_type.to_string(),
            rules,
            reduce: Some(Reducer::Sum),
        })
    }
}

/// The standard views of a PiCaS token list.
pub fn token_views() -> Vec<Box<dyn ViewCodes>> {
    vec![
        Box::new(TokenView::new("todo", "doc.lock ==  0 && doc.done == 0 ")),
        Box::new(TokenView::with_emit(
            "locked",
            "doc.lock > 0 && doc.done == 0 ",
            ("doc._id", "doc.status"),
        )),
        Box::new(TokenView::new("done", "doc.status == \"done\"")),
        Box::new(TokenView::with_emit(
            "error",
            "doc.status == \"error\" ",
            ("doc._id", "doc.status"),
        )),
        Box::new(TokenReduceView::new(OVERVIEW_VIEW)),
    ]
}

/// The status views a [`TokenHandler`](crate::TokenHandler) installs.
///
/// These classify errors by `output` rather than `status`.
pub fn status_views() -> Vec<TokenView> {
    vec![
        TokenView::new("todo", "doc.lock ==  0 && doc.done == 0 "),
        TokenView::new("locked", "doc.lock > 0 && doc.done == 0 "),
        TokenView::new("done", "doc.status == \"done\" "),
        TokenView::with_emit("error", "doc.output != 0 ", ("doc._id", "doc.output")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_view_codes() {
        let view = TokenView::new("todo", "doc.lock == 0 && doc.done == 0");
        let (map, reduce) = view.get_codes("jobX");
        assert!(map.contains(r#"doc.type == "jobX""#));
        assert!(map.contains("doc.lock == 0 && doc.done == 0"));
        assert!(map.contains("emit(doc._id, doc._id);"));
        assert!(reduce.is_none());
    }

    #[test]
    fn token_type_is_quoted() {
        let view = TokenView::new("todo", "doc.lock == 0");
        let (map, _) = view.get_codes(r#"we"ird"#);
        assert!(map.contains(r#"doc.type == "we\"ird""#));
    }

    #[test]
    fn token_view_spec_matches_condition() {
        let spec = TokenView::with_emit("locked", "doc.lock > 0", ("doc._id", "doc.status"))
            .spec("job")
            .unwrap();
        let doc = json!({"_id": "t1", "type": "job", "lock": 5, "status": "launched"});
        assert_eq!(spec.emit(&doc), vec![(json!("t1"), json!("launched"))]);

        let other_type = json!({"_id": "t2", "type": "other", "lock": 5});
        assert!(spec.emit(&other_type).is_empty());
    }

    #[test]
    fn bad_condition_is_an_error() {
        assert!(TokenView::new("broken", "doc.lock >").spec("job").is_err());
    }

    #[test]
    fn reduce_view_codes() {
        let (map, reduce) = TokenReduceView::new(OVERVIEW_VIEW).get_codes("job");
        for (label, _) in OVERVIEW_BRANCHES {
            assert!(map.contains(&format!("emit('{label}', 1);")));
        }
        assert_eq!(reduce.as_deref(), Some(SUM_REDUCE));
    }

    #[test]
    fn overview_branches_classify() {
        let spec = TokenReduceView::new(OVERVIEW_VIEW).spec("job").unwrap();
        let labels = |doc: Value| -> Vec<Value> { spec.emit(&doc).into_iter().map(|(k, _)| k).collect() };

        assert_eq!(labels(json!({"type": "job", "lock": 0, "done": 0})), vec![json!("todo")]);
        assert_eq!(
            labels(json!({"type": "job", "lock": 9, "done": 10, "output": 0, "status": "done"})),
            vec![json!("done")]
        );
        assert_eq!(
            labels(json!({"type": "job", "lock": 9, "done": 10, "output": 3})),
            vec![json!("error")]
        );
        // Overlapping branches: launched and unfinished.
        assert_eq!(
            labels(json!({"type": "job", "lock": 9, "done": 0, "status": "launched", "output": ""})),
            vec![json!("waiting"), json!("running")]
        );
        assert_eq!(
            labels(json!({"type": "job", "lock": 9, "done": 0, "status": "downloading", "output": ""})),
            vec![json!("downloading")]
        );
        // A locked token without an output field is loosely != 0.
        assert_eq!(
            labels(json!({"type": "job", "lock": 9, "done": 0, "status": "running"})),
            vec![json!("error"), json!("running")]
        );
    }

    #[test]
    fn filtered_overview_restricts_branches() {
        let view = TokenReduceView::filtered("pref_cal1", "doc.PIPELINE_STEP == \"pref_cal1\"");
        let (map, _) = view.get_codes("job");
        assert!(map.contains("if(doc.PIPELINE_STEP == \"pref_cal1\")"));

        let spec = view.spec("job").unwrap();
        assert_eq!(spec.emit(&json!({"type": "job", "lock": 0, "done": 0})).len(), 0);
        assert_eq!(
            spec.emit(&json!({"type": "job", "lock": 0, "done": 0, "PIPELINE_STEP": "pref_cal1"})).len(),
            1
        );
    }

    #[test]
    fn standard_view_names() {
        let names: Vec<String> = token_views().iter().map(|v| v.name().to_string()).collect();
        assert_eq!(names, vec!["todo", "locked", "done", "error", OVERVIEW_VIEW]);
        for view in token_views() {
            assert!(view.spec("job").is_ok());
        }
        for view in status_views() {
            assert!(view.spec("job").is_ok());
        }
    }
}

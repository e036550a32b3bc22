//! View predicate language.
//!
//! Token views are conditions such as `doc.lock > 0 && doc.done == 0`. The
//! CouchDB backend runs them as JavaScript map functions; every other backend
//! needs to understand them as data. This module parses the condition subset
//! the token layer uses into a [`Predicate`] AST and evaluates it against JSON
//! documents with JavaScript's loose comparison rules, so both backends agree
//! on which token lands in which view.
//!
//! Grammar:
//!
//! ```text
//! or      := and ('||' and)*
//! and     := unary ('&&' unary)*
//! unary   := '!' unary | primary
//! primary := '(' or ')' | operand (cmp operand)?
//! cmp     := '==' | '!=' | '===' | '!==' | '>' | '>=' | '<' | '<='
//! operand := doc.<path> | number | 'string' | "string" | true | false | null | undefined
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// Errors produced while parsing a view condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("unknown identifier {0:?}, fields are written as doc.<field>")]
    UnknownIdentifier(String),

    #[error("unexpected {found}, expected {expected}")]
    Unexpected { found: String, expected: &'static str },

    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),
}

// ── AST ────────────────────────────────────────────────────────────

/// A value referenced by a condition or emitted by a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// `doc.a.b` is stored as `["a", "b"]`.
    Field(Vec<String>),
    Literal(Value),
    /// The `undefined` literal; equal to a missing field under `===`.
    Undefined,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Boolean condition over a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare { lhs: Operand, op: CmpOp, rhs: Operand },
    Truthy(Operand),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Operand {
    /// Parse a single operand such as `doc._id` or `'todo'`.
    pub fn parse(src: &str) -> Result<Self, QueryError> {
        let tokens = lex(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        if parser.tokens.is_empty() {
            return Err(QueryError::Empty);
        }
        let operand = parser.operand()?;
        parser.finish()?;
        Ok(operand)
    }

    pub fn field(name: &str) -> Self {
        Operand::Field(name.split('.').map(str::to_string).collect())
    }

    fn lookup<'a>(&'a self, doc: &'a Value) -> Option<&'a Value> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Undefined => None,
            Operand::Field(path) => path.iter().try_fold(doc, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }),
        }
    }

    /// The operand's value in `doc`; missing fields evaluate to `null`.
    pub fn evaluate(&self, doc: &Value) -> Value {
        self.lookup(doc).cloned().unwrap_or(Value::Null)
    }
}

impl Predicate {
    /// Parse a condition such as `doc.lock > 0 && doc.status != 'done'`.
    pub fn parse(src: &str) -> Result<Self, QueryError> {
        let tokens = lex(src)?;
        if tokens.is_empty() {
            return Err(QueryError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.or()?;
        parser.finish()?;
        Ok(predicate)
    }

    /// Conjunction of two predicates, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Predicate {
        let mut terms = match self {
            Predicate::And(terms) => terms,
            single => vec![single],
        };
        match other {
            Predicate::And(more) => terms.extend(more),
            single => terms.push(single),
        }
        Predicate::And(terms)
    }

    /// Evaluate against a JSON document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Predicate::Compare { lhs, op, rhs } => {
                let a = JsValue::from(lhs.lookup(doc));
                let b = JsValue::from(rhs.lookup(doc));
                match op {
                    CmpOp::Eq => a.loose_eq(&b),
                    CmpOp::Ne => !a.loose_eq(&b),
                    CmpOp::StrictEq => a.strict_eq(&b),
                    CmpOp::StrictNe => !a.strict_eq(&b),
                    CmpOp::Gt => a.relate(&b) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(a.relate(&b), Some(Ordering::Greater | Ordering::Equal)),
                    CmpOp::Lt => a.relate(&b) == Some(Ordering::Less),
                    CmpOp::Le => matches!(a.relate(&b), Some(Ordering::Less | Ordering::Equal)),
                }
            }
            Predicate::Truthy(operand) => JsValue::from(operand.lookup(doc)).truthy(),
            Predicate::Not(inner) => !inner.matches(doc),
            Predicate::And(terms) => terms.iter().all(|t| t.matches(doc)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(doc)),
        }
    }
}

// ── View specs ─────────────────────────────────────────────────────

/// One `emit(key, value)` guarded by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitRule {
    pub when: Predicate,
    pub key: Operand,
    pub value: Operand,
}

/// Built-in reduce functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Sum,
}

impl Reducer {
    pub fn reduce(&self, values: &[Value]) -> Value {
        match self {
            Reducer::Sum => {
                let total: f64 = values.iter().map(|v| JsValue::from(Some(v)).to_number()).sum();
                number_value(total)
            }
        }
    }
}

/// Data description of a token view: which documents of `doc_type` emit
/// which rows, and how rows reduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub doc_type: String,
    pub rules: Vec<EmitRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<Reducer>,
}

impl ViewSpec {
    /// Rows `(key, value)` this document emits, in rule order.
    pub fn emit(&self, doc: &Value) -> Vec<(Value, Value)> {
        let type_matches = JsValue::from(doc.get("type")).loose_eq(&JsValue::Str(&self.doc_type));
        if !type_matches {
            return Vec::new();
        }
        self.rules
            .iter()
            .filter(|rule| rule.when.matches(doc))
            .map(|rule| (rule.key.evaluate(doc), rule.value.evaluate(doc)))
            .collect()
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// CouchDB key collation: null < false < true < numbers < strings < arrays < objects.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| collate(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| collate(lv, rv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ── JavaScript value semantics ─────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum JsValue<'a> {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(&'a str),
    Object,
}

impl<'a> From<Option<&'a Value>> for JsValue<'a> {
    fn from(value: Option<&'a Value>) -> Self {
        match value {
            None => JsValue::Undefined,
            Some(Value::Null) => JsValue::Null,
            Some(Value::Bool(b)) => JsValue::Bool(*b),
            Some(Value::Number(n)) => JsValue::Num(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(s)) => JsValue::Str(s),
            Some(Value::Array(_) | Value::Object(_)) => JsValue::Object,
        }
    }
}

impl JsValue<'_> {
    fn truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Num(n) => *n != 0.0 && !n.is_nan(),
            JsValue::Str(s) => !s.is_empty(),
            JsValue::Object => true,
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined | JsValue::Object => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => f64::from(u8::from(*b)),
            JsValue::Num(n) => *n,
            JsValue::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    0.0
                } else {
                    s.parse().unwrap_or(f64::NAN)
                }
            }
        }
    }

    fn loose_eq(&self, other: &JsValue<'_>) -> bool {
        use JsValue::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Num(a), Num(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Bool(_), _) => Num(self.to_number()).loose_eq(other),
            (_, Bool(_)) => self.loose_eq(&Num(other.to_number())),
            (Num(a), Str(_)) => *a == other.to_number(),
            (Str(_), Num(b)) => self.to_number() == *b,
            (Object, _) | (_, Object) => false,
        }
    }

    fn strict_eq(&self, other: &JsValue<'_>) -> bool {
        use JsValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Num(a), Num(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            _ => false,
        }
    }

    /// Relational comparison; `None` when JavaScript would answer false both ways.
    fn relate(&self, other: &JsValue<'_>) -> Option<Ordering> {
        if let (JsValue::Str(a), JsValue::Str(b)) = (self, other) {
            return Some(a.cmp(b));
        }
        self.to_number().partial_cmp(&other.to_number())
    }
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier {s:?}"),
            Tok::Num(n) => format!("number {n}"),
            Tok::Str(s) => format!("string {s:?}"),
            Tok::Cmp(op) => format!("operator {op:?}"),
            Tok::And => "'&&'".to_string(),
            Tok::Or => "'||'".to_string(),
            Tok::Not => "'!'".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
        }
    }
}

fn lex(src: &str) -> Result<Vec<Tok>, QueryError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Tok::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Tok::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                if chars.get(i + 2) == Some(&'=') {
                    tokens.push(Tok::Cmp(CmpOp::StrictEq));
                    i += 3;
                } else {
                    tokens.push(Tok::Cmp(CmpOp::Eq));
                    i += 2;
                }
            }
            '!' => {
                if next == Some('=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Tok::Cmp(CmpOp::StrictNe));
                        i += 3;
                    } else {
                        tokens.push(Tok::Cmp(CmpOp::Ne));
                        i += 2;
                    }
                } else {
                    tokens.push(Tok::Not);
                    i += 1;
                }
            }
            '>' | '<' => {
                let or_equal = next == Some('=');
                tokens.push(Tok::Cmp(match (c, or_equal) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    (_, true) => CmpOp::Le,
                    (_, false) => CmpOp::Lt,
                }));
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(QueryError::UnterminatedString(start)),
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or(QueryError::UnterminatedString(start))?;
                            value.push(match *escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(&other) => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Tok::Str(value));
            }
            c if c.is_ascii_digit()
                || ((c == '-' || c == '.') && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while let Some(&d) = chars.get(i) {
                    let exponent_sign =
                        (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| QueryError::InvalidNumber(text.clone()))?;
                tokens.push(Tok::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while let Some(&d) = chars.get(i) {
                    if d.is_alphanumeric() || d == '_' || d == '$' || d == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(QueryError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn finish(&self) -> Result<(), QueryError> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(QueryError::Unexpected {
                found: tok.describe(),
                expected: "end of expression",
            }),
        }
    }

    fn or(&mut self) -> Result<Predicate, QueryError> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Tok::Or) {
            self.advance();
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::Or(terms) })
    }

    fn and(&mut self) -> Result<Predicate, QueryError> {
        let mut terms = vec![self.unary()?];
        while self.peek() == Some(&Tok::And) {
            self.advance();
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Predicate::And(terms) })
    }

    fn unary(&mut self) -> Result<Predicate, QueryError> {
        if self.peek() == Some(&Tok::Not) {
            self.advance();
            return Ok(Predicate::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Predicate, QueryError> {
        if self.peek() == Some(&Tok::LParen) {
            self.advance();
            let inner = self.or()?;
            return match self.advance() {
                Some(Tok::RParen) => Ok(inner),
                Some(tok) => Err(QueryError::Unexpected {
                    found: tok.describe(),
                    expected: "')'",
                }),
                None => Err(QueryError::UnexpectedEnd("')'")),
            };
        }
        let lhs = self.operand()?;
        if let Some(Tok::Cmp(op)) = self.peek().cloned() {
            self.advance();
            let rhs = self.operand()?;
            return Ok(Predicate::Compare { lhs, op, rhs });
        }
        Ok(Predicate::Truthy(lhs))
    }

    fn operand(&mut self) -> Result<Operand, QueryError> {
        match self.advance() {
            Some(Tok::Num(n)) => Ok(Operand::Literal(number_value(n))),
            Some(Tok::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Tok::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Operand::Literal(Value::Bool(true))),
                "false" => Ok(Operand::Literal(Value::Bool(false))),
                "null" => Ok(Operand::Literal(Value::Null)),
                "undefined" => Ok(Operand::Undefined),
                _ => match ident.strip_prefix("doc.") {
                    Some(path) if !path.is_empty() && !path.split('.').any(str::is_empty) => {
                        Ok(Operand::field(path))
                    }
                    _ => Err(QueryError::UnknownIdentifier(ident)),
                },
            },
            Some(tok) => Err(QueryError::Unexpected {
                found: tok.describe(),
                expected: "an operand",
            }),
            None => Err(QueryError::UnexpectedEnd("an operand")),
        }
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "lrt",
    about = "Manage PiCaS processing tokens",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Where the tokens live.
#[derive(Args, Debug, Default, Clone)]
pub struct StoreArgs {
    /// Path to lrt.toml (defaults to ./lrt.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// CouchDB server URL
    #[arg(long, env = "PICAS_URL", global = true)]
    pub url: Option<String>,

    /// Database name
    #[arg(long, env = "PICAS_DB", global = true)]
    pub db: Option<String>,

    /// CouchDB user
    #[arg(long, env = "PICAS_USR", global = true)]
    pub user: Option<String>,

    /// CouchDB password
    #[arg(long, env = "PICAS_USR_PWD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Use an embedded database file instead of a server
    #[arg(long, global = true)]
    pub local: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter lrt.toml
    Init {
        /// Database name to put in the file
        #[arg(long, default_value = "tokens")]
        database: String,
        /// Output path
        #[arg(long, default_value = "lrt.toml")]
        path: PathBuf,
    },
    /// Manage the views of a token type
    Views {
        /// Token type
        #[arg(short = 't', long = "type")]
        token_type: String,
        #[command(subcommand)]
        action: ViewsAction,
    },
    /// Create, list and batch-edit tokens
    Tokens {
        /// Token type
        #[arg(short = 't', long = "type")]
        token_type: String,
        #[command(subcommand)]
        action: TokensAction,
    },
    /// Archive every token of a type to disk
    Archive {
        /// Token type
        #[arg(short = 't', long = "type")]
        token_type: String,
        /// Output directory (defaults to [archive].dir or .)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Zip the archive directory
        #[arg(long)]
        compress: bool,
        /// Delete the archived tokens from the database
        #[arg(long)]
        delete: bool,
    },
    /// Delete every token and the design document of a type
    Purge {
        /// Token type
        #[arg(short = 't', long = "type")]
        token_type: String,
    },
    /// List the design documents in the database
    DesignDocs,
}

#[derive(Subcommand)]
enum ViewsAction {
    /// Install the status views (todo, locked, done, error) and the overview
    Install,
    /// Add a filter view
    Add {
        name: String,
        /// Condition over `doc`, e.g. "doc.lock > 0"
        condition: String,
        /// Emitted key expression
        #[arg(long, default_value = "doc._id")]
        key: String,
        /// Emitted value expression
        #[arg(long, default_value = "doc._id")]
        value: String,
    },
    /// List installed views
    List,
    /// Delete one view, or all of them
    Delete {
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum TokensAction {
    /// Create a token from a JSON token configuration
    Create {
        /// Token configuration file
        file: PathBuf,
        /// Id suffix: the token id becomes t_{type}_{suffix}
        #[arg(long)]
        suffix: String,
        /// File to attach to the new token
        #[arg(long, requires = "name")]
        attach: Option<PathBuf>,
        /// Attachment name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the rows of a view
    List { view: String },
    /// Print per-state token counts
    Overview,
    /// Put the tokens of a view back to todo
    Reset {
        view: String,
        /// Also drop their attachments
        #[arg(long)]
        del_attach: bool,
    },
    /// Lock the tokens of a view and set their status
    SetStatus { view: String, status: String },
    /// Delete the tokens of a view
    Delete { view: String },
    /// Download one attachment of a token
    Attachment {
        id: String,
        name: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lrt=info".parse()?))
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { database, path } => commands::init::init(&path, &database),
        Commands::Views { token_type, action } => {
            let settings = commands::store::Settings::load(&cli.store)?;
            let handler = commands::store::handler(&settings, &token_type)?;
            match action {
                ViewsAction::Install => commands::views::install(handler).await,
                ViewsAction::Add {
                    name,
                    condition,
                    key,
                    value,
                } => commands::views::add(handler, &name, &condition, (&key, &value)).await,
                ViewsAction::List => commands::views::list(handler).await,
                ViewsAction::Delete { name } => commands::views::delete(handler, name.as_deref()).await,
            }
        }
        Commands::Tokens { token_type, action } => {
            let settings = commands::store::Settings::load(&cli.store)?;
            let handler = commands::store::handler(&settings, &token_type)?;
            match action {
                TokensAction::Create {
                    file,
                    suffix,
                    attach,
                    name,
                } => {
                    let attachment = attach.as_deref().zip(name.as_deref());
                    commands::tokens::create(handler, &file, &suffix, attachment).await
                }
                TokensAction::List { view } => commands::tokens::list(handler, &view).await,
                TokensAction::Overview => commands::tokens::overview(handler).await,
                TokensAction::Reset { view, del_attach } => {
                    commands::tokens::reset(handler, &view, del_attach).await
                }
                TokensAction::SetStatus { view, status } => {
                    commands::tokens::set_status(handler, &view, &status).await
                }
                TokensAction::Delete { view } => commands::tokens::delete(handler, &view).await,
                TokensAction::Attachment { id, name, dir } => {
                    commands::tokens::attachment(handler, &id, &name, &dir).await
                }
            }
        }
        Commands::Archive {
            token_type,
            dir,
            compress,
            delete,
        } => {
            let settings = commands::store::Settings::load(&cli.store)?;
            let dir = dir.unwrap_or_else(|| settings.archive_dir());
            let compress = compress || settings.archive_compress();
            let handler = commands::store::handler(&settings, &token_type)?;
            commands::archive::archive(handler, &dir, compress, delete).await
        }
        Commands::Purge { token_type } => {
            let settings = commands::store::Settings::load(&cli.store)?;
            commands::archive::purge(settings.open()?, &token_type).await
        }
        Commands::DesignDocs => {
            let settings = commands::store::Settings::load(&cli.store)?;
            commands::views::design_docs(settings.open()?).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_store_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "lrt", "tokens", "-t", "pref_cal", "list", "todo", "--local", "/tmp/t.redb",
        ])
        .unwrap();
        assert_eq!(cli.store.local, Some(PathBuf::from("/tmp/t.redb")));
        match cli.command {
            Commands::Tokens {
                token_type,
                action: TokensAction::List { view },
            } => {
                assert_eq!(token_type, "pref_cal");
                assert_eq!(view, "todo");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn attach_requires_name() {
        let parsed = Cli::try_parse_from([
            "lrt", "tokens", "-t", "job", "create", "t.json", "--suffix", "1", "--attach", "srm.txt",
        ]);
        assert!(parsed.is_err());
    }
}

//! Couchlet administration CLI

mod input;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use couchlet_core::{
    AllDocsOptions, BulkDocsOptions, Change, ChangesOptions, Database, DatabaseConfig, DbError, GetOptions,
    RevisionId,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "couchlet")]
#[command(author = "Couchlet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and edit a couchlet document database")]
struct Cli {
    #[command(flatten)]
    target: Target,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// Database config file (JSON)
    #[arg(short, long, global = true, conflicts_with = "db")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true, default_value = "couchlet.sqlite")]
    db: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show database information
    Info,

    /// Create or update a document given as JSON
    Put { doc: String },

    /// Create a document under a generated id
    Post { doc: String },

    /// Read a document
    Get {
        id: String,
        #[arg(long)]
        rev: Option<String>,
        /// Include the revision history
        #[arg(long)]
        revs: bool,
        #[arg(long)]
        revs_info: bool,
        #[arg(long)]
        conflicts: bool,
        /// Inline attachment bodies
        #[arg(long)]
        attachments: bool,
    },

    /// Delete a document
    Remove { id: String, rev: String },

    /// Write a batch of documents from a file (`-` for stdin)
    BulkDocs {
        file: String,
        /// Store supplied revisions as-is (replication mode)
        #[arg(long)]
        no_new_edits: bool,
    },

    /// List documents by id
    AllDocs {
        #[arg(long)]
        include_docs: bool,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        startkey: Option<String>,
        #[arg(long)]
        endkey: Option<String>,
        /// Fetch these ids only (repeatable)
        #[arg(long = "key")]
        keys: Vec<String>,
        #[arg(long)]
        conflicts: bool,
    },

    /// List changes, optionally following new commits
    Changes {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        include_docs: bool,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        conflicts: bool,
        /// Keep running and print each new change as it commits
        #[arg(short, long)]
        follow: bool,
    },

    /// Attach a file to a document
    PutAttachment {
        id: String,
        name: String,
        file: String,
        #[arg(long)]
        rev: Option<String>,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },

    /// Write an attachment's bytes to stdout
    GetAttachment {
        id: String,
        name: String,
    },

    /// Delete the database and all its data
    Destroy,
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn open(target: &Target) -> Result<Database> {
    let config = match &target.config {
        Some(path) => DatabaseConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => DatabaseConfig::sqlite(&target.db),
    };
    Ok(Database::open(config)?)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_rev(text: &str) -> Result<RevisionId> {
    Ok(RevisionId::parse(text)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<DbError>() {
            Some(db_err) => {
                println!("{}", serde_json::to_string_pretty(&db_err.to_json())?);
                std::process::exit(1);
            }
            None => Err(e),
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let db = open(&cli.target)?;

    match cli.command {
        Commands::Info => print_json(&db.info().await?)?,

        Commands::Put { doc } => print_json(&db.put(input::parse_doc(&doc)?).await?)?,

        Commands::Post { doc } => print_json(&db.post(input::parse_doc(&doc)?).await?)?,

        Commands::Get {
            id,
            rev,
            revs,
            revs_info,
            conflicts,
            attachments,
        } => {
            let options = GetOptions {
                rev: rev.as_deref().map(parse_rev).transpose()?,
                revs,
                revs_info,
                conflicts,
                attachments,
            };
            print_json(&db.get(&id, options).await?)?;
        }

        Commands::Remove { id, rev } => print_json(&db.remove(&id, &parse_rev(&rev)?).await?)?,

        Commands::BulkDocs { file, no_new_edits } => {
            let docs = input::parse_batch(&input::read_source(&file)?)?;
            let outcomes = db
                .bulk_docs(docs, BulkDocsOptions { new_edits: !no_new_edits })
                .await?;
            let json: Vec<Value> = outcomes.iter().map(|o| o.to_json()).collect();
            print_json(&json)?;
        }

        Commands::AllDocs {
            include_docs,
            descending,
            startkey,
            endkey,
            keys,
            conflicts,
        } => {
            let options = AllDocsOptions {
                startkey,
                endkey,
                descending,
                keys: (!keys.is_empty()).then_some(keys),
                include_docs,
                conflicts,
                ..Default::default()
            };
            print_json(&db.all_docs(options).await?)?;
        }

        Commands::Changes {
            since,
            include_docs,
            descending,
            conflicts,
            follow,
        } => {
            let options = ChangesOptions {
                since,
                descending,
                include_docs,
                conflicts,
                ..Default::default()
            };
            if follow {
                let feed = db
                    .subscribe_changes(
                        options,
                        Arc::new(|change: &Change| match serde_json::to_string(change) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::warn!("Failed to print change {}: {}", change.id, e),
                        }),
                    )
                    .await?;
                tokio::signal::ctrl_c().await?;
                feed.cancel();
                tracing::info!("Stopped following at seq {}", feed.last_seq());
            } else {
                print_json(&db.changes(options).await?)?;
            }
        }

        Commands::PutAttachment {
            id,
            name,
            file,
            rev,
            content_type,
        } => {
            let data = Bytes::from(input::read_source(&file)?);
            let rev = rev.as_deref().map(parse_rev).transpose()?;
            let update = db
                .put_attachment(&id, rev.as_ref(), &name, data, &content_type)
                .await?;
            print_json(&update)?;
        }

        Commands::GetAttachment { id, name } => {
            let bytes = db.get_attachment(&id, &name).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }

        Commands::Destroy => {
            let name = db.name().to_string();
            db.destroy().await?;
            println!("Database {} destroyed", name);
        }
    }

    Ok(())
}

//! mneme CLI — export, import, and maintenance access to a fact store file.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mneme::db::FactStore;
use mneme::embed::OllamaEmbedder;
use mneme::tools::ToolHandler;
use mneme::transfer::{self, ImportOpts};

#[derive(Parser)]
#[command(name = "mneme", version, about = "Persistent hybrid-search fact store for long-running agents")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export all facts (every namespace, superseded included) to JSON
    Export {
        /// Path to the fact store database
        #[arg(long, env = "MNEME_DB")]
        db: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<String>,
    },
    /// Import facts from a JSON export
    Import {
        #[arg(long, env = "MNEME_DB")]
        db: String,
        /// Skip facts that already exist in the target
        #[arg(long)]
        skip_duplicates: bool,
        /// Export file to read
        file: String,
    },
    /// Generate embeddings for facts that don't have one yet
    Embed {
        #[arg(long, env = "MNEME_DB")]
        db: String,
        #[arg(long, env = "MNEME_NAMESPACE", default_value = "")]
        namespace: String,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Base URL of the embedding service
        #[arg(long, env = "MNEME_EMBED_URL", default_value = "http://localhost:11434")]
        embed_url: String,
        #[arg(long, env = "MNEME_EMBED_MODEL", default_value = "embeddinggemma")]
        embed_model: String,
    },
    /// Show active fact count with category and subject breakdowns
    Status {
        #[arg(long, env = "MNEME_DB")]
        db: String,
        #[arg(long, env = "MNEME_NAMESPACE", default_value = "")]
        namespace: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn open_existing(path: &str) -> Result<mneme::SqlitePool, Box<dyn std::error::Error>> {
    if !std::path::Path::new(path).exists() {
        return Err(format!("database not found: {path}").into());
    }
    Ok(FactStore::open_pool(path)?)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();

    match args.command {
        Command::Export { db, output } => {
            let pool = open_existing(&db)?;
            let data = transfer::export(&pool, &cancel)?;
            let buf = serde_json::to_string_pretty(&data)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &buf)?;
                    eprintln!("Exported {} facts to {path}", data.facts.len());
                }
                None => {
                    println!("{buf}");
                    eprintln!("Exported {} facts", data.facts.len());
                }
            }
        }
        Command::Import { db, skip_duplicates, file } => {
            let raw = std::fs::read_to_string(&file)?;
            let data: transfer::ExportData = serde_json::from_str(&raw)?;
            let pool = FactStore::open_pool(&db)?;
            let outcome = transfer::import(&pool, &data, &ImportOpts { skip_duplicates }, &cancel)?;
            println!(
                "Imported {} facts, skipped {} duplicates.",
                outcome.imported, outcome.skipped
            );
        }
        Command::Embed { db, namespace, batch_size, embed_url, embed_model } => {
            let pool = open_existing(&db)?;
            let embedder = Arc::new(OllamaEmbedder::new(embed_url, embed_model));
            let store = FactStore::new(pool, Some(embedder), namespace)?;
            let embedded = store.embed_facts(batch_size, &cancel)?;
            println!("Embedded {embedded} facts.");
        }
        Command::Status { db, namespace } => {
            let pool = open_existing(&db)?;
            let store = FactStore::new(pool, None, namespace)?;
            let out = ToolHandler::new(Arc::new(store)).status();
            if out.is_error {
                return Err(out.text.into());
            }
            print!("{}", out.text);
        }
    }

    Ok(())
}

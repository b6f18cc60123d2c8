use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use medquery_core::{shape, QueryIntent, SchemaDescriptor, SchemaRegistry};
use medquery_storage::{InMemoryStore, QueryEngine};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medquery")]
#[command(about = "MedQuery admin CLI", long_about = None)]
struct Cli {
    /// Debug-level logs on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print a collection's canonical fields and aliases.
    Schema { collection: String },
    /// Compile an intent file and print the store query without running it.
    Compile { collection: String, intent: PathBuf },
    /// Run an intent file against a JSON dataset held in memory.
    Run {
        collection: String,
        intent: PathBuf,
        /// Either `{collection: [documents]}` or a bare array of documents.
        #[arg(long)]
        data: PathBuf,
        /// Print the raw outcome instead of the rendered table.
        #[arg(long)]
        json: bool,
    },
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn lookup(registry: &SchemaRegistry, collection: &str) -> Result<Arc<SchemaDescriptor>> {
    registry.get(collection).ok_or_else(|| {
        let known: Vec<&str> = registry.iter().map(|s| s.collection()).collect();
        anyhow!("unknown collection {collection}; known: {}", known.join(", "))
    })
}

fn load_dataset(store: &InMemoryStore, schema: &SchemaDescriptor, data: Value) -> Result<usize> {
    let seed = if data.is_array() {
        let mut m = serde_json::Map::new();
        m.insert(schema.collection().to_string(), data);
        Value::Object(m)
    } else {
        data
    };
    Ok(store.load(&seed)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .init();

    let registry = SchemaRegistry::builtin()?;
    match cli.cmd {
        Cmd::Schema { collection } => {
            let schema = lookup(&registry, &collection)?;
            println!("{}", serde_json::to_string_pretty(&*schema)?);
        }
        Cmd::Compile { collection, intent } => {
            let schema = lookup(&registry, &collection)?;
            let intent = QueryIntent::from_value(&read_json(&intent)?)?;
            for w in &intent.warnings {
                tracing::warn!("{}", w);
            }
            let store = Arc::new(InMemoryStore::new());
            let compiled = QueryEngine::new(store, registry.clone()).compile(&schema, &intent);
            println!("{}", serde_json::to_string_pretty(&compiled.to_json())?);
        }
        Cmd::Run {
            collection,
            intent,
            data,
            json,
        } => {
            let schema = lookup(&registry, &collection)?;
            let raw = read_json(&intent)?;
            let store = InMemoryStore::new();
            let loaded = load_dataset(&store, &schema, read_json(&data)?)?;
            tracing::debug!(loaded, collection = schema.collection(), "dataset loaded");
            let engine = QueryEngine::new(Arc::new(store), registry.clone());
            let outcome = engine.execute_value(&schema, &raw).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
            } else {
                println!("{}", shape(&outcome.result).render());
            }
            if outcome.result.is_error() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

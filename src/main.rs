//! CLI for pgvecs collections

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pgvecs::{
    Client, ClientConfig, DistanceMeasure, Filter, HnswArgs, HybridSearchSettings, IndexArgs,
    IndexMethod, IvfFlatArgs, QueryOptions, Record, Vector,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pgvecs")]
#[command(about = "Vector collections and hybrid search on PostgreSQL", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the collections
    #[arg(long, env = "PGVECS_SCHEMA", default_value = "vecs")]
    schema: String,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a collection
    Create {
        name: String,
        dimension: usize,
        /// Succeed if it already exists with the same dimension
        #[arg(long)]
        if_not_exists: bool,
    },
    /// List collections
    List,
    /// Drop a collection with all its records and indexes
    Drop { name: String },
    /// Show dimension, size and index of a collection
    Describe { name: String },
    /// Upsert records from a JSON-lines file
    Upsert { name: String, file: PathBuf },
    /// Print records by fragment id
    Fetch {
        name: String,
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Delete records by id or by filter
    Delete {
        name: String,
        /// Comma-separated fragment ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<Uuid>,
        /// JSON filter expression
        #[arg(long)]
        filter: Option<String>,
    },
    /// Nearest neighbours of a vector
    Query {
        name: String,
        /// Query vector as comma-separated values (e.g., "1.0,0.0,0.5")
        vector: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        #[arg(long, default_value = "cosine")]
        measure: DistanceMeasure,
        /// JSON filter expression
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        include_value: bool,
        #[arg(long)]
        include_metadata: bool,
        #[arg(long, default_value = "10")]
        probes: u32,
        #[arg(long, default_value = "40")]
        ef_search: u32,
    },
    /// Hybrid lexical and semantic search
    Search {
        name: String,
        text: String,
        /// Query vector as comma-separated values
        vector: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        #[arg(long, default_value = "1.0")]
        full_text_weight: f64,
        #[arg(long, default_value = "5.0")]
        semantic_weight: f64,
        #[arg(long, default_value = "50")]
        rrf_k: u32,
        #[arg(long, default_value = "cosine")]
        measure: DistanceMeasure,
        /// JSON filter expression
        #[arg(long)]
        filter: Option<String>,
    },
    /// Build the ANN index of a collection
    CreateIndex {
        name: String,
        #[arg(long, default_value = "cosine")]
        measure: DistanceMeasure,
        #[arg(long, default_value = "auto")]
        method: IndexMethod,
        /// IVFFlat list count
        #[arg(long)]
        n_lists: Option<u32>,
        /// HNSW connections per node
        #[arg(long)]
        m: Option<u32>,
        /// HNSW build candidate list size
        #[arg(long)]
        ef_construction: Option<u32>,
        /// Fail instead of replacing an existing index
        #[arg(long)]
        no_replace: bool,
    },
    /// Drop the ANN index of a collection
    DropIndex { name: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "pgvecs=debug" } else { "pgvecs=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_filter(raw: Option<&str>) -> Result<Option<Filter>> {
    raw.map(|raw| -> Result<Filter> {
        let expr: serde_json::Value = serde_json::from_str(raw).context("filter is not valid JSON")?;
        Ok(Filter::compile(&expr)?)
    })
    .transpose()
}

fn build_args(n_lists: Option<u32>, m: Option<u32>, ef_construction: Option<u32>) -> Result<Option<IndexArgs>> {
    let hnsw = m.is_some() || ef_construction.is_some();
    match (n_lists, hnsw) {
        (Some(_), true) => bail!("--n-lists cannot be combined with --m or --ef-construction"),
        (Some(n_lists), false) => Ok(Some(IndexArgs::IvfFlat(IvfFlatArgs { n_lists }))),
        (None, true) => {
            let defaults = HnswArgs::default();
            Ok(Some(IndexArgs::Hnsw(HnswArgs {
                m: m.unwrap_or(defaults.m),
                ef_construction: ef_construction.unwrap_or(defaults.ef_construction),
            })))
        }
        (None, false) => Ok(None),
    }
}

async fn read_records(path: &Path) -> Result<Vec<Record>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))
        })
        .collect()
}

async fn run(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            dimension,
            if_not_exists,
        } => {
            if if_not_exists {
                client.get_or_create_collection(&name, dimension).await?;
            } else {
                client.create_collection(&name, dimension).await?;
            }
            println!("Collection {} ready (dimension {})", name, dimension);
        }
        Commands::List => {
            let names = client.list_collections().await?;
            if names.is_empty() {
                println!("No collections in schema {}", client.config().schema);
            } else {
                println!("Collections ({} total):", names.len());
                for name in names {
                    println!("  - {}", name);
                }
            }
        }
        Commands::Drop { name } => {
            client.delete_collection(&name).await?;
            println!("Dropped collection {}", name);
        }
        Commands::Describe { name } => {
            let collection = client.get_collection(&name).await?;
            println!("Collection: {}", collection.name());
            println!("Dimension:  {}", collection.dimension());
            println!("Records:    {}", collection.len().await?);
            match collection.index().await? {
                Some(index) => println!("Index:      {} ({}, {})", index.name, index.method, index.measure),
                None => println!("Index:      none"),
            }
        }
        Commands::Upsert { name, file } => {
            let collection = client.get_collection(&name).await?;
            let records = read_records(&file).await?;
            collection.upsert(&records).await?;
            println!("Upserted {} records into {}", records.len(), name);
        }
        Commands::Fetch { name, ids } => {
            let collection = client.get_collection(&name).await?;
            for record in collection.fetch(&ids).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Delete { name, ids, filter } => {
            let collection = client.get_collection(&name).await?;
            let filter = parse_filter(filter.as_deref())?;
            let ids = (!ids.is_empty()).then_some(ids);
            let deleted = collection.delete(ids.as_deref(), filter.as_ref()).await?;
            println!("Deleted {} records from {}", deleted.len(), name);
            for fragment in deleted.values() {
                println!("{}", serde_json::to_string(fragment)?);
            }
        }
        Commands::Query {
            name,
            vector,
            limit,
            measure,
            filter,
            include_value,
            include_metadata,
            probes,
            ef_search,
        } => {
            let collection = client.get_collection(&name).await?;
            let mut options = QueryOptions::default()
                .with_limit(limit)
                .with_measure(measure)
                .include_value(include_value)
                .include_metadata(include_metadata)
                .with_probes(probes)
                .with_ef_search(ef_search);
            if let Some(filter) = parse_filter(filter.as_deref())? {
                options = options.with_filters(filter);
            }
            let results = collection.query(&Vector::from_str(&vector)?, &options).await?;
            if results.is_empty() {
                println!("No results found");
            }
            for result in results {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Commands::Search {
            name,
            text,
            vector,
            limit,
            full_text_weight,
            semantic_weight,
            rrf_k,
            measure,
            filter,
        } => {
            let collection = client.get_collection(&name).await?;
            let settings = HybridSearchSettings::default()
                .with_weights(full_text_weight, semantic_weight)
                .with_rrf_k(rrf_k)
                .with_measure(measure);
            let filter = parse_filter(filter.as_deref())?;
            let results = collection
                .search(&text, &Vector::from_str(&vector)?, limit, &settings, filter.as_ref())
                .await?;
            if results.is_empty() {
                println!("No results found");
            }
            for result in results {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Commands::CreateIndex {
            name,
            measure,
            method,
            n_lists,
            m,
            ef_construction,
            no_replace,
        } => {
            let collection = client.get_collection(&name).await?;
            let args = build_args(n_lists, m, ef_construction)?;
            let info = collection.create_index(measure, method, args, !no_replace).await?;
            println!("Built index {} ({}, {})", info.name, info.method, info.measure);
        }
        Commands::DropIndex { name } => {
            let collection = client.get_collection(&name).await?;
            collection.drop_index().await?;
            println!("Dropped index of {}", name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ClientConfig::new(cli.database_url).with_schema(cli.schema);
    let client = Client::connect(config).await?;
    let outcome = run(&client, cli.command).await;
    client.close().await;
    outcome
}

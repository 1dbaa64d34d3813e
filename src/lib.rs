//! # pgvecs
//!
//! Vector collections and hybrid search on PostgreSQL with pgvector.
//!
//! This library provides:
//! - Collections of fixed-dimension vector fragments with text and JSON metadata
//! - Upsert, fetch, filtered delete and similarity queries
//! - A typed filter language compiled to SQL predicates
//! - IVFFlat and HNSW index management, safe under concurrent DDL
//! - Hybrid lexical and semantic search with reciprocal rank fusion
//!
//! ## Example
//!
//! ```no_run
//! use pgvecs::{Client, ClientConfig, QueryOptions, Record, Vector};
//! use uuid::Uuid;
//!
//! # async fn run() -> pgvecs::Result<()> {
//! let client = Client::connect(ClientConfig::from_env()?).await?;
//! let docs = client.get_or_create_collection("docs", 3).await?;
//!
//! let record = Record::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Vector::new(vec![1.0, 0.0, 0.0]))
//!     .with_text("hello world");
//! docs.upsert(&[record]).await?;
//!
//! let hits = docs
//!     .query(&Vector::new(vec![1.0, 0.0, 0.0]), &QueryOptions::default().with_limit(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod collection;
pub mod config;
pub mod distance;
pub mod error;
pub mod filter;
pub mod hybrid;
pub mod index;
pub mod record;
pub mod retry;
pub mod schema;
pub mod vector;

pub use client::Client;
pub use collection::Collection;
pub use config::ClientConfig;
pub use distance::DistanceMeasure;
pub use error::{IndexBuildError, Result, SchemaError, VecsError};
pub use filter::Filter;
pub use hybrid::{HybridSearchEngine, HybridSearchResult, HybridSearchSettings};
pub use index::{HnswArgs, IndexArgs, IndexInfo, IndexManager, IndexMethod, IvfFlatArgs};
pub use record::{DeletedFragment, Metadata, QueryOptions, QueryResult, Record};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use schema::{CollectionSchema, SchemaManager};
pub use vector::Vector;

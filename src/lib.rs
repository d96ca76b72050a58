//! segdex - a segment-based full-text search engine for documentation.
//!
//! Documents are analyzed into an immutable [`Segment`] of postings, saved
//! as a single SQLite file, and searched with BM25 plus phrase proximity,
//! field boosts, synonym, fuzzy and prefix expansion.
//!
//! # Quick start
//!
//! ```no_run
//! use segdex::{
//!     EngineConfig, SegmentSearchIndex, SegmentStore, indexer,
//!     schema::Schema, writer::Document,
//! };
//!
//! let root = std::path::Path::new("/tmp/segdex-demo");
//! let store = SegmentStore::open(root).unwrap();
//! let docs = vec![
//!     Document::new()
//!         .with("url", "/webhooks")
//!         .with("title", "Webhooks")
//!         .with("body", "Configure webhook retries."),
//! ];
//! indexer::index_documents(&store, Schema::documentation(), docs).unwrap();
//!
//! let index = SegmentSearchIndex::open(root, EngineConfig::default()).unwrap();
//! for r in index.search("webhook retry", 10).unwrap().results {
//!     println!("{} (score: {:.3})", r.url, r.relevance_score);
//! }
//! ```

pub mod analyzer;
pub mod bloom;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod fuzzy;
pub mod indexer;
pub mod markdown;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod ranker;
pub mod schema;
pub mod scoring;
pub mod search;
pub mod segment_id;
pub mod simd;
pub mod snippet;
pub mod store;
pub mod synonyms;
pub mod writer;

pub use config::{EngineConfig, SettingsDb};
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use metrics::SearchMetrics;
pub use query::{QueryAnalyzer, SearchQuery};
pub use ranker::{Ranker, RankerStrategy};
pub use schema::Schema;
pub use search::{
    SearchOptions, SearchResponse, SearchResult, SegmentSearchIndex,
    search_documents,
};
pub use segment_id::SegmentId;
pub use store::SegmentStore;
pub use writer::{Document, Segment, SegmentWriter};

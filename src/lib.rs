//! Pinakes builds and maintains a personal, searchable index of AT Protocol
//! posts a user "might have seen": posts they authored, liked or reposted,
//! posts by accounts they follow, and the surrounding conversational context
//! (threads, ancestors, descendants, quoted posts).
//!
//! The index lives in a single embedded SQLite file and supports both
//! substring and vector-similarity search.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                CLI layer                    │
//! ├─────────────────────────────────────────────┤
//! │  Backfill engine (queues, expansion policy) │
//! ├──────────────┬──────────────┬───────────────┤
//! │  RPC manager │ Repo decoder │   Embedder    │
//! ├──────────────┴──────────────┴───────────────┤
//! │        Store (schema, upserts, search)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backfill`]: the crawler (repo, post and embedding queues)
//! - [`cli`]: command-line interface
//! - [`embedder`]: lazy batched text embeddings
//! - [`explain`]: inclusion-reason trees
//! - [`queue`]: bounded-concurrency task queue
//! - [`records`]: typed AT Protocol records
//! - [`repo`]: CAR + Merkle-search-tree decoding
//! - [`rpc`]: retrying rate-limited XRPC clients
//! - [`search`]: search request assembly
//! - [`store`]: the embedded database

pub mod backfill;
pub mod cli;
pub mod config;
pub mod embedder;
pub mod errors;
pub mod explain;
pub mod logging;
pub mod models;
pub mod progress;
pub mod queue;
pub mod records;
pub mod repo;
pub mod rpc;
pub mod search;
pub mod store;

pub use backfill::BackfillEngine;
pub use backfill::BackfillOptions;
pub use errors::PinakesError;
pub use errors::Result;
pub use models::InclusionReason;
pub use models::Post;
pub use store::Store;

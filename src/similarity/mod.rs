//! Visual similarity search over the archive.
//!
//! # Architecture
//!
//! - `identity`: name -> content-addressable identifier
//! - `embeddings`: image embedding boundary, fastembed implementation
//! - `batch`: lazy batch embedding with explicit skip tracking
//! - `index`: in-memory exact k-NN index
//! - `storage`: binary file I/O for vectors.bin persistence
//! - `store`: durable, lock-protected index used by the app
//! - `sync`: corpus -> index reconciliation
//! - `query`: query image -> ranked neighbours

pub mod batch;
pub mod embeddings;
pub mod identity;
pub mod index;
pub mod query;
mod storage;
pub mod store;
pub mod sync;

pub use embeddings::{EmbeddingError, FastembedImageModel, ImageEmbedder};
pub use identity::{identifier, CorpusItem};
pub use index::{EntryMetadata, IndexEntry, IndexError, Metric, Neighbor};
pub use query::{QueryError, QueryService, DEFAULT_K};
pub use storage::VectorStorageError;
pub use store::{StoreError, VectorStore};
pub use sync::{CancelFlag, IndexSynchronizer, SyncError, SyncProgress, SyncReport};

/// Default embedding model
pub const DEFAULT_MODEL: &str = "resnet50";

//! Retrieval over imported documents.
//!
//! - `RagEngine`: imports chunked, embedded sections and searches them
//! - `Retriever`: the capability the orchestrator depends on
//! - `import_source_dir`: import of the source directory
//! - `SourceImport`: runs that import once, retried from retrieval until it succeeds

mod chunking;
mod context;
mod engine;
mod importer;
mod policy;

pub use chunking::TextChunking;
pub use context::compose_grounded_prompt;
pub use engine::{DataSource, PartitionSimilarity, RagEngine, Retriever};
pub use importer::{import_source_dir, ImportSummary, SourceImport};
pub use policy::RetrievalPolicy;

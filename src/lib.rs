//! corpusflow — a distributed document-processing pipeline: a Postgres-backed
//! work queue with exactly-once claim semantics, a run coordinator that gives
//! every configuration a deterministic identity, and a domain-ontology
//! evaluator that maps parsed document elements onto domain terms and
//! discovers relationships between them.

pub mod config;
pub mod content_source;
pub mod contracts;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod observability;
pub mod ontology;
pub mod queue;
pub mod relationships;
pub mod run_coordinator;
pub mod storage;
pub mod worker;

pub use config::PipelineConfig;
pub use contracts::{EmbeddingProvider, Storage};
pub use coordinator::ProcessingCoordinator;
pub use error::{BackendCapability, PipelineError, UnsupportedSearchError};
pub use observability::{init_logging, init_logging_with_level};
pub use ontology::{DomainOntology, OntologyLoader, OntologyManager};
pub use queue::{DeadLetterQueue, PostgresWorkQueue, WorkQueue};
pub use relationships::DomainRelationshipDetector;
pub use run_coordinator::RunCoordinator;
pub use storage::PostgresStorage;
pub use worker::DocumentProcessor;

//! Domain ontology: declarative model, loader, and evaluator.

pub mod evaluator;
pub mod loader;
pub mod model;

pub use evaluator::OntologyEvaluator;
pub use loader::{OntologyLoader, OntologyManager};
pub use model::DomainOntology;

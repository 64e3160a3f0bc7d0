//! Cross-element and cross-document relationship detection driven by an
//! active domain ontology.

pub mod domain;

pub use domain::DomainRelationshipDetector;

//! runnerset - declarative self-hosted CI runner scale sets on a local cluster
//!
//! Users declare runner installations (repository, credentials, container
//! mode, caches, replica bounds). Every reconcile pass expands them into
//! instances, compiles each instance into a Kubernetes manifest from embedded
//! templates, and converges a kind-hosted cluster onto exactly that set.
//!
//! # Modules
//!
//! - [`installation`] - Installation declarations, validation and expansion into instances
//! - [`template`] - Base templates, data values, mode overlays and the compiler
//! - [`cluster`] - Cluster seams: manifest apply/delete/list, CRD probe, kind lifecycle
//! - [`bootstrap`] - Runner controller bootstrap state machine
//! - [`reconcile`] - Convergence of deployed apps onto the stored installations
//! - [`store`] - Installation storage (file-backed and in-memory)
//! - [`config`] - Runtime settings
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod installation;
pub mod reconcile;
pub mod store;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Integration tests on a kind hosting cluster
//!
//! - `cluster_access`: provisioning the cluster and the app record
//!   round-trip through the API server
//! - `runner_lifecycle`: controller bootstrap and convergence of runner
//!   installations

mod cluster_access;
mod helpers;
mod runner_lifecycle;

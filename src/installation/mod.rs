//! Runner installations and the instances they expand into
//!
//! An [`InstallationSpec`] is what the user declares and the config store
//! keeps. Every reconcile pass expands it into one or more [`InstanceSpec`]s
//! with [`expand`]; instances are never persisted.

mod instance;
mod types;

pub use instance::{expand, InstanceCacheMount, InstanceSpec};
pub use types::{
    validate_name, AuthMethod, AuthSpec, CacheMount, CacheSource, ContainerMode,
    InstallationSpec, AUTO_CACHE_SOURCE, MAX_INSTANCES, MAX_NAME_LEN, RESERVED_CACHE_TARGETS,
};

pub(crate) use types::check_cache_target;

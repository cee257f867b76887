//! Template compilation for runner instances
//!
//! Turns one [`InstanceSpec`](crate::installation::InstanceSpec) into a
//! [`Manifest`] without touching the cluster:
//!
//! 1. select the base template for the container mode
//! 2. build the data values the base slots bind from
//! 3. render the base with `${...}` slots, each bound as a whole YAML node
//! 4. apply exactly one [`ModeOverlay`] to the runner pod template
//! 5. serialize the documents in order
//!
//! Compilation is pure and deterministic. Compiling the same instance twice
//! yields byte-identical output.

mod base;
mod compiler;
mod engine;
mod error;
mod manifest;
mod overlay;
mod values;

pub use base::{select_base, BaseTemplate, CONTROLLER_TEMPLATE, DIND_BASE, KUBERNETES_BASE};
pub use compiler::TemplateCompiler;
pub use engine::{parse_documents, TemplateEngine};
pub use error::{CompileError, CompileErrorKind};
pub use manifest::Manifest;
pub use overlay::{
    ModeOverlay, DIND_CONTAINER, DIND_SOCKET_VOLUME, HOOK_EXTENSION_VOLUME, RUNNER_CONTAINER,
    RUNNER_FS_GROUP, RUNNER_SET_KIND,
};
pub use values::{
    build_controller_values, build_data_values, AuthValues, CacheMountValues, ControllerValues,
    DataValues, ANNOTATION_CONTAINER_MODE, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME,
    LABEL_ORDINAL, MANAGED_BY,
};

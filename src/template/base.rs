//! Base templates embedded at compile time

use crate::installation::ContainerMode;

/// A named base document template
#[derive(Debug, PartialEq, Eq)]
pub struct BaseTemplate {
    /// Template name used in error locations
    pub name: &'static str,
    /// Template source
    pub source: &'static str,
}

/// Runner scale set with container-hook RBAC (standard and privileged-cached)
pub static KUBERNETES_BASE: BaseTemplate = BaseTemplate {
    name: "runner-set-kubernetes.yaml",
    source: include_str!("../../templates/runner-set-kubernetes.yaml"),
};

/// Runner scale set without cluster permissions (dind)
pub static DIND_BASE: BaseTemplate = BaseTemplate {
    name: "runner-set-dind.yaml",
    source: include_str!("../../templates/runner-set-dind.yaml"),
};

/// Runner controller, its CRDs and namespaces
pub static CONTROLLER_TEMPLATE: BaseTemplate = BaseTemplate {
    name: "controller.yaml",
    source: include_str!("../../templates/controller.yaml"),
};

/// Select the base template for a container mode
pub fn select_base(mode: ContainerMode) -> &'static BaseTemplate {
    match mode {
        ContainerMode::Standard | ContainerMode::PrivilegedCached => &KUBERNETES_BASE,
        ContainerMode::Dind => &DIND_BASE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_modes_share_the_kubernetes_base() {
        assert_eq!(select_base(ContainerMode::Standard), &KUBERNETES_BASE);
        assert_eq!(select_base(ContainerMode::PrivilegedCached), &KUBERNETES_BASE);
        assert_eq!(select_base(ContainerMode::Dind), &DIND_BASE);
    }

    #[test]
    fn bases_declare_the_runner_container() {
        for base in [&KUBERNETES_BASE, &DIND_BASE] {
            assert!(base.source.contains("kind: AutoscalingRunnerSet"));
            assert!(base.source.contains("- name: runner"));
        }
    }

    #[test]
    fn bases_never_mention_mode_specific_objects() {
        for base in [&KUBERNETES_BASE, &DIND_BASE] {
            assert!(!base.source.contains("hook-extension"));
            assert!(!base.source.contains("privileged"));
            assert!(!base.source.contains("dind-sock"));
        }
    }
}

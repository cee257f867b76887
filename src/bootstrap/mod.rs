//! Runner controller bootstrap
//!
//! The runner controller and its CRDs are cluster-wide singletons every
//! runner scale set depends on. [`ControllerBootstrapper::ensure_ready`]
//! drives a small state machine:
//!
//! ```text
//! Absent ──apply──▶ Installing ──▶ WaitingForReady ──CRD served──▶ Ready
//!    │                  │                  │
//!    │                  └─already exists─▶ AlreadyPresent ──▶ Ready
//!    └─CRD served────────────────────────▶ AlreadyPresent ──▶ Ready
//!                                          WaitingForReady ──budget spent──▶ TimedOut
//! ```
//!
//! Concurrent bootstrappers need no lock: whichever apply loses reports
//! "already exists", which counts as success.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ManifestApplier, SchemaProbe};
use crate::template::TemplateCompiler;
use crate::Error;

/// CRD whose presence signals the controller is ready
pub const CONTROLLER_CRD: &str = "autoscalingrunnersets.actions.github.com";

/// Where the bootstrap state machine is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing observed yet
    Absent,
    /// Controller manifest is being applied
    Installing,
    /// Applied, polling for the CRD
    WaitingForReady,
    /// The controller was already installed
    AlreadyPresent,
    /// CRD is served
    Ready,
    /// The readiness budget ran out
    TimedOut,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Installing => "installing",
            Self::WaitingForReady => "waiting-for-ready",
            Self::AlreadyPresent => "already-present",
            Self::Ready => "ready",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Ensures the runner controller is installed and serving its CRD
pub struct ControllerBootstrapper {
    applier: Arc<dyn ManifestApplier>,
    probe: Arc<dyn SchemaProbe>,
    compiler: Arc<TemplateCompiler>,
    state: Mutex<BootstrapState>,
}

impl ControllerBootstrapper {
    /// Create a bootstrapper
    ///
    /// Poll interval, timeout and controller app name come from the
    /// compiler's settings.
    pub fn new(
        applier: Arc<dyn ManifestApplier>,
        probe: Arc<dyn SchemaProbe>,
        compiler: Arc<TemplateCompiler>,
    ) -> Self {
        Self {
            applier,
            probe,
            compiler,
            state: Mutex::new(BootstrapState::Absent),
        }
    }

    /// Last state reached
    pub fn state(&self) -> BootstrapState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, to: BootstrapState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != to {
            debug!(from = %*state, to = %to, "Bootstrap state change");
            *state = to;
        }
    }

    fn cancelled(&self) -> Error {
        Error::cancelled("controller bootstrap")
    }

    /// Drive the controller to Ready
    ///
    /// Returns [`Error::Timeout`] when the CRD is not served within the
    /// bootstrap timeout and [`Error::Cancelled`] as soon as `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<BootstrapState, Error> {
        self.transition(BootstrapState::Absent);
        if cancel.is_cancelled() {
            return Err(self.cancelled());
        }

        let present = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled()),
            present = self.probe.schema_present(CONTROLLER_CRD) => present?,
        };
        if present {
            info!("Runner controller already present");
            self.transition(BootstrapState::AlreadyPresent);
            self.transition(BootstrapState::Ready);
            return Ok(BootstrapState::Ready);
        }

        self.transition(BootstrapState::Installing);
        let settings = self.compiler.settings();
        let manifest = self.compiler.compile_controller()?;
        info!(app = %settings.controller_app, "Installing runner controller");

        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled()),
            applied = self.applier.apply(&settings.controller_app, manifest.as_bytes()) => applied,
        };
        match applied {
            Ok(()) => {}
            Err(Error::Apply(e)) if e.is_already_exists() => {
                info!("Runner controller installed concurrently; treating as present");
                self.transition(BootstrapState::AlreadyPresent);
                self.transition(BootstrapState::Ready);
                return Ok(BootstrapState::Ready);
            }
            Err(e) => {
                self.transition(BootstrapState::Absent);
                return Err(e);
            }
        }

        self.transition(BootstrapState::WaitingForReady);
        self.wait_for_crd(cancel, settings.poll_interval, settings.bootstrap_timeout)
            .await?;

        info!("Runner controller ready");
        self.transition(BootstrapState::Ready);
        Ok(BootstrapState::Ready)
    }

    async fn wait_for_crd(
        &self,
        cancel: &CancellationToken,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<(), Error> {
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let present = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                present = self.probe.schema_present(CONTROLLER_CRD) => present,
            };
            match present {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(crd = CONTROLLER_CRD, "CRD not served yet"),
                // transient API errors are expected while the controller starts
                Err(e) => debug!(error = %e, "CRD probe failed, retrying"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(waited = ?timeout, "Runner controller did not become ready");
                self.transition(BootstrapState::TimedOut);
                return Err(Error::timeout(format!("CRD {CONTROLLER_CRD}"), now - start));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ApplyCause, ApplyError, MockManifestApplier, MockSchemaProbe};
    use crate::config::Settings;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn compiler(poll: Duration, timeout: Duration) -> Arc<TemplateCompiler> {
        Arc::new(TemplateCompiler::new(
            Settings::default().with_bootstrap_timing(poll, timeout),
        ))
    }

    fn fast_compiler() -> Arc<TemplateCompiler> {
        compiler(Duration::from_millis(5), Duration::from_millis(500))
    }

    /// Probe that reports the CRD once `installed` is set
    fn probe_following(installed: Arc<AtomicBool>) -> MockSchemaProbe {
        let mut probe = MockSchemaProbe::new();
        probe
            .expect_schema_present()
            .returning(move |_| Ok(installed.load(Ordering::SeqCst)));
        probe
    }

    // =========================================================================
    // Story: Fresh Cluster
    // =========================================================================

    #[tokio::test]
    async fn story_fresh_cluster_installs_then_waits_for_crd() {
        let installed = Arc::new(AtomicBool::new(false));
        let mut applier = MockManifestApplier::new();
        let flag = installed.clone();
        applier
            .expect_apply()
            .withf(|app, manifest| {
                app == "runner-controller"
                    && std::str::from_utf8(manifest)
                        .is_ok_and(|m| m.contains(CONTROLLER_CRD))
            })
            .times(1)
            .returning(move |_, _| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let bootstrapper = ControllerBootstrapper::new(
            Arc::new(applier),
            Arc::new(probe_following(installed)),
            fast_compiler(),
        );

        let state = bootstrapper.ensure_ready(&CancellationToken::new()).await.unwrap();
        assert_eq!(state, BootstrapState::Ready);
        assert_eq!(bootstrapper.state(), BootstrapState::Ready);
    }

    #[tokio::test]
    async fn story_crd_appearing_late_is_polled_for() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut probe = MockSchemaProbe::new();
        let counter = polls.clone();
        // absent at the initial check and the first two polls
        probe.expect_schema_present().returning(move |_| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) >= 3)
        });
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(1).returning(|_, _| Ok(()));

        let bootstrapper =
            ControllerBootstrapper::new(Arc::new(applier), Arc::new(probe), fast_compiler());
        bootstrapper.ensure_ready(&CancellationToken::new()).await.unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    // =========================================================================
    // Story: Idempotence
    // =========================================================================

    #[tokio::test]
    async fn story_bootstrapping_twice_applies_once() {
        let installed = Arc::new(AtomicBool::new(false));
        let mut applier = MockManifestApplier::new();
        let flag = installed.clone();
        applier.expect_apply().times(1).returning(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let bootstrapper = ControllerBootstrapper::new(
            Arc::new(applier),
            Arc::new(probe_following(installed)),
            fast_compiler(),
        );

        let cancel = CancellationToken::new();
        assert_eq!(bootstrapper.ensure_ready(&cancel).await.unwrap(), BootstrapState::Ready);
        assert_eq!(bootstrapper.ensure_ready(&cancel).await.unwrap(), BootstrapState::Ready);
    }

    #[tokio::test]
    async fn story_already_exists_on_apply_counts_as_ready() {
        let mut probe = MockSchemaProbe::new();
        probe.expect_schema_present().times(1).returning(|_| Ok(false));
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(1).returning(|app, _| {
            Err(ApplyError::new(app, ApplyCause::AlreadyExists, "409 conflict").into())
        });

        let bootstrapper =
            ControllerBootstrapper::new(Arc::new(applier), Arc::new(probe), fast_compiler());
        let state = bootstrapper.ensure_ready(&CancellationToken::new()).await.unwrap();
        assert_eq!(state, BootstrapState::Ready);
    }

    // =========================================================================
    // Story: Failure Paths
    // =========================================================================

    #[tokio::test]
    async fn story_crd_never_served_times_out() {
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(1).returning(|_, _| Ok(()));

        let bootstrapper = ControllerBootstrapper::new(
            Arc::new(applier),
            Arc::new(probe_following(Arc::new(AtomicBool::new(false)))),
            compiler(Duration::from_millis(5), Duration::from_millis(40)),
        );

        let err = bootstrapper.ensure_ready(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(bootstrapper.state(), BootstrapState::TimedOut);
    }

    #[tokio::test]
    async fn story_apply_failure_is_not_a_timeout() {
        let mut probe = MockSchemaProbe::new();
        probe.expect_schema_present().returning(|_| Ok(false));
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(1).returning(|app, _| {
            Err(ApplyError::new(app, ApplyCause::Other, "admission webhook denied").into())
        });

        let bootstrapper =
            ControllerBootstrapper::new(Arc::new(applier), Arc::new(probe), fast_compiler());
        let err = bootstrapper.ensure_ready(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Apply(_)));
        assert_eq!(bootstrapper.state(), BootstrapState::Absent);
    }

    #[tokio::test]
    async fn story_cancellation_interrupts_polling_promptly() {
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().times(1).returning(|_, _| Ok(()));

        // long poll interval and timeout: only cancellation can end this quickly
        let bootstrapper = ControllerBootstrapper::new(
            Arc::new(applier),
            Arc::new(probe_following(Arc::new(AtomicBool::new(false)))),
            compiler(Duration::from_secs(30), Duration::from_secs(120)),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = bootstrapper.ensure_ready(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn story_cancelled_before_start_never_applies() {
        let mut applier = MockManifestApplier::new();
        applier.expect_apply().never();
        let mut probe = MockSchemaProbe::new();
        probe.expect_schema_present().never();

        let bootstrapper =
            ControllerBootstrapper::new(Arc::new(applier), Arc::new(probe), fast_compiler());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bootstrapper.ensure_ready(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}

use std::sync::Arc;

use crate::core::config::PortalConfig;
use crate::portal::{HttpPortal, LoginHandshake, NetworkProbe};
use crate::scheduler::{ReloginTask, TickHandler, TickOutcome};
use crate::solver::CaptchaSolver;

/// Process-lifetime state: configuration plus the solver chosen at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PortalConfig>,
    pub solver: Arc<dyn CaptchaSolver>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("solver", &self.solver.kind())
            .finish()
    }
}

impl AppState {
    pub fn new(config: PortalConfig, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self {
            config: Arc::new(config),
            solver,
        }
    }

    /// Load config and build the configured solver.
    pub fn from_config(config: PortalConfig) -> anyhow::Result<Self> {
        let solver = crate::solver::build_solver(&config)?;
        Ok(Self::new(config, solver))
    }

    /// Probe + handshake wired against the real portal.
    pub fn relogin_task(&self) -> anyhow::Result<ReloginTask<NetworkProbe, HttpPortal>> {
        let credentials = self.config.credentials()?;
        let probe = NetworkProbe::from_config(&self.config)?;
        let handshake = LoginHandshake::new(
            HttpPortal::new(self.config.as_ref().clone()),
            Arc::clone(&self.solver),
            credentials,
        )
        .with_transport_retries(self.config.transport_retries)
        .with_max_verify_rejections(self.config.max_verify_rejections);
        Ok(ReloginTask::new(probe, handshake))
    }

    /// One probe-then-login pass; the caller maps the outcome to an exit code.
    pub async fn run_once(&self) -> TickOutcome {
        match self.relogin_task() {
            Ok(task) => task.on_tick().await,
            Err(e) => TickOutcome::Failed(format!("{:#}", e)),
        }
    }
}

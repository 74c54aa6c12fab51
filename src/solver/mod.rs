//! CAPTCHA solvers: turn image bytes into a 4-character code.
//!
//! One solver is chosen at startup and shared by every handshake. Each
//! variant owns a [`RetryBudget`]; once it is spent, `solve` reports
//! [`SolveError::RetryExhausted`] instead of [`SolveError::SolveFailed`].

pub mod cnn;
pub mod manual;
pub mod vlm;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::core::config::{PortalConfig, SolverSettings};
use crate::core::types::{CaptchaCode, CaptchaImage};

pub use cnn::CnnSolver;
pub use manual::ManualSolver;
pub use vlm::VlmSolver;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolveError {
    #[error("solver produced no valid code: {0}")]
    SolveFailed(String),

    #[error("solver gave up after {attempts} failures (max {max})")]
    RetryExhausted { attempts: u32, max: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Manual,
    Cnn,
    VisionLanguageModel,
}

impl FromStr for SolverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "human" => Ok(SolverKind::Manual),
            "cnn" => Ok(SolverKind::Cnn),
            "vlm" | "llm" | "vision" => Ok(SolverKind::VisionLanguageModel),
            other => Err(format!(
                "unknown solver '{}' (expected manual, cnn or vlm)",
                other
            )),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SolverKind::Manual => "manual",
            SolverKind::Cnn => "cnn",
            SolverKind::VisionLanguageModel => "vlm",
        })
    }
}

/// Failure counter with an optional ceiling (negative max = unbounded).
///
/// Interior-mutable so solvers can record failures through `&self`; the
/// scheduler guarantees a single caller at a time.
#[derive(Debug)]
pub struct RetryBudget {
    max: i64,
    failures: AtomicU32,
}

impl RetryBudget {
    pub fn new(max: i64) -> Self {
        Self {
            max,
            failures: AtomicU32::new(0),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max < 0
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Count one failure. `Err(total)` once the total exceeds the ceiling.
    pub fn record_failure(&self) -> Result<u32, u32> {
        let total = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if !self.is_unbounded() && i64::from(total) > self.max {
            Err(total)
        } else {
            Ok(total)
        }
    }

    /// Give up regardless of the ceiling, e.g. when no answer can ever arrive.
    pub fn exhaust(&self) -> SolveError {
        let attempts = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        SolveError::RetryExhausted {
            attempts,
            max: self.max,
        }
    }

    /// Turn a recognizer outcome into a solver outcome, charging failures.
    pub fn settle(
        &self,
        solver: &str,
        outcome: Result<CaptchaCode, String>,
    ) -> Result<CaptchaCode, SolveError> {
        match outcome {
            Ok(code) => Ok(code),
            Err(reason) => match self.record_failure() {
                Ok(n) => {
                    warn!("{} solver failed (attempt {}): {}", solver, n, reason);
                    Err(SolveError::SolveFailed(reason))
                }
                Err(n) => Err(SolveError::RetryExhausted {
                    attempts: n,
                    max: self.max,
                }),
            },
        }
    }
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn kind(&self) -> SolverKind;

    fn budget(&self) -> &RetryBudget;

    async fn solve(&self, image: &CaptchaImage) -> Result<CaptchaCode, SolveError>;
}

/// Build the configured solver.
pub fn build_solver(config: &PortalConfig) -> anyhow::Result<Arc<dyn CaptchaSolver>> {
    let settings: &SolverSettings = &config.solver;
    let solver: Arc<dyn CaptchaSolver> = match settings.kind {
        SolverKind::Manual => Arc::new(ManualSolver::with_stdin(settings.max_retries)),
        SolverKind::Cnn => Arc::new(CnnSolver::from_settings(settings, config.timeouts.solver)?),
        SolverKind::VisionLanguageModel => {
            Arc::new(VlmSolver::from_settings(settings, config.timeouts.solver)?)
        }
    };
    Ok(solver)
}

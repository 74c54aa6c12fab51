pub mod core;
pub mod portal;
pub mod scheduler;
pub mod setup;
pub mod solver;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::AppState;

pub use portal::{codec, HttpPortal, LoginHandshake, NetworkProbe, PortalApi};
pub use scheduler::{Scheduler, TickHandler, TickOutcome};
pub use solver::{CaptchaSolver, RetryBudget, SolveError, SolverKind};

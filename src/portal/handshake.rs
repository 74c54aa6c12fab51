//! Login handshake: Resolve → Acquire → Solve → Verify → Submit.
//!
//! One `run()` is one outer attempt as seen by the scheduler. Inside it:
//! - solver failures re-fetch a fresh image (charged to the solver's budget),
//! - CAPTCHA-check rejections re-fetch without charging that budget,
//! - transport failures retry the enclosing loop against a separate budget,
//! - a "login again" answer restarts from location resolution on a new session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::PortalApi;
use crate::core::config::Credentials;
use crate::core::error::{ErrorClass, HandshakeError};
use crate::core::types::{CallbackResult, HandshakeState};
use crate::solver::{CaptchaSolver, RetryBudget};

/// Marker the portal puts in its message when the session must start over.
pub const LOGIN_AGAIN_MARKER: &str = "login again";

/// Default cap on "login again" restarts within one run.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// How a login answer steers the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginVerdict {
    Accepted,
    /// Start over from location resolution.
    Transient(String),
    /// Report and stop.
    Final(String),
}

pub fn classify_login(result: &CallbackResult) -> LoginVerdict {
    if result.is_success() {
        LoginVerdict::Accepted
    } else if result
        .message
        .to_lowercase()
        .contains(LOGIN_AGAIN_MARKER)
    {
        LoginVerdict::Transient(result.message.clone())
    } else {
        LoginVerdict::Final(result.message.clone())
    }
}

/// Portal message on success, or the fatal error.
pub type HandshakeOutcome = Result<String, HandshakeError>;

#[derive(Debug)]
pub struct HandshakeReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Every state entered, starting with `Idle`.
    pub transitions: Vec<HandshakeState>,
    /// "Login again" restarts taken.
    pub restarts: u32,
    /// Images handed to the solver.
    pub captcha_rounds: u32,
    pub outcome: HandshakeOutcome,
}

impl HandshakeReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn final_state(&self) -> HandshakeState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(HandshakeState::Idle)
    }
}

struct Tracker {
    transitions: Vec<HandshakeState>,
    restarts: u32,
    captcha_rounds: u32,
}

impl Tracker {
    fn new() -> Self {
        Self {
            transitions: vec![HandshakeState::Idle],
            restarts: 0,
            captcha_rounds: 0,
        }
    }

    fn enter(&mut self, state: HandshakeState) {
        info!("handshake_state={}", state);
        self.transitions.push(state);
    }
}

pub struct LoginHandshake<P: PortalApi> {
    portal: P,
    solver: Arc<dyn CaptchaSolver>,
    credentials: Credentials,
    transport_retries: i64,
    max_verify_rejections: i64,
    max_restarts: u32,
}

impl<P: PortalApi> LoginHandshake<P> {
    pub fn new(portal: P, solver: Arc<dyn CaptchaSolver>, credentials: Credentials) -> Self {
        Self {
            portal,
            solver,
            credentials,
            transport_retries: 3,
            max_verify_rejections: -1,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    /// Negative means unbounded.
    pub fn with_transport_retries(mut self, n: i64) -> Self {
        self.transport_retries = n;
        self
    }

    /// Negative means unbounded.
    pub fn with_max_verify_rejections(mut self, n: i64) -> Self {
        self.max_verify_rejections = n;
        self
    }

    pub fn with_max_restarts(mut self, n: u32) -> Self {
        self.max_restarts = n;
        self
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub async fn run(&self) -> HandshakeReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut tracker = Tracker::new();

        self.solver.budget().reset();
        let transport = RetryBudget::new(self.transport_retries);
        let rejections = RetryBudget::new(self.max_verify_rejections);

        let outcome = self.drive(&mut tracker, &transport, &rejections).await;
        match &outcome {
            Ok(msg) => {
                tracker.enter(HandshakeState::Succeeded);
                info!("portal login succeeded: {}", msg);
            }
            Err(e) => {
                tracker.enter(HandshakeState::Failed);
                error!("portal login failed ({:?}): {}", e.class(), e);
            }
        }

        HandshakeReport {
            started_at,
            elapsed: start.elapsed(),
            transitions: tracker.transitions,
            restarts: tracker.restarts,
            captcha_rounds: tracker.captcha_rounds,
            outcome,
        }
    }

    async fn drive(
        &self,
        tracker: &mut Tracker,
        transport: &RetryBudget,
        rejections: &RetryBudget,
    ) -> HandshakeOutcome {
        'attempt: loop {
            let session = self.portal.open_session()?;

            tracker.enter(HandshakeState::ResolvingLocation);
            let location = match self.portal.resolve_location(&session).await {
                Ok(params) if !params.is_empty() => params,
                Ok(_) => {
                    return Err(HandshakeError::LocationUnavailable(
                        "gateway returned no parameters".to_string(),
                    ))
                }
                Err(e) if e.class() == ErrorClass::Transport => {
                    charge_transport(transport, e)?;
                    continue 'attempt;
                }
                Err(e) => return Err(e),
            };

            loop {
                tracker.enter(HandshakeState::AcquiringCaptcha);
                let image = match self.portal.fetch_captcha(&session).await {
                    Ok(image) => image,
                    Err(e) if e.class() == ErrorClass::Transport => {
                        charge_transport(transport, e)?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                tracker.enter(HandshakeState::SolvingCaptcha);
                tracker.captcha_rounds += 1;
                let code = match self.solver.solve(&image).await {
                    Ok(code) => code,
                    Err(e) => match HandshakeError::from_solve(e.clone()) {
                        Some(fatal) => return Err(fatal),
                        None => {
                            warn!("{}, fetching a new captcha", e);
                            continue;
                        }
                    },
                };
                drop(image);

                tracker.enter(HandshakeState::VerifyingCaptcha);
                match self.portal.check_captcha(&session, &code).await {
                    Ok(r) if r.is_success() => {
                        info!("captcha {} accepted", code);
                        break;
                    }
                    Ok(r) => {
                        if let Err(n) = rejections.record_failure() {
                            return Err(HandshakeError::VerifyRejectionsExhausted {
                                attempts: n,
                                last: r.message,
                            });
                        }
                        warn!(
                            "captcha {} rejected (result={}): {}",
                            code, r.result, r.message
                        );
                    }
                    Err(e) if e.class() == ErrorClass::Transport => {
                        charge_transport(transport, e)?;
                    }
                    Err(e) => return Err(e),
                }
            }

            tracker.enter(HandshakeState::Authenticating);
            let result = match self
                .portal
                .login(&session, &self.credentials, &location)
                .await
            {
                Ok(r) => r,
                Err(e) if e.class() == ErrorClass::Transport => {
                    charge_transport(transport, e)?;
                    continue 'attempt;
                }
                Err(e) => return Err(e),
            };

            match classify_login(&result) {
                LoginVerdict::Accepted => return Ok(result.message),
                LoginVerdict::Transient(msg) => {
                    if tracker.restarts >= self.max_restarts {
                        return Err(HandshakeError::LoginRejected(format!(
                            "still asked to log in again after {} restarts: {}",
                            tracker.restarts, msg
                        )));
                    }
                    tracker.restarts += 1;
                    warn!("portal asked to log in again ({}), restarting handshake", msg);
                    tracker.enter(HandshakeState::Failed);
                }
                LoginVerdict::Final(msg) => return Err(HandshakeError::LoginRejected(msg)),
            }
        }
    }
}

fn charge_transport(budget: &RetryBudget, err: HandshakeError) -> Result<(), HandshakeError> {
    match budget.record_failure() {
        Ok(n) => {
            warn!("transport failure #{}: {}; retrying", n, err);
            Ok(())
        }
        Err(n) => Err(HandshakeError::TransportExhausted {
            attempts: n,
            last: err.to_string(),
        }),
    }
}

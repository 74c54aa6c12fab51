use thiserror::Error;

use crate::solver::SolveError;

/// Coarse error classes used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and connection failures; retried by the enclosing loop.
    Transport,
    /// Malformed envelopes and missing redirects; fatal for the attempt.
    Protocol,
    /// Unreadable CAPTCHA or an exhausted solver budget.
    Captcha,
    /// The portal refused the credentials.
    Auth,
    /// Missing or invalid settings; fatal at startup.
    Configuration,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed callback response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error during {stage}: {message}")]
    Transport {
        stage: &'static str,
        message: String,
    },

    #[error("malformed callback response: {0}")]
    MalformedResponse(String),

    #[error("location parameters unavailable: {0}")]
    LocationUnavailable(String),

    #[error("captcha fetch failed: {0}")]
    CaptchaFetchFailed(String),

    #[error("captcha retries exhausted after {attempts} failed attempts")]
    RetryExhausted { attempts: u32 },

    #[error("gave up after {attempts} transport failures; last: {last}")]
    TransportExhausted { attempts: u32, last: String },

    #[error("captcha check rejected {attempts} times; last: {last}")]
    VerifyRejectionsExhausted { attempts: u32, last: String },

    #[error("login rejected: {0}")]
    LoginRejected(String),
}

impl HandshakeError {
    pub fn transport(stage: &'static str, err: impl std::fmt::Display) -> Self {
        HandshakeError::Transport {
            stage,
            message: err.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            HandshakeError::Config(_) => ErrorClass::Configuration,
            HandshakeError::Transport { .. }
            | HandshakeError::CaptchaFetchFailed(_)
            | HandshakeError::TransportExhausted { .. } => ErrorClass::Transport,
            HandshakeError::MalformedResponse(_) | HandshakeError::LocationUnavailable(_) => {
                ErrorClass::Protocol
            }
            HandshakeError::RetryExhausted { .. }
            | HandshakeError::VerifyRejectionsExhausted { .. } => ErrorClass::Captcha,
            HandshakeError::LoginRejected(_) => ErrorClass::Auth,
        }
    }
}

impl From<CodecError> for HandshakeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedResponse(m) => HandshakeError::MalformedResponse(m),
        }
    }
}

impl HandshakeError {
    /// Solver outcomes that end the run; `None` means fetch a fresh image.
    pub fn from_solve(err: SolveError) -> Option<Self> {
        match err {
            SolveError::SolveFailed(_) => None,
            SolveError::RetryExhausted { attempts, .. } => {
                Some(HandshakeError::RetryExhausted { attempts })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_follow_taxonomy() {
        assert_eq!(
            HandshakeError::transport("login", "timed out").class(),
            ErrorClass::Transport
        );
        assert_eq!(
            HandshakeError::LocationUnavailable("no redirect".into()).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            HandshakeError::RetryExhausted { attempts: 4 }.class(),
            ErrorClass::Captcha
        );
        assert_eq!(
            HandshakeError::LoginRejected("password incorrect".into()).class(),
            ErrorClass::Auth
        );
    }

    #[test]
    fn test_only_exhaustion_ends_the_run() {
        let e = HandshakeError::from_solve(SolveError::RetryExhausted { attempts: 4, max: 3 });
        assert!(matches!(e, Some(HandshakeError::RetryExhausted { attempts: 4 })));
        assert!(HandshakeError::from_solve(SolveError::SolveFailed("A1".into())).is_none());
    }
}

pub mod app_state;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use app_state::AppState;
pub use config::{Credentials, PortalConfig, PortalEndpoints};
pub use error::{ErrorClass, HandshakeError};

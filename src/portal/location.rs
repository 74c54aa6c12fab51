use std::time::Duration;

use reqwest::header::LOCATION;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::error::HandshakeError;
use crate::core::types::LocationParams;
use crate::portal::session::PortalSession;

/// Reads the identity parameters the gateway embeds in its captive redirect.
#[derive(Clone, Debug)]
pub struct LocationResolver {
    gateway_url: String,
    timeout: Duration,
}

impl LocationResolver {
    pub fn new(gateway_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            timeout,
        }
    }

    pub async fn resolve(&self, session: &PortalSession) -> Result<LocationParams, HandshakeError> {
        let resp = session
            .no_redirect_client()
            .get(&self.gateway_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HandshakeError::transport("location", e))?;

        let status = resp.status();
        if !status.is_redirection() {
            return Err(HandshakeError::LocationUnavailable(format!(
                "gateway answered {} instead of a redirect",
                status
            )));
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        debug!("gateway redirect target: {}", location);

        let params = parse_location(location, &self.gateway_url)?;
        let missing = params.missing_keys();
        if !missing.is_empty() {
            warn!("gateway redirect lacks {:?}; sending them empty", missing);
        }
        info!("resolved {} location parameters", params.len());
        Ok(params)
    }
}

/// Parse the query string of a redirect target, keeping the first value per key.
///
/// Relative targets are resolved against `base`.
pub fn parse_location(location: &str, base: &str) -> Result<LocationParams, HandshakeError> {
    let location = location.trim();
    if location.is_empty() {
        return Err(HandshakeError::LocationUnavailable(
            "redirect carries no Location header".to_string(),
        ));
    }

    let url = Url::parse(location)
        .or_else(|_| Url::parse(base).and_then(|b| b.join(location)))
        .map_err(|e| HandshakeError::LocationUnavailable(format!("bad redirect target: {}", e)))?;

    let params = LocationParams::from_pairs(
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned())),
    );
    if params.is_empty() {
        return Err(HandshakeError::LocationUnavailable(
            "redirect target has no query string".to_string(),
        ));
    }
    Ok(params)
}

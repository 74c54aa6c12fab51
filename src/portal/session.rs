use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::redirect::Policy;

use crate::core::config::PortalConfig;
use crate::core::error::HandshakeError;

/// HTTP state owned by one handshake attempt.
///
/// Two clients share one cookie jar: the gateway probe must see the raw
/// redirect, everything else follows redirects normally.
#[derive(Clone)]
pub struct PortalSession {
    jar: Arc<Jar>,
    client: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl std::fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSession").finish_non_exhaustive()
    }
}

impl PortalSession {
    pub fn new(config: &PortalConfig) -> Result<Self, HandshakeError> {
        let jar = Arc::new(Jar::default());
        let client = base_builder(config)
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|e| HandshakeError::Config(format!("http client: {}", e)))?;
        let no_redirect = base_builder(config)
            .cookie_provider(Arc::clone(&jar))
            .redirect(Policy::none())
            .build()
            .map_err(|e| HandshakeError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            jar,
            client,
            no_redirect,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn no_redirect_client(&self) -> &reqwest::Client {
        &self.no_redirect
    }

    /// `Cookie` header value the jar would send to `url`, if any.
    pub fn cookies_for(&self, url: &reqwest::Url) -> Option<String> {
        use reqwest::cookie::CookieStore;
        self.jar
            .cookies(url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }
}

/// Client settings shared by every portal-facing client.
pub fn base_builder(config: &PortalConfig) -> reqwest::ClientBuilder {
    let builder = reqwest::Client::builder()
        .connect_timeout(config.timeouts.gateway)
        .danger_accept_invalid_certs(!config.verify_tls);
    if config.use_system_proxy {
        builder
    } else {
        builder.no_proxy()
    }
}

pub mod captcha;
pub mod codec;
pub mod handshake;
pub mod location;
pub mod probe;
pub mod session;

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::core::config::{Credentials, PortalConfig};
use crate::core::error::HandshakeError;
use crate::core::types::{
    CallbackResult, CaptchaCode, CaptchaImage, LocationParams, LOCATION_KEYS,
};

pub use captcha::CaptchaAcquirer;
pub use handshake::{classify_login, HandshakeOutcome, HandshakeReport, LoginHandshake, LoginVerdict};
pub use location::LocationResolver;
pub use probe::{ConnectivityCheck, NetworkProbe};
pub use session::PortalSession;

/// JSONP callback names the portal's own web page uses.
pub const CHECK_CALLBACK: &str = "dr1003";
pub const LOGIN_CALLBACK: &str = "dr1004";
pub const JS_VERSION: &str = "4.2.1";
pub const PAGE_VERSION: &str = "3333";
pub const LANG: &str = "zh";

/// Everything the handshake needs from the portal, one call per step.
#[async_trait]
pub trait PortalApi: Send + Sync {
    type Session: Send + Sync;

    /// Fresh cookie/session state for one handshake attempt.
    fn open_session(&self) -> Result<Self::Session, HandshakeError>;

    async fn resolve_location(
        &self,
        session: &Self::Session,
    ) -> Result<LocationParams, HandshakeError>;

    async fn fetch_captcha(&self, session: &Self::Session) -> Result<CaptchaImage, HandshakeError>;

    async fn check_captcha(
        &self,
        session: &Self::Session,
        code: &CaptchaCode,
    ) -> Result<CallbackResult, HandshakeError>;

    async fn login(
        &self,
        session: &Self::Session,
        credentials: &Credentials,
        location: &LocationParams,
    ) -> Result<CallbackResult, HandshakeError>;
}

/// The real portal over HTTP.
#[derive(Clone)]
pub struct HttpPortal {
    config: PortalConfig,
    resolver: LocationResolver,
    acquirer: CaptchaAcquirer,
}

impl HttpPortal {
    pub fn new(config: PortalConfig) -> Self {
        let resolver =
            LocationResolver::new(config.endpoints.gateway_url.clone(), config.timeouts.gateway);
        let acquirer =
            CaptchaAcquirer::new(config.endpoints.captcha_url.clone(), config.timeouts.captcha);
        Self {
            config,
            resolver,
            acquirer,
        }
    }

    async fn call_jsonp(
        &self,
        session: &PortalSession,
        stage: &'static str,
        url: Url,
        timeout: Duration,
    ) -> Result<CallbackResult, HandshakeError> {
        let resp = session
            .client()
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| HandshakeError::transport(stage, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HandshakeError::transport(
                stage,
                format!("portal answered {}", status),
            ));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| HandshakeError::transport(stage, e))?;
        debug!("{} response: {}", stage, text.trim());
        Ok(codec::decode(&text)?)
    }
}

/// Query for the CAPTCHA-check endpoint.
pub fn captcha_check_url(base: &str, code: &CaptchaCode) -> Result<Url, HandshakeError> {
    let mut url = Url::parse(base)
        .map_err(|e| HandshakeError::Config(format!("captcha check url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("callback", CHECK_CALLBACK)
        .append_pair("captcha", code.as_str())
        .append_pair("jsVersion", JS_VERSION)
        .append_pair("v", PAGE_VERSION)
        .append_pair("lang", LANG);
    Ok(url)
}

/// Query for the login endpoint.
pub fn login_url(
    base: &str,
    credentials: &Credentials,
    location: &LocationParams,
) -> Result<Url, HandshakeError> {
    let mut url =
        Url::parse(base).map_err(|e| HandshakeError::Config(format!("login url: {}", e)))?;
    let mut query = url.query_pairs_mut();
    query
        .append_pair("callback", LOGIN_CALLBACK)
        .append_pair("login_method", "1")
        .append_pair("user_account", &format!(",0,{}", credentials.username))
        .append_pair("user_password", &credentials.password);
    for (key, field) in LOCATION_KEYS {
        query.append_pair(field, location.get_or_empty(key));
    }
    query
        .append_pair("jsVersion", JS_VERSION)
        .append_pair("terminal_type", "1")
        .append_pair("lang", LANG)
        .append_pair("v", PAGE_VERSION);
    drop(query);
    Ok(url)
}

#[async_trait]
impl PortalApi for HttpPortal {
    type Session = PortalSession;

    fn open_session(&self) -> Result<PortalSession, HandshakeError> {
        PortalSession::new(&self.config)
    }

    async fn resolve_location(
        &self,
        session: &PortalSession,
    ) -> Result<LocationParams, HandshakeError> {
        self.resolver.resolve(session).await
    }

    async fn fetch_captcha(&self, session: &PortalSession) -> Result<CaptchaImage, HandshakeError> {
        self.acquirer.fetch(session).await
    }

    async fn check_captcha(
        &self,
        session: &PortalSession,
        code: &CaptchaCode,
    ) -> Result<CallbackResult, HandshakeError> {
        let url = captcha_check_url(&self.config.endpoints.captcha_check_url, code)?;
        self.call_jsonp(session, "captcha_check", url, self.config.timeouts.check)
            .await
    }

    async fn login(
        &self,
        session: &PortalSession,
        credentials: &Credentials,
        location: &LocationParams,
    ) -> Result<CallbackResult, HandshakeError> {
        let url = login_url(&self.config.endpoints.login_url, credentials, location)?;
        self.call_jsonp(session, "login", url, self.config.timeouts.login)
            .await
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::core::config::PortalConfig;

/// Answers "is the internet reachable right now?".
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// GETs a well-known no-content endpoint; only a 204 counts as online.
#[derive(Clone, Debug)]
pub struct NetworkProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// Probe built from config. A captive gateway rewrites answers, so no
    /// proxy and no redirect following.
    pub fn from_config(config: &PortalConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeouts.probe)
            .redirect(reqwest::redirect::Policy::none());
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self::new(
            builder.build()?,
            config.endpoints.probe_url.clone(),
            config.timeouts.probe,
        ))
    }
}

#[async_trait]
impl ConnectivityCheck for NetworkProbe {
    async fn is_online(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                debug!("connectivity probe {} -> {}", self.url, status);
                status == StatusCode::NO_CONTENT
            }
            Err(e) => {
                debug!("connectivity probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

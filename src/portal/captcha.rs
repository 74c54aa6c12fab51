use std::time::Duration;

use tracing::debug;

use crate::core::error::HandshakeError;
use crate::core::types::CaptchaImage;
use crate::portal::session::PortalSession;

/// Downloads the CAPTCHA image bound to the session's cookies.
#[derive(Clone, Debug)]
pub struct CaptchaAcquirer {
    url: String,
    timeout: Duration,
}

impl CaptchaAcquirer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub async fn fetch(&self, session: &PortalSession) -> Result<CaptchaImage, HandshakeError> {
        let resp = session
            .client()
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HandshakeError::CaptchaFetchFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HandshakeError::CaptchaFetchFailed(format!(
                "{} answered {}",
                self.url, status
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HandshakeError::CaptchaFetchFailed(format!("reading body: {}", e)))?;
        if bytes.is_empty() {
            return Err(HandshakeError::CaptchaFetchFailed(
                "empty captcha body".to_string(),
            ));
        }

        let image = CaptchaImage::new(bytes.to_vec());
        debug!("fetched captcha: {:?}", image);
        Ok(image)
    }
}

//! CNN recognizer: four classification heads (one per character position)
//! over a shared convolutional feature extractor. The trained network runs
//! behind a model server; this side prepares the input tensor and decodes
//! the per-head logits.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CaptchaSolver, RetryBudget, SolveError, SolverKind};
use crate::core::config::SolverSettings;
use crate::core::types::{CaptchaCode, CaptchaImage, CAPTCHA_LEN};

/// Class index → character, shared by every head.
pub const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Single-channel image scaled to `[0, 1]`, laid out as `1×1×H×W`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrayTensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl GrayTensor {
    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }
}

/// Decode, convert to 8-bit grayscale and normalize to `[0, 1]`.
pub fn preprocess(image: &CaptchaImage) -> Result<GrayTensor> {
    let decoded = image::load_from_memory(image.as_bytes()).context("decoding captcha image")?;
    let gray = decoded.to_luma8();
    let (w, h) = gray.dimensions();
    let data = gray.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();
    Ok(GrayTensor {
        shape: [1, 1, h as usize, w as usize],
        data,
    })
}

/// Forward pass of the trained network in inference mode.
#[async_trait]
pub trait CaptchaNetwork: Send + Sync {
    /// One row of class scores per character position.
    async fn forward(&self, input: &GrayTensor) -> Result<Vec<Vec<f32>>>;
}

/// Argmax of each head, mapped through [`ALPHABET`].
pub fn decode_heads(logits: &[Vec<f32>]) -> Result<String> {
    if logits.len() != CAPTCHA_LEN {
        return Err(anyhow!(
            "expected {} heads, network returned {}",
            CAPTCHA_LEN,
            logits.len()
        ));
    }
    logits
        .iter()
        .enumerate()
        .map(|(pos, row)| {
            if row.len() != ALPHABET.len() {
                return Err(anyhow!(
                    "head {} has {} classes, expected {}",
                    pos,
                    row.len(),
                    ALPHABET.len()
                ));
            }
            let best = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .ok_or_else(|| anyhow!("head {} is empty", pos))?;
            Ok(char::from(ALPHABET[best]))
        })
        .collect()
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    input: &'a GrayTensor,
}

#[derive(Deserialize)]
struct InferenceResponse {
    logits: Vec<Vec<f32>>,
}

/// Network hosted by a model server: `POST {url}` with the tensor as JSON,
/// answered by `{"logits": [[...36...], x4]}`.
pub struct RemoteNetwork {
    client: reqwest::Client,
    url: String,
}

impl RemoteNetwork {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CaptchaNetwork for RemoteNetwork {
    async fn forward(&self, input: &GrayTensor) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.url)
            .json(&InferenceRequest { input })
            .send()
            .await
            .context("model server request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "model server failed: status={} body={}",
                status,
                text
            ));
        }

        let body: InferenceResponse = response
            .json()
            .await
            .context("model server response json parse failed")?;
        Ok(body.logits)
    }
}

pub struct CnnSolver {
    network: Box<dyn CaptchaNetwork>,
    budget: RetryBudget,
}

impl CnnSolver {
    pub fn new(network: Box<dyn CaptchaNetwork>, max_retries: i64) -> Self {
        Self {
            network,
            budget: RetryBudget::new(max_retries),
        }
    }

    pub fn from_settings(settings: &SolverSettings, timeout: Duration) -> Result<Self> {
        let url = settings
            .model
            .as_deref()
            .ok_or_else(|| anyhow!("cnn solver needs PORTAL_SOLVER_MODEL (model server URL)"))?;
        url::Url::parse(url).with_context(|| format!("invalid model server URL: {}", url))?;
        Ok(Self::new(
            Box::new(RemoteNetwork::new(url, timeout)?),
            settings.max_retries,
        ))
    }

    async fn recognize(&self, image: &CaptchaImage) -> Result<CaptchaCode, String> {
        let tensor = preprocess(image).map_err(|e| format!("{:#}", e))?;
        let logits = self
            .network
            .forward(&tensor)
            .await
            .map_err(|e| format!("{:#}", e))?;
        let raw = decode_heads(&logits).map_err(|e| format!("{:#}", e))?;
        debug!("cnn prediction: {}", raw);
        CaptchaCode::parse(&raw).ok_or_else(|| format!("invalid prediction '{}'", raw))
    }
}

#[async_trait]
impl CaptchaSolver for CnnSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Cnn
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    async fn solve(&self, image: &CaptchaImage) -> Result<CaptchaCode, SolveError> {
        let outcome = self.recognize(image).await;
        self.budget.settle("cnn", outcome)
    }
}

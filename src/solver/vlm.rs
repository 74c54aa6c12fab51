use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

use super::{CaptchaSolver, RetryBudget, SolveError, SolverKind};
use crate::core::config::SolverSettings;
use crate::core::types::{CaptchaCode, CaptchaImage};

const SYSTEM_PROMPT: &str = "You are a CAPTCHA transcription system. The image contains exactly 4 characters, each an uppercase letter or a digit. Tell apart look-alike glyphs carefully. Output only the 4 characters: no explanation, no spaces, no punctuation.";
const USER_PROMPT: &str = "Output the complete 4-character code shown in this image and nothing else.";

/// Vision-language model behind an OpenAI-compatible `chat/completions` API.
pub struct VlmSolver {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    budget: RetryBudget,
}

impl VlmSolver {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        max_retries: i64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            budget: RetryBudget::new(max_retries),
        }
    }

    pub fn from_settings(settings: &SolverSettings, timeout: Duration) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .ok_or_else(|| anyhow!("vlm solver needs PORTAL_SOLVER_MODEL (model name)"))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(
            client,
            settings.llm_base_url.clone(),
            settings.llm_api_key.clone(),
            model,
            settings.max_retries,
        ))
    }

    async fn ask_model(&self, image: &CaptchaImage) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = build_request(&self.model, image);

        let builder = self.client.post(url).json(&body);
        // Key-less local endpoints (Ollama / vLLM / LM Studio) work without a header.
        let builder = match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        };
        let response = builder
            .send()
            .await
            .context("chat.completions request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "chat.completions failed: status={} body={}",
                status,
                text
            ));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("chat.completions response json parse failed")?;
        extract_content(&value).ok_or_else(|| anyhow!("chat.completions returned no content"))
    }

    async fn recognize(&self, image: &CaptchaImage) -> Result<CaptchaCode, String> {
        let raw = self
            .ask_model(image)
            .await
            .map_err(|e| format!("{:#}", e))?;
        debug!("vlm raw output: {:?}", raw);
        CaptchaCode::parse_prefix(&raw).ok_or_else(|| format!("model answered {:?}", raw.trim()))
    }
}

/// Chat request with the image inlined as a base64 `data:` URL.
pub fn build_request(model: &str, image: &CaptchaImage) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image.as_bytes());
    let data_url = format!("data:{};base64,{}", image.mime_type(), encoded);
    serde_json::json!({
        "model": model,
        "temperature": 0.0,
        "max_tokens": 16,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": data_url}},
                {"type": "text", "text": USER_PROMPT}
            ]}
        ]
    })
}

pub fn extract_content(value: &serde_json::Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl CaptchaSolver for VlmSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::VisionLanguageModel
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    async fn solve(&self, image: &CaptchaImage) -> Result<CaptchaCode, SolveError> {
        let outcome = self.recognize(image).await;
        self.budget.settle("vlm", outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_inlines_image() {
        let image = CaptchaImage::new(vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]);
        let body = build_request("qwen2.5-vl", &image);
        assert_eq!(body["model"], "qwen2.5-vl");
        let url = body["messages"][1]["content"][0]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn test_extract_content() {
        let v = json!({"choices": [{"message": {"role": "assistant", "content": " 7k2m \n"}}]});
        assert_eq!(extract_content(&v).as_deref(), Some("7k2m"));
        assert!(extract_content(&json!({"choices": []})).is_none());
    }

    #[test]
    fn test_model_output_cleaning() {
        assert_eq!(
            CaptchaCode::parse_prefix("7k-2m").map(|c| c.to_string()),
            Some("7K2M".into())
        );
        assert!(CaptchaCode::parse_prefix("7k").is_none());
    }
}

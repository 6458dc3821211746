//! Captcha solving seam and the vision-model implementation.
//!
//! The core only needs "image bytes in, text guess out"; everything about
//! the model call lives here.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;

use crate::core::config::SolverConfig;
use crate::core::SentinelError;

/// Opaque challenge-image-to-text capability. May fail or return garbage;
/// the session machine bounds how often it gets to try.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, image_png: &[u8]) -> Result<String, SentinelError>;
}

const TRANSCRIBE_PROMPT: &str = "You are an accessibility assistant helping a \
visually impaired user complete a login form. Transcribe the characters shown \
in this challenge image. Respond with only those characters in UPPERCASE \
(usually 5 letters), no additional text or spaces.";

/// Solver backed by an OpenAI-compatible `chat/completions` vision endpoint.
/// The image travels as a base64 data URL; endpoint, key, and model come
/// from [`SolverConfig`] resolution (config file → env → defaults).
pub struct VisionSolver {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl VisionSolver {
    pub fn new(client: reqwest::Client, cfg: &SolverConfig) -> Self {
        Self {
            client,
            base_url: cfg.resolve_base_url(),
            api_key: cfg.resolve_api_key(),
            model: cfg.resolve_model(),
        }
    }
}

#[async_trait]
impl CaptchaSolver for VisionSolver {
    async fn solve(&self, image_png: &[u8]) -> Result<String, SentinelError> {
        let data_url = format!("data:image/png;base64,{}", BASE64.encode(image_png));

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": data_url}},
                    {"type": "text", "text": TRANSCRIBE_PROMPT}
                ]
            }]
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let builder = self.client.post(url).json(&body);
        // Only send Authorization when a key is configured — key-less local
        // endpoints work without it.
        let builder = match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key.trim()),
            _ => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| SentinelError::SolverUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SentinelError::SolverUnavailable(format!(
                "status={status} body={text}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SentinelError::SolverUnavailable(format!("bad response json: {e}")))?;

        let guess = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SentinelError::SolverUnavailable("empty completion for captcha image".into())
            })?;

        debug!("captcha guess: {guess:?}");
        Ok(guess)
    }
}

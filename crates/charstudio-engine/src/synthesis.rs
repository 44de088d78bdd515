//! Text-to-image client with multi-model fallback.
//!
//! Candidates are tried in order. A 503 means the model is still loading: the
//! client waits once, retries the same model once on the alternate endpoint,
//! and otherwise moves on. Any other failure moves straight to the next
//! candidate. There is no backoff growth and no jitter.

use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use charstudio_contracts::models::ModelChain;
use charstudio_contracts::GenerationError;
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::images::{encode_data_uri, error_chain_text, truncate_text};

pub const DEFAULT_INFERENCE_BASE: &str = "https://router.huggingface.co/hf-inference/models";
pub const DEFAULT_RETRY_BASE: &str = "https://api-inference.huggingface.co/models";
pub const DEFAULT_COLD_START_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_NUM_INFERENCE_STEPS: u32 = 4;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;

const STATUS_MODEL_LOADING: u16 = 503;
const ERROR_TEXT_MAX_CHARS: usize = 1024;

#[derive(Debug, Clone)]
pub struct InferenceReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl InferenceReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }

    /// Media type of the image payload, `image/png` when the provider did not
    /// label it as an image.
    fn image_media_type(&self) -> String {
        self.content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| value.starts_with("image/"))
            .unwrap_or_else(|| "image/png".to_string())
    }
}

/// One POST to an inference endpoint.
pub trait InferenceTransport: Send + Sync {
    fn name(&self) -> &str;
    fn post(&self, url: &str, token: &str, body: &Value) -> Result<InferenceReply>;
}

pub struct HttpInferenceTransport {
    http: HttpClient,
}

impl HttpInferenceTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    #[cfg(test)]
    fn with_client(http: HttpClient) -> Self {
        Self { http }
    }
}

impl Default for HttpInferenceTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceTransport for HttpInferenceTransport {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn post(&self, url: &str, token: &str, body: &Value) -> Result<InferenceReply> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(ACCEPT, "image/png")
            .json(body)
            .send()
            .with_context(|| format!("inference request failed ({url})"))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .with_context(|| format!("inference response body read failed ({url})"))?
            .to_vec();
        Ok(InferenceReply {
            status,
            content_type,
            body,
        })
    }
}

/// Offline transport: renders a solid colour PNG derived from the prompt.
pub struct DryrunTransport {
    width: u32,
    height: u32,
}

impl DryrunTransport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunTransport {
    fn default() -> Self {
        Self::new(512, 768)
    }
}

impl InferenceTransport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn post(&self, _url: &str, _token: &str, body: &Value) -> Result<InferenceReply> {
        let prompt = body.get("inputs").and_then(Value::as_str).unwrap_or("");
        let (r, g, b) = color_from_prompt(prompt);
        let mut image = RgbImage::new(self.width, self.height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .context("dryrun image encode failed")?;
        Ok(InferenceReply {
            status: 200,
            content_type: Some("image/png".to_string()),
            body: png,
        })
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub token: String,
    pub inference_base: String,
    pub retry_base: String,
    pub cold_start_backoff: Duration,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl SynthesisConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            inference_base: DEFAULT_INFERENCE_BASE.to_string(),
            retry_base: DEFAULT_RETRY_BASE.to_string(),
            cold_start_backoff: DEFAULT_COLD_START_BACKOFF,
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }

    /// Reads `HUGGING_FACE_TOKEN`, `HF_INFERENCE_BASE`, `HF_RETRY_BASE` and
    /// `CHARSTUDIO_COLD_START_BACKOFF_SECS`.
    pub fn from_env() -> Result<Self> {
        let Some(token) = non_empty_env("HUGGING_FACE_TOKEN") else {
            bail!("HUGGING_FACE_TOKEN missing");
        };
        let mut config = Self::new(token);
        if let Some(base) = base_url_env("HF_INFERENCE_BASE") {
            config.inference_base = base;
        }
        if let Some(base) = base_url_env("HF_RETRY_BASE") {
            config.retry_base = base;
        }
        if let Some(raw) = non_empty_env("CHARSTUDIO_COLD_START_BACKOFF_SECS") {
            let seconds: f64 = raw
                .parse()
                .with_context(|| format!("invalid CHARSTUDIO_COLD_START_BACKOFF_SECS '{raw}'"))?;
            if !seconds.is_finite() {
                bail!("invalid CHARSTUDIO_COLD_START_BACKOFF_SECS '{raw}'");
            }
            config.cold_start_backoff = Duration::from_secs_f64(seconds.clamp(0.0, 120.0));
        }
        Ok(config)
    }

    pub fn with_cold_start_backoff(mut self, backoff: Duration) -> Self {
        self.cold_start_backoff = backoff;
        self
    }

    fn primary_endpoint(&self, model: &str) -> String {
        join_endpoint(&self.inference_base, model)
    }

    fn retry_endpoint(&self, model: &str) -> String {
        join_endpoint(&self.retry_base, model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedImage {
    pub model: String,
    pub data_uri: String,
    /// True when the image came from the cold-start retry.
    pub retried: bool,
}

pub struct SynthesisClient {
    config: SynthesisConfig,
    transport: Box<dyn InferenceTransport>,
    candidates: Vec<String>,
}

impl SynthesisClient {
    pub fn new(
        config: SynthesisConfig,
        transport: Box<dyn InferenceTransport>,
        candidates: Vec<String>,
    ) -> Self {
        Self {
            config,
            transport,
            candidates,
        }
    }

    pub fn from_chain(
        config: SynthesisConfig,
        transport: Box<dyn InferenceTransport>,
        chain: &ModelChain,
    ) -> Self {
        Self::new(config, transport, chain.names())
    }

    pub fn candidates(&self) -> &[String] {
        self.candidates.as_slice()
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn synthesize(&self, prompt: &str) -> Result<SynthesizedImage, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::validation("Prompt is required"));
        }
        if self.candidates.is_empty() {
            return Err(GenerationError::Synthesis {
                last_error: "no candidate models configured".to_string(),
            });
        }

        let mut last_error = String::new();
        for model in &self.candidates {
            tracing::info!(model = %model, transport = self.transport.name(), "trying inference model");
            let payload = json!({
                "inputs": prompt,
                "parameters": {
                    "num_inference_steps": self.config.num_inference_steps,
                    "guidance_scale": self.config.guidance_scale,
                },
            });
            let reply = match self.transport.post(
                &self.config.primary_endpoint(model),
                &self.config.token,
                &payload,
            ) {
                Ok(reply) => reply,
                Err(err) => {
                    last_error = error_chain_text(&err, ERROR_TEXT_MAX_CHARS);
                    tracing::warn!(model = %model, error = %last_error, "inference transport failed");
                    continue;
                }
            };
            tracing::debug!(model = %model, status = reply.status, "inference response");

            if reply.is_success() {
                tracing::info!(model = %model, "inference succeeded");
                return Ok(Self::image_from_reply(model, &reply, false));
            }

            last_error = truncate_text(&reply.body_text(), ERROR_TEXT_MAX_CHARS);
            tracing::warn!(model = %model, status = reply.status, error = %last_error, "inference failed");
            if reply.status != STATUS_MODEL_LOADING {
                continue;
            }

            tracing::info!(
                model = %model,
                wait_s = self.config.cold_start_backoff.as_secs_f64(),
                "model loading; waiting before single retry"
            );
            thread::sleep(self.config.cold_start_backoff);
            let retry_payload = json!({ "inputs": prompt });
            match self.transport.post(
                &self.config.retry_endpoint(model),
                &self.config.token,
                &retry_payload,
            ) {
                Ok(retry) if retry.is_success() => {
                    tracing::info!(model = %model, "inference succeeded on retry");
                    return Ok(Self::image_from_reply(model, &retry, true));
                }
                Ok(retry) => {
                    last_error = truncate_text(&retry.body_text(), ERROR_TEXT_MAX_CHARS);
                    tracing::warn!(model = %model, status = retry.status, "cold-start retry failed");
                }
                Err(err) => {
                    last_error = error_chain_text(&err, ERROR_TEXT_MAX_CHARS);
                    tracing::warn!(model = %model, error = %last_error, "cold-start retry transport failed");
                }
            }
        }

        Err(GenerationError::Synthesis { last_error })
    }

    fn image_from_reply(model: &str, reply: &InferenceReply, retried: bool) -> SynthesizedImage {
        SynthesizedImage {
            model: model.to_string(),
            data_uri: encode_data_uri(&reply.image_media_type(), &reply.body),
            retried,
        }
    }
}

fn join_endpoint(base: &str, model: &str) -> String {
    format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        model.trim().trim_start_matches('/')
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn base_url_env(key: &str) -> Option<String> {
    non_empty_env(key).map(|value| value.trim_end_matches('/').to_string())
}

//! Ollama vision-language model client
//!
//! Uses `/api/generate` with base64 PNG images for captions and text
//! correction, and `/api/embeddings` with the same image payload for image
//! embeddings (the embedding model must accept images). Requests are rate
//! limited client-side so a burst of animated frames cannot flood the server.

use super::{bounded, CallOptions, VisionModel};
use crate::error::EngineError;
use async_trait::async_trait;
use base64::Engine as _;
use governor::{Quota, RateLimiter};
use image::{DynamicImage, ImageFormat, RgbaImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

const DESCRIBE_PROMPT: &str =
    "Describe this image in one or two sentences. Mention any visible text verbatim.";
const EMBED_PROMPT: &str = "Embed this image.";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Ollama HTTP client
pub struct OllamaVision {
    client: Client,
    base_url: String,
    model: String,
    embedding_model: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl std::fmt::Debug for OllamaVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaVision")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OllamaVision {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
        requests_per_second: u32,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Unavailable(format!("HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: embedding_model.into(),
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    async fn encode_png(image: &RgbaImage) -> Result<String, EngineError> {
        let image = image.clone();
        tokio::task::spawn_blocking(move || {
            let mut bytes = Vec::new();
            DynamicImage::ImageRgba8(image)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map(|_| base64::engine::general_purpose::STANDARD.encode(&bytes))
        })
        .await
        .map_err(|e| EngineError::ModelCallFailed(format!("PNG encode task failed: {}", e)))?
        .map_err(|e| EngineError::ModelCallFailed(format!("PNG encode failed: {}", e)))
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, EngineError>
    where
        Req: Serialize + ?Sized,
        Resp: serde::de::DeserializeOwned,
    {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Ollama request");

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_connect() {
                EngineError::Unavailable(format!("Ollama unreachable at {}: {}", self.base_url, e))
            } else {
                EngineError::ModelCallFailed(format!("Ollama request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::ModelCallFailed(format!(
                "Ollama returned error status: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::ModelCallFailed(format!("Failed to parse Ollama response: {}", e)))
    }

    async fn generate(&self, image: &RgbaImage, prompt: String) -> Result<String, EngineError> {
        let encoded = Self::encode_png(image).await?;
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images: vec![encoded],
            stream: false,
        };
        let response: GenerateResponse = self.post_json("/api/generate", &request).await?;
        Ok(response.response.trim().to_string())
    }
}

/// Prompt asking the model to transcribe text, seeded with the OCR reading
pub(crate) fn correction_prompt(candidate: &str) -> String {
    format!(
        "An OCR engine read the text in this image as:\n\"{}\"\n\
         Reply with the exact text visible in the image, correcting any OCR mistakes. \
         Reply with the text only.",
        candidate
    )
}

#[async_trait]
impl VisionModel for OllamaVision {
    fn name(&self) -> &str {
        &self.model
    }

    async fn describe(&self, image: &RgbaImage, opts: &CallOptions) -> Result<String, EngineError> {
        bounded(opts, self.generate(image, DESCRIBE_PROMPT.to_string())).await
    }

    async fn correct_text(
        &self,
        image: &RgbaImage,
        candidate: &str,
        opts: &CallOptions,
    ) -> Result<String, EngineError> {
        let text = bounded(opts, self.generate(image, correction_prompt(candidate))).await?;
        Ok(text.trim_matches('"').to_string())
    }

    async fn embed(&self, image: &RgbaImage, opts: &CallOptions) -> Result<Vec<f32>, EngineError> {
        let response: EmbeddingResponse = bounded(opts, async {
            let request = EmbeddingRequest {
                model: &self.embedding_model,
                prompt: EMBED_PROMPT,
                images: vec![Self::encode_png(image).await?],
            };
            self.post_json("/api/embeddings", &request).await
        })
        .await?;
        if response.embedding.is_empty() {
            return Err(EngineError::ModelCallFailed(format!(
                "{} returned an empty embedding",
                self.embedding_model
            )));
        }
        Ok(response.embedding)
    }
}

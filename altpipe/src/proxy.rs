//! Client for the generation proxy.
//!
//! The proxy is an opaque HTTPS endpoint: one POST per payload, JSON in and
//! out. Any non-2xx response is a hard failure whose error text is surfaced
//! verbatim; no retries are attempted here.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Error, Result};
use crate::job::{GenerationKind, MediaJob};

const CAPTION_ACTION: &str = "generateCaptions";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    base64_data: String,
    mime_type: &'a str,
    file_name: &'a str,
    file_size: u64,
    is_video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    alt_text: Option<String>,
    vtt_content: Option<String>,
    error: Option<String>,
}

/// What the proxy produced for one payload.
#[derive(Debug, Clone)]
pub enum Generated {
    AltText(String),
    Captions(String),
}

#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl ProxyClient {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// Submit one payload for a job and return the generated text.
    ///
    /// `payload` may be the original bytes, a compressed rendition, or one
    /// chunk; `mime_type` describes the payload actually sent, which can
    /// differ from the job's declared type after compression.
    #[instrument(skip_all, fields(job_id = %job.id, size = payload.len()))]
    pub async fn generate(
        &self,
        job: &MediaJob,
        payload: &[u8],
        mime_type: &str,
        is_video: bool,
        duration: Option<f64>,
    ) -> Result<Generated> {
        let metadata = job.video_metadata.unwrap_or_default();
        let body = GenerateRequest {
            base64_data: STANDARD.encode(payload),
            mime_type,
            file_name: &job.file_name,
            file_size: payload.len() as u64,
            is_video,
            video_duration: metadata.duration,
            video_width: metadata.width,
            video_height: metadata.height,
            action: matches!(job.kind, GenerationKind::Captions).then_some(CAPTION_ACTION),
            duration: matches!(job.kind, GenerationKind::Captions)
                .then_some(duration.or(metadata.duration))
                .flatten(),
        };

        debug!(endpoint = %self.endpoint, "posting payload to proxy");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::proxy(format!("request failed: {e}")))?;

        let status = response.status();
        let raw = response
            .bytes()
            .await
            .map_err(|e| Error::proxy(format!("reading response failed: {e}")))?;

        if !status.is_success() {
            // Prefer the proxy's own error text over the bare status.
            let detail = serde_json::from_slice::<GenerateResponse>(&raw)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .map(str::to_string)
                        .unwrap_or_else(|| status.as_u16().to_string())
                });
            return Err(Error::Proxy(detail));
        }

        let parsed: GenerateResponse = serde_json::from_slice(&raw)
            .map_err(|e| Error::proxy(format!("malformed proxy response: {e}")))?;

        match job.kind {
            GenerationKind::AltText => parsed
                .alt_text
                .map(Generated::AltText)
                .ok_or_else(|| Error::proxy("response missing altText")),
            GenerationKind::Captions => parsed
                .vtt_content
                .map(Generated::Captions)
                .ok_or_else(|| Error::proxy("response missing vttContent")),
        }
    }
}

//! Media byte resolution.
//!
//! Jobs carry a source reference rather than bytes; this resolves http(s)
//! URLs, `data:` URLs, and local file paths into a byte buffer.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};

/// Fetch the media bytes behind a source reference.
pub async fn fetch_media(client: &reqwest::Client, src: &str) -> Result<Bytes> {
    if let Some(rest) = src.strip_prefix("data:") {
        return decode_data_url(rest);
    }

    if src.starts_with("http://") || src.starts_with("https://") {
        let response = client
            .get(src)
            .send()
            .await
            .map_err(|e| Error::fetch(format!("request to {src} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::fetch(format!(
                "fetching {src} returned {}",
                status_text(status)
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::fetch(format!("reading body of {src} failed: {e}")))?;
        debug!(src, size = bytes.len(), "fetched media over http");
        return Ok(bytes);
    }

    let path = src.strip_prefix("file://").unwrap_or(src);
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::fetch(format!("reading {path} failed: {e}")))?;
    debug!(src, size = bytes.len(), "read media from disk");
    Ok(Bytes::from(bytes))
}

fn status_text(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Decode the body of a `data:` URL (everything after the scheme).
fn decode_data_url(rest: &str) -> Result<Bytes> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::fetch("malformed data URL: no comma"))?;
    if meta.ends_with(";base64") {
        let decoded = STANDARD
            .decode(payload)
            .map_err(|e| Error::fetch(format!("malformed base64 data URL: {e}")))?;
        Ok(Bytes::from(decoded))
    } else {
        // Percent-encoded text payloads are rare for media but cheap to
        // support.
        Ok(Bytes::from(payload.as_bytes().to_vec()))
    }
}

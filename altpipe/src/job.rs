//! Job and result types flowing through the pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::{Codec, Quality};

/// What the proxy should generate for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationKind {
    AltText,
    Captions,
}

/// Lightweight metadata the requester already knows about a video.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// One user-initiated media request.
///
/// Created from the requester's job description, consumed entirely within
/// one orchestrator invocation, never persisted.
#[derive(Debug, Clone)]
pub struct MediaJob {
    /// Correlation id carried in every event for this job.
    pub id: Uuid,
    /// Fetchable source reference, also echoed back for UI matching.
    pub src_url: String,
    pub file_name: String,
    pub media_type: String,
    /// Declared by the requester, refined after fetch.
    pub declared_size: Option<u64>,
    pub kind: GenerationKind,
    pub video_metadata: Option<VideoMetadata>,
}

impl MediaJob {
    pub fn new(
        src_url: impl Into<String>,
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        kind: GenerationKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            src_url: src_url.into(),
            file_name: file_name.into(),
            media_type: media_type.into(),
            declared_size: None,
            kind,
            video_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: VideoMetadata) -> Self {
        self.video_metadata = Some(metadata);
        self
    }

    /// Duration hint, if the requester provided one.
    pub fn duration_hint(&self) -> Option<f64> {
        self.video_metadata.and_then(|m| m.duration)
    }
}

/// Output of a successful compression pass.
///
/// `compressed_size <= original_size` is a target, not a guarantee; callers
/// fall back to the original bytes when compression fails to shrink.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub bytes: Bytes,
    pub original_size: u64,
    pub compressed_size: u64,
    pub media_type: String,
    pub codec: Codec,
    pub quality: Quality,
    /// Whether the stronger second pass produced this output.
    pub stronger_pass: bool,
}

impl CompressionResult {
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }

    pub fn shrank(&self) -> bool {
        self.compressed_size < self.original_size
    }
}

/// One time-bounded segment of a larger video.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub index: u32,
    pub file_name: String,
    pub data: Bytes,
    pub media_type: String,
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// Ordered best-effort set of extracted chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    pub chunks: Vec<MediaChunk>,
    /// Spans that were planned but failed to extract.
    pub failed: u32,
}

impl ChunkSet {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.data.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&GenerationKind::AltText).unwrap(),
            "\"altText\""
        );
        assert_eq!(
            serde_json::from_str::<GenerationKind>("\"captions\"").unwrap(),
            GenerationKind::Captions
        );
    }

    #[test]
    fn test_compression_ratio() {
        let result = CompressionResult {
            bytes: Bytes::from_static(b"x"),
            original_size: 100,
            compressed_size: 25,
            media_type: "video/mp4".to_string(),
            codec: Codec::H264,
            quality: Quality::Medium,
            stronger_pass: false,
        };
        assert!((result.ratio() - 0.25).abs() < 1e-9);
        assert!(result.shrank());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = MediaJob::new("https://example.com/a.mp4", "a.mp4", "video/mp4", GenerationKind::AltText);
        let b = MediaJob::new("https://example.com/a.mp4", "a.mp4", "video/mp4", GenerationKind::AltText);
        assert_ne!(a.id, b.id);
    }
}

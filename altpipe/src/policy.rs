//! Size and duration policy.
//!
//! Pure decision logic consumed by the orchestrator: transfer thresholds,
//! codec quality tables, and chunk planning. Nothing here touches the
//! network or the encoder.

use serde::{Deserialize, Serialize};

/// Size thresholds and chunking knobs.
///
/// The defaults are the production values; tests shrink them to avoid
/// allocating hundred-megabyte buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLimits {
    /// Hard ceiling on total media size. Jobs above it are rejected before
    /// any processing.
    #[serde(default = "default_total_ceiling")]
    pub total_ceiling: u64,
    /// Largest payload sent to the proxy without compression.
    #[serde(default = "default_direct_limit")]
    pub direct_limit: u64,
    /// Target size for a compression pass output.
    #[serde(default = "default_compressed_target")]
    pub compressed_target: u64,
    /// Hard cap on chunk count.
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
    /// Floor for a planned chunk duration, seconds.
    #[serde(default = "default_min_chunk_secs")]
    pub min_chunk_secs: f64,
    /// Ceiling for a planned chunk duration, seconds.
    #[serde(default = "default_max_chunk_secs")]
    pub max_chunk_secs: f64,
    /// Chunks shorter than this are dropped instead of encoded.
    #[serde(default = "default_negligible_chunk_secs")]
    pub negligible_chunk_secs: f64,
}

const MB: u64 = 1024 * 1024;

fn default_total_ceiling() -> u64 {
    100 * MB
}

fn default_direct_limit() -> u64 {
    19 * MB
}

fn default_compressed_target() -> u64 {
    20 * MB
}

fn default_max_chunks() -> u32 {
    15
}

fn default_min_chunk_secs() -> f64 {
    10.0
}

fn default_max_chunk_secs() -> f64 {
    60.0
}

fn default_negligible_chunk_secs() -> f64 {
    0.1
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            total_ceiling: default_total_ceiling(),
            direct_limit: default_direct_limit(),
            compressed_target: default_compressed_target(),
            max_chunks: default_max_chunks(),
            min_chunk_secs: default_min_chunk_secs(),
            max_chunk_secs: default_max_chunk_secs(),
            negligible_chunk_secs: default_negligible_chunk_secs(),
        }
    }
}

/// Video codec used for compression passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Vp8,
    Vp9,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
        }
    }

    /// Container extension for this codec's output.
    pub fn output_extension(&self) -> &'static str {
        match self {
            Codec::H264 => "mp4",
            Codec::Vp8 | Codec::Vp9 => "webm",
        }
    }

    pub fn output_mime_type(&self) -> &'static str {
        match self {
            Codec::H264 => "video/mp4",
            Codec::Vp8 | Codec::Vp9 => "video/webm",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality tier for a compression pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

/// CRF value for a codec and tier.
///
/// `stronger` raises the CRF for the automatic second pass when the first
/// pass output still exceeds the target size.
pub fn crf_for(codec: Codec, quality: Quality, stronger: bool) -> u32 {
    let base = match codec {
        Codec::H264 => match quality {
            Quality::Low => 30,
            Quality::Medium => 26,
            Quality::High => 22,
        },
        Codec::Vp8 => match quality {
            Quality::Low => 35,
            Quality::Medium => 30,
            Quality::High => 25,
        },
        Codec::Vp9 => match quality {
            Quality::Low => 40,
            Quality::Medium => 35,
            Quality::High => 30,
        },
    };
    let bump = match codec {
        Codec::H264 => 4,
        Codec::Vp8 | Codec::Vp9 => 5,
    };
    if stronger { base + bump } else { base }
}

/// Full argument list for one compression pass over `input_name`, producing
/// `output_name`.
///
/// Universal settings: AAC audio at 128k, an even-dimension scale filter
/// (the encoders reject odd frame sizes), and a single-thread constraint
/// since the engine is not safely multi-threaded in its sandbox.
pub fn compression_args(
    codec: Codec,
    quality: Quality,
    stronger: bool,
    input_name: &str,
    output_name: &str,
) -> Vec<String> {
    let crf = crf_for(codec, quality, stronger);
    let mut args: Vec<String> = vec!["-i".into(), input_name.into()];

    match codec {
        Codec::H264 => {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-crf".into(),
                crf.to_string(),
            ]);
        }
        Codec::Vp8 => {
            args.extend([
                "-c:v".into(),
                "libvpx".into(),
                "-crf".into(),
                crf.to_string(),
                "-b:v".into(),
                "0".into(),
                "-deadline".into(),
                "realtime".into(),
                "-cpu-used".into(),
                "8".into(),
            ]);
        }
        Codec::Vp9 => {
            args.extend([
                "-c:v".into(),
                "libvpx-vp9".into(),
                "-crf".into(),
                crf.to_string(),
                "-b:v".into(),
                "0".into(),
                "-deadline".into(),
                "realtime".into(),
                "-row-mt".into(),
                "1".into(),
            ]);
        }
    }

    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-vf".into(),
        "scale=trunc(iw/2/2)*2:trunc(ih/2/2)*2".into(),
        "-threads".into(),
        "1".into(),
    ]);
    if codec == Codec::H264 {
        args.extend(["-x264-params".into(), "threads=1:sliced-threads=0".into()]);
    }
    args.push(output_name.into());
    args
}

/// Codec recommendation by input size: small files take the fast encoder,
/// larger ones trade encode time for better compression.
pub fn recommended_codec(size: u64) -> Codec {
    if size < 50 * MB {
        Codec::H264
    } else if size < 200 * MB {
        Codec::Vp8
    } else {
        Codec::Vp9
    }
}

/// Whether the media should be treated as video for compression purposes.
///
/// Animated image formats count as video: the proxy handles them as moving
/// pictures and the encoder can transcode them.
pub fn is_video_like(media_type: &str, file_name: &str) -> bool {
    let mime = media_type.to_ascii_lowercase();
    if mime.starts_with("video/") {
        return true;
    }
    if matches!(mime.as_str(), "image/gif" | "image/webp" | "image/apng") {
        return true;
    }
    let name = file_name.to_ascii_lowercase();
    name.ends_with(".gif") || name.ends_with(".apng")
}

/// How a payload of a given size should travel to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDecision {
    /// Under the ceiling; reject nothing, send as-is.
    Direct,
    /// Over the direct limit and video-like; compress first.
    Compress,
    /// Over the hard ceiling; reject before any processing.
    Reject,
}

pub fn decide_transfer(size: u64, video_like: bool, limits: &PolicyLimits) -> TransferDecision {
    if size > limits.total_ceiling {
        TransferDecision::Reject
    } else if size > limits.direct_limit && video_like {
        TransferDecision::Compress
    } else {
        // Oversized still images go direct; the proxy handles large images.
        TransferDecision::Direct
    }
}

/// One planned chunk's time span, in seconds from the start of the clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSpan {
    pub start: f64,
    pub duration: f64,
}

/// Plan contiguous, non-overlapping chunk spans covering `duration` seconds.
///
/// Per-chunk duration is `clamp(duration / max_chunks, min, max)`, widened
/// past the ceiling when the clip would otherwise not fit in `max_chunks`
/// chunks; a final remainder shorter than the negligible threshold is
/// dropped rather than planned as a degenerate chunk.
pub fn plan_chunks(duration: f64, limits: &PolicyLimits) -> Vec<ChunkSpan> {
    if duration <= 0.0 {
        return Vec::new();
    }
    let mut per_chunk = (duration / limits.max_chunks as f64)
        .clamp(limits.min_chunk_secs, limits.max_chunk_secs);
    // The duration ceiling must not cost coverage: when even max_chunks
    // chunks at the ceiling fall short of the clip, widen the chunks.
    if per_chunk * (limits.max_chunks as f64) < duration {
        per_chunk = duration / limits.max_chunks as f64;
    }
    let num_chunks = ((duration / per_chunk).ceil() as u32).min(limits.max_chunks);

    let mut spans = Vec::with_capacity(num_chunks as usize);
    for i in 0..num_chunks {
        let start = i as f64 * per_chunk;
        let span = (duration - start).min(per_chunk);
        if span < limits.negligible_chunk_secs {
            continue;
        }
        spans.push(ChunkSpan {
            start,
            duration: span,
        });
    }
    spans
}

/// Arguments for a stream-copy extraction of one chunk span.
pub fn chunk_extract_args(span: ChunkSpan, input_name: &str, output_name: &str) -> Vec<String> {
    vec![
        "-ss".into(),
        format!("{:.3}", span.start),
        "-i".into(),
        input_name.into(),
        "-t".into(),
        format!("{:.3}", span.duration),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        output_name.into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crf_table() {
        assert_eq!(crf_for(Codec::H264, Quality::Low, false), 30);
        assert_eq!(crf_for(Codec::H264, Quality::Medium, false), 26);
        assert_eq!(crf_for(Codec::H264, Quality::High, false), 22);
        assert_eq!(crf_for(Codec::Vp8, Quality::Medium, false), 30);
        assert_eq!(crf_for(Codec::Vp9, Quality::High, false), 30);

        // Stronger pass raises CRF per codec.
        assert_eq!(crf_for(Codec::H264, Quality::Medium, true), 30);
        assert_eq!(crf_for(Codec::Vp8, Quality::Medium, true), 35);
        assert_eq!(crf_for(Codec::Vp9, Quality::Low, true), 45);
    }

    #[test]
    fn test_compression_args_are_deterministic_and_single_threaded() {
        let a = compression_args(Codec::H264, Quality::Medium, false, "in.mp4", "out.mp4");
        let b = compression_args(Codec::H264, Quality::Medium, false, "in.mp4", "out.mp4");
        assert_eq!(a, b);

        let joined = a.join(" ");
        assert!(joined.contains("-c:v libx264 -preset veryfast -crf 26"));
        assert!(joined.contains("-threads 1 -x264-params threads=1:sliced-threads=0"));
        assert!(joined.contains("scale=trunc(iw/2/2)*2:trunc(ih/2/2)*2"));
        assert!(joined.contains("-c:a aac -b:a 128k"));
        assert!(joined.ends_with("out.mp4"));
    }

    #[test]
    fn test_compression_args_vpx_realtime() {
        let vp8 = compression_args(Codec::Vp8, Quality::Medium, false, "in.mp4", "out.webm");
        let joined = vp8.join(" ");
        assert!(joined.contains("-c:v libvpx -crf 30 -b:v 0 -deadline realtime -cpu-used 8"));
        assert!(!joined.contains("x264-params"));

        let vp9 = compression_args(Codec::Vp9, Quality::Medium, true, "in.mp4", "out.webm");
        let joined = vp9.join(" ");
        assert!(joined.contains("-c:v libvpx-vp9 -crf 40 -b:v 0 -deadline realtime -row-mt 1"));
        assert!(joined.ends_with("out.webm"));
    }

    #[test]
    fn test_recommended_codec_thresholds() {
        assert_eq!(recommended_codec(10 * MB), Codec::H264);
        assert_eq!(recommended_codec(50 * MB - 1), Codec::H264);
        assert_eq!(recommended_codec(50 * MB), Codec::Vp8);
        assert_eq!(recommended_codec(200 * MB - 1), Codec::Vp8);
        assert_eq!(recommended_codec(200 * MB), Codec::Vp9);
    }

    #[test]
    fn test_video_likeness() {
        assert!(is_video_like("video/mp4", "clip.mp4"));
        assert!(is_video_like("image/gif", "loop.gif"));
        assert!(is_video_like("image/webp", "anim.webp"));
        assert!(is_video_like("image/apng", "anim.apng"));
        assert!(is_video_like("application/octet-stream", "loop.gif"));
        assert!(!is_video_like("image/jpeg", "photo.jpg"));
        assert!(!is_video_like("image/png", "shot.png"));
    }

    #[test]
    fn test_transfer_decision_boundaries() {
        let limits = PolicyLimits::default();

        // Exactly at the direct limit goes direct; one byte over compresses.
        assert_eq!(
            decide_transfer(limits.direct_limit, true, &limits),
            TransferDecision::Direct
        );
        assert_eq!(
            decide_transfer(limits.direct_limit + 1, true, &limits),
            TransferDecision::Compress
        );

        // Still images are never compressed, whatever their size.
        assert_eq!(
            decide_transfer(limits.direct_limit + 1, false, &limits),
            TransferDecision::Direct
        );

        assert_eq!(
            decide_transfer(limits.total_ceiling, true, &limits),
            TransferDecision::Compress
        );
        assert_eq!(
            decide_transfer(limits.total_ceiling + 1, true, &limits),
            TransferDecision::Reject
        );
    }

    #[test]
    fn test_plan_chunks_respects_cap_and_coverage() {
        let limits = PolicyLimits::default();
        for duration in [0.5, 9.9, 10.0, 61.0, 150.0, 600.0, 900.0, 3600.0, 7200.0] {
            let spans = plan_chunks(duration, &limits);
            assert!(spans.len() as u32 <= limits.max_chunks, "duration {duration}");
            let covered: f64 = spans.iter().map(|s| s.duration).sum();
            assert!(
                duration - covered <= limits.negligible_chunk_secs + 1e-9,
                "duration {duration} covered {covered}"
            );
            // Contiguous and non-overlapping.
            for pair in spans.windows(2) {
                assert!((pair[0].start + pair[0].duration - pair[1].start).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_plan_chunks_long_clip_widens_past_duration_ceiling() {
        let limits = PolicyLimits::default();
        // An hour-long clip cannot fit in 15 chunks of 60s; the planner
        // widens to 240s chunks instead of dropping the last 45 minutes.
        let spans = plan_chunks(3600.0, &limits);
        assert_eq!(spans.len() as u32, limits.max_chunks);
        for span in &spans {
            assert!((span.duration - 240.0).abs() < 1e-6);
        }
        let covered: f64 = spans.iter().map(|s| s.duration).sum();
        assert!((covered - 3600.0).abs() < 1e-6);
        let last = spans.last().unwrap();
        assert!((last.start + last.duration - 3600.0).abs() < 1e-6);
    }

    #[test]
    fn test_plan_chunks_short_clip_is_one_chunk() {
        let limits = PolicyLimits::default();
        let spans = plan_chunks(8.0, &limits);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0.0);
        assert!((spans[0].duration - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_chunks_drops_negligible_tail() {
        let limits = PolicyLimits::default();
        let spans = plan_chunks(600.05, &limits);
        assert_eq!(spans.len() as u32, limits.max_chunks);
        let last = spans.last().unwrap();
        assert!(last.duration >= limits.negligible_chunk_secs);

        // A clip just past a chunk boundary drops the sliver.
        let spans = plan_chunks(20.05, &limits);
        let per_chunk = 10.0;
        assert!(spans.iter().all(|s| s.duration >= limits.negligible_chunk_secs));
        assert_eq!(spans.len(), 2);
        assert!((spans[1].start - per_chunk).abs() < 1e-9);
    }

    #[test]
    fn test_plan_chunks_zero_duration() {
        assert!(plan_chunks(0.0, &PolicyLimits::default()).is_empty());
    }

    #[test]
    fn test_chunk_extract_args_stream_copy() {
        let args = chunk_extract_args(
            ChunkSpan {
                start: 40.0,
                duration: 40.0,
            },
            "input.mp4",
            "chunk_1.mp4",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-ss 40.000"));
        assert!(joined.contains("-t 40.000"));
        assert!(joined.contains("-c copy"));
        assert!(joined.ends_with("chunk_1.mp4"));
    }
}

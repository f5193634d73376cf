//! Background orchestrator.
//!
//! The single point of decision for turning a media reference of unknown
//! size into payloads the generation proxy accepts: fetch, enforce the size
//! ceiling, compress or chunk video when needed, post to the proxy, and
//! stream progress back over the port. Compression and chunking failures
//! degrade to sending the original bytes; only fetch, ceiling, proxy, and
//! timeout failures fail a job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::fetch::fetch_media;
use crate::job::{ChunkSet, CompressionResult, GenerationKind, MediaChunk, MediaJob};
use crate::offscreen::CoordinatorEvent;
use crate::policy::{self, PolicyLimits, Quality, TransferDecision};
use crate::proxy::{Generated, ProxyClient};
use crate::transport::{JobAck, JobRequest, PortEvent, PortRegistry, VttResult};

mod paths;

pub use paths::{DirectPath, OffscreenPath, TranscodePath};

#[derive(Clone)]
pub struct Orchestrator {
    client: reqwest::Client,
    proxy: ProxyClient,
    ports: Arc<PortRegistry>,
    paths: Arc<Vec<Arc<dyn TranscodePath>>>,
    limits: PolicyLimits,
    job_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        client: reqwest::Client,
        proxy: ProxyClient,
        ports: Arc<PortRegistry>,
        paths: Vec<Arc<dyn TranscodePath>>,
        limits: PolicyLimits,
        job_timeout: Duration,
    ) -> Self {
        Self {
            client,
            proxy,
            ports,
            paths: Arc::new(paths),
            limits,
            job_timeout,
        }
    }

    /// Accept a job request, acknowledging receipt immediately. Results
    /// arrive later over the port.
    pub fn submit(&self, request: JobRequest) -> JobAck {
        if request.media_src_url.is_empty() {
            return JobAck::err("mediaSrcUrl is required");
        }
        let mut job = MediaJob::new(
            request.media_src_url,
            request.file_name,
            request.media_type,
            request.generation_type,
        );
        if let Some(metadata) = request.video_metadata {
            job = job.with_metadata(metadata);
        }

        let job_id = job.id;
        let this = self.clone();
        tokio::spawn(async move { this.run_job(job).await });
        JobAck::ok(job_id)
    }

    /// Run one job to completion, bounded by the job timeout. Every outcome
    /// is reported over the port; this never returns an error.
    #[instrument(skip(self), fields(job_id = %job.id, kind = ?job.kind))]
    pub async fn run_job(&self, job: MediaJob) {
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(self.job_timeout, self.process(&job, &cancel)).await;
        match outcome {
            Ok(Ok(())) => info!("job completed"),
            Ok(Err(e)) => {
                warn!(error = %e, "job failed");
                self.error_event(&job, &e);
            }
            Err(_) => {
                cancel.cancel();
                let e = Error::timeout(format!(
                    "job exceeded its {}s bound",
                    self.job_timeout.as_secs()
                ));
                warn!(error = %e, "job timed out");
                self.error_event(&job, &e);
            }
        }
    }

    async fn process(&self, job: &MediaJob, cancel: &CancellationToken) -> Result<()> {
        self.progress(job, "Fetching media");
        let bytes = cancellable(cancel, fetch_media(&self.client, &job.src_url)).await?;
        let size = bytes.len() as u64;
        debug!(size, "media fetched");

        let video_like = policy::is_video_like(&job.media_type, &job.file_name);

        // Policy check precedes all expensive work.
        if policy::decide_transfer(size, video_like, &self.limits) == TransferDecision::Reject {
            return Err(Error::TooLarge {
                size,
                limit: self.limits.total_ceiling,
            });
        }

        match job.kind {
            GenerationKind::Captions => self.captions(job, bytes, video_like, cancel).await,
            GenerationKind::AltText => self.alt_text(job, bytes, video_like, cancel).await,
        }
    }

    async fn captions(
        &self,
        job: &MediaJob,
        bytes: Bytes,
        video_like: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let size = bytes.len() as u64;
        // Caption clips are never re-encoded; a clip the policy would send
        // for compression is split by stream copy instead, so each part
        // still carries original bytes.
        if policy::decide_transfer(size, video_like, &self.limits) == TransferDecision::Compress {
            match self.chunked_captions(job, &bytes, cancel).await {
                Ok(results) => {
                    self.post(PortEvent::CaptionResult {
                        job_id: job.id,
                        vtt_results: results,
                        original_src_url: job.src_url.clone(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    self.warning(job, &format!("Splitting failed ({e}); sending whole clip"));
                }
            }
        }

        self.progress(job, "Requesting captions");
        let generated = cancellable(
            cancel,
            self.proxy
                .generate(job, &bytes, &job.media_type, video_like, job.duration_hint()),
        )
        .await?;
        let vtt_content = match generated {
            Generated::Captions(vtt) => vtt,
            Generated::AltText(_) => return Err(Error::proxy("expected vttContent")),
        };
        self.post(PortEvent::CaptionResult {
            job_id: job.id,
            vtt_results: vec![VttResult {
                file_name: job.file_name.clone(),
                vtt_content,
            }],
            original_src_url: job.src_url.clone(),
        });
        Ok(())
    }

    async fn alt_text(
        &self,
        job: &MediaJob,
        bytes: Bytes,
        video_like: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let size = bytes.len() as u64;
        let mut payload = bytes.clone();
        let mut mime = job.media_type.clone();

        // Still images are never compressed, only sent directly.
        if policy::decide_transfer(size, video_like, &self.limits) == TransferDecision::Compress {
            self.progress(job, "Compressing video");
            match self.compress_with_fallback(job, &bytes, cancel).await {
                Some(result) if result.shrank() => {
                    info!(
                        original = result.original_size,
                        compressed = result.compressed_size,
                        ratio = result.ratio(),
                        codec = %result.codec,
                        stronger = result.stronger_pass,
                        "compression finished"
                    );
                    mime = result.media_type.clone();
                    payload = result.bytes;
                }
                Some(result) => {
                    warn!(
                        original = result.original_size,
                        compressed = result.compressed_size,
                        "compression did not shrink the file"
                    );
                    self.warning(
                        job,
                        "Compression did not shrink the file; sending original media",
                    );
                }
                None => {
                    self.warning(job, "Compression unavailable; sending original media");
                }
            }

            if payload.len() as u64 > self.limits.direct_limit {
                match self.chunked_alt_text(job, &bytes, cancel).await {
                    Ok(alt_text) => {
                        self.post(PortEvent::AltTextResult {
                            job_id: job.id,
                            alt_text,
                            original_src_url: job.src_url.clone(),
                        });
                        return Ok(());
                    }
                    Err(e) => {
                        self.warning(job, &format!("Chunking failed ({e}); sending whole file"));
                    }
                }
            }
        }

        self.progress(job, "Requesting alt text");
        let generated = cancellable(
            cancel,
            self.proxy
                .generate(job, &payload, &mime, video_like, job.duration_hint()),
        )
        .await?;
        let alt_text = match generated {
            Generated::AltText(text) => text,
            Generated::Captions(_) => return Err(Error::proxy("expected altText")),
        };
        self.post(PortEvent::AltTextResult {
            job_id: job.id,
            alt_text,
            original_src_url: job.src_url.clone(),
        });
        Ok(())
    }

    /// Try each transcode path in order until a two-pass compression
    /// succeeds. `None` means every path failed; the caller proceeds with
    /// the original bytes.
    async fn compress_with_fallback(
        &self,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Option<CompressionResult> {
        for path in self.paths.iter() {
            match self.two_pass(path.as_ref(), job, bytes, cancel).await {
                Ok(result) => return Some(result),
                Err(e) => {
                    warn!(path = path.name(), error = %e, "compression path failed");
                }
            }
        }
        None
    }

    /// One compression pass, retried once with stronger parameters when the
    /// output still exceeds the target size. The second pass output is
    /// accepted whatever its size.
    async fn two_pass(
        &self,
        path: &dyn TranscodePath,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<CompressionResult> {
        let original_size = bytes.len() as u64;
        let codec = policy::recommended_codec(original_size);
        let quality = Quality::Medium;
        let input_name = format!("input.{}", extension_for(job));
        let output_name = format!("compressed.{}", codec.output_extension());

        let args = policy::compression_args(codec, quality, false, &input_name, &output_name);
        let first = cancellable(
            cancel,
            path.transcode(&input_name, bytes.clone(), args, &output_name),
        )
        .await?;

        let (output, stronger_pass) = if first.len() as u64 <= self.limits.compressed_target {
            (first, false)
        } else {
            debug!(
                path = path.name(),
                size = first.len(),
                target = self.limits.compressed_target,
                "first pass oversized, retrying with stronger parameters"
            );
            let args = policy::compression_args(codec, quality, true, &input_name, &output_name);
            let second = cancellable(
                cancel,
                path.transcode(&input_name, bytes.clone(), args, &output_name),
            )
            .await?;
            (second, true)
        };

        Ok(CompressionResult {
            compressed_size: output.len() as u64,
            bytes: output,
            original_size,
            media_type: codec.output_mime_type().to_string(),
            codec,
            quality,
            stronger_pass,
        })
    }

    async fn chunked_alt_text(
        &self,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let chunks = self.extract_chunks(job, bytes, cancel).await?;
        let total = chunks.chunks.len();

        let mut descriptions = Vec::with_capacity(total);
        let mut last_error = None;
        for chunk in &chunks.chunks {
            self.progress(
                job,
                &format!("Describing part {} of {}", chunk.index + 1, total),
            );
            let generated = cancellable(
                cancel,
                self.proxy.generate(
                    job,
                    &chunk.data,
                    &chunk.media_type,
                    true,
                    Some(chunk.duration_secs),
                ),
            )
            .await;
            match generated {
                Ok(Generated::AltText(text)) => descriptions.push(text),
                Ok(Generated::Captions(_)) => {
                    last_error = Some(Error::proxy("expected altText for chunk"));
                }
                Err(e) => {
                    warn!(chunk = chunk.index, error = %e, "chunk description failed");
                    last_error = Some(e);
                }
            }
        }

        if descriptions.is_empty() {
            return Err(last_error.unwrap_or_else(|| Error::proxy("all chunk requests failed")));
        }
        if descriptions.len() < total {
            self.warning(
                job,
                &format!("Described {} of {} parts", descriptions.len(), total),
            );
        }
        Ok(descriptions.join("\n\n"))
    }

    async fn chunked_captions(
        &self,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<Vec<VttResult>> {
        let chunks = self.extract_chunks(job, bytes, cancel).await?;
        let total = chunks.chunks.len();

        let mut results = Vec::with_capacity(total);
        let mut last_error = None;
        for chunk in &chunks.chunks {
            self.progress(
                job,
                &format!("Captioning part {} of {}", chunk.index + 1, total),
            );
            let generated = cancellable(
                cancel,
                self.proxy.generate(
                    job,
                    &chunk.data,
                    &chunk.media_type,
                    true,
                    Some(chunk.duration_secs),
                ),
            )
            .await;
            match generated {
                Ok(Generated::Captions(vtt_content)) => results.push(VttResult {
                    file_name: chunk.file_name.clone(),
                    vtt_content,
                }),
                Ok(Generated::AltText(_)) => {
                    last_error = Some(Error::proxy("expected vttContent for chunk"));
                }
                Err(e) => {
                    warn!(chunk = chunk.index, error = %e, "chunk captioning failed");
                    last_error = Some(e);
                }
            }
        }

        if results.is_empty() {
            return Err(last_error.unwrap_or_else(|| Error::proxy("all chunk requests failed")));
        }
        if results.len() < total {
            self.warning(job, &format!("Captioned {} of {} parts", results.len(), total));
        }
        Ok(results)
    }

    /// Split the clip into stream-copied chunks. Partial extraction success
    /// is accepted; zero usable chunks is an error.
    async fn extract_chunks(
        &self,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<ChunkSet> {
        let duration = match self.resolve_duration(job, bytes, cancel).await {
            Some(duration) => duration,
            None => {
                return Err(Error::NoChunksProduced(
                    "clip duration is unknown".to_string(),
                ));
            }
        };
        let spans = policy::plan_chunks(duration, &self.limits);
        if spans.is_empty() {
            return Err(Error::NoChunksProduced(format!(
                "no spans planned for a {duration:.1}s clip"
            )));
        }
        self.progress(job, &format!("Splitting into {} parts", spans.len()));

        let ext = extension_for(job);
        let input_name = format!("input.{ext}");
        let mut set = ChunkSet::default();
        for (i, span) in spans.iter().enumerate() {
            let output_name = format!("chunk_{i}.{ext}");
            let args = policy::chunk_extract_args(*span, &input_name, &output_name);
            match self
                .transcode_with_fallback(&input_name, bytes, args, &output_name, cancel)
                .await
            {
                Ok(data) => set.chunks.push(MediaChunk {
                    index: i as u32,
                    file_name: output_name,
                    data,
                    media_type: job.media_type.clone(),
                    start_secs: span.start,
                    duration_secs: span.duration,
                }),
                Err(e) => {
                    warn!(chunk = i, error = %e, "chunk extraction failed");
                    set.failed += 1;
                }
            }
        }

        if set.is_empty() {
            return Err(Error::NoChunksProduced(format!(
                "all {} extractions failed",
                spans.len()
            )));
        }
        if set.failed > 0 {
            self.warning(
                job,
                &format!(
                    "{} of {} parts could not be extracted",
                    set.failed,
                    spans.len()
                ),
            );
        }
        Ok(set)
    }

    async fn transcode_with_fallback(
        &self,
        input_name: &str,
        bytes: &Bytes,
        args: Vec<String>,
        output_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut last_error = Error::other("no transcode path configured");
        for path in self.paths.iter() {
            match cancellable(
                cancel,
                path.transcode(input_name, bytes.clone(), args.clone(), output_name),
            )
            .await
            {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!(path = path.name(), error = %e, "transcode path failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn resolve_duration(
        &self,
        job: &MediaJob,
        bytes: &Bytes,
        cancel: &CancellationToken,
    ) -> Option<f64> {
        if let Some(duration) = job.duration_hint() {
            return Some(duration);
        }
        let input_name = format!("probe.{}", extension_for(job));
        for path in self.paths.iter() {
            match cancellable(cancel, path.probe_duration(&input_name, bytes.clone())).await {
                Ok(duration) => return Some(duration),
                Err(e) => debug!(path = path.name(), error = %e, "duration probe failed"),
            }
        }
        None
    }

    fn post(&self, event: PortEvent) {
        self.ports.post(event);
    }

    fn progress(&self, job: &MediaJob, message: &str) {
        self.post(PortEvent::Progress {
            job_id: job.id,
            message: message.to_string(),
            original_src_url: job.src_url.clone(),
        });
    }

    fn warning(&self, job: &MediaJob, message: &str) {
        self.post(PortEvent::Warning {
            job_id: job.id,
            message: message.to_string(),
            original_src_url: job.src_url.clone(),
        });
    }

    fn error_event(&self, job: &MediaJob, error: &Error) {
        self.post(PortEvent::Error {
            job_id: job.id,
            message: "Media processing failed".to_string(),
            original_src_url: job.src_url.clone(),
            error: error.to_string(),
        });
    }
}

/// Forward coordinator push events onto the port as engine status events.
pub fn forward_engine_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<CoordinatorEvent>,
    ports: Arc<PortRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let mapped = match event {
                CoordinatorEvent::Status { status, error } => PortEvent::EngineStatus {
                    status: status.to_string(),
                    error,
                    loading: Some(status == "scripts-loaded"),
                },
                CoordinatorEvent::EngineLog(line) => PortEvent::EngineStatus {
                    status: line,
                    error: None,
                    loading: None,
                },
            };
            ports.post(mapped);
        }
    })
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::timeout("job cancelled")),
        result = fut => result,
    }
}

/// File extension for staging, from the job's file name or declared type.
fn extension_for(job: &MediaJob) -> String {
    if let Some((_, ext)) = job.file_name.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_ascii_lowercase();
        }
    }
    match job.media_type.as_str() {
        "video/webm" => "webm".to_string(),
        "video/quicktime" => "mov".to_string(),
        "image/gif" => "gif".to_string(),
        "image/webp" => "webp".to_string(),
        _ => "mp4".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::GenerationKind;

    #[test]
    fn test_extension_for() {
        let job = MediaJob::new("u", "clip.WebM", "video/webm", GenerationKind::AltText);
        assert_eq!(extension_for(&job), "webm");

        let job = MediaJob::new("u", "noext", "video/quicktime", GenerationKind::AltText);
        assert_eq!(extension_for(&job), "mov");

        let job = MediaJob::new("u", "weird.na me", "application/octet-stream", GenerationKind::AltText);
        assert_eq!(extension_for(&job), "mp4");
    }
}

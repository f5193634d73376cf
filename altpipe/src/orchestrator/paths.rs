//! Transcode path strategies.
//!
//! Compression and chunk extraction run through an ordered list of
//! strategies: the offscreen coordinator first, then a directly loaded
//! engine as fallback for runtimes where the coordinator surface is
//! unavailable. The orchestrator tries them in sequence and degrades to the
//! original bytes when every path fails.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use encoder_engine::{EncoderEngine, EngineConfig, EngineSlot};

use crate::error::{Error, Result};
use crate::offscreen::{CoordinatorHandle, OperationInput, OperationOutcome, TranscodeOperation};

/// One way of getting a transcode executed.
#[async_trait]
pub trait TranscodePath: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stage `bytes` under `input_name`, run `args`, and return the bytes of
    /// `output_file`.
    async fn transcode(
        &self,
        input_name: &str,
        bytes: Bytes,
        args: Vec<String>,
        output_file: &str,
    ) -> Result<Bytes>;

    /// Probe the duration of `bytes`, in seconds.
    async fn probe_duration(&self, input_name: &str, bytes: Bytes) -> Result<f64>;
}

/// Transcodes through the offscreen coordinator's RPC surface.
pub struct OffscreenPath {
    handle: CoordinatorHandle,
}

impl OffscreenPath {
    pub fn new(handle: CoordinatorHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl TranscodePath for OffscreenPath {
    fn name(&self) -> &'static str {
        "offscreen"
    }

    async fn transcode(
        &self,
        input_name: &str,
        bytes: Bytes,
        args: Vec<String>,
        output_file: &str,
    ) -> Result<Bytes> {
        let operation = TranscodeOperation::transcode(
            OperationInput {
                src_url: None,
                bytes: Some(bytes),
                file_name: input_name.to_string(),
            },
            args,
            output_file.to_string(),
        );
        match self.handle.run_operation(operation).await? {
            OperationOutcome::Data { bytes, .. } => Ok(bytes),
            other => Err(Error::other(format!(
                "unexpected transcode outcome: {other:?}"
            ))),
        }
    }

    async fn probe_duration(&self, input_name: &str, bytes: Bytes) -> Result<f64> {
        let operation = TranscodeOperation::probe_duration(OperationInput {
            src_url: None,
            bytes: Some(bytes),
            file_name: input_name.to_string(),
        });
        match self.handle.run_operation(operation).await? {
            OperationOutcome::Duration(secs) => Ok(secs),
            other => Err(Error::other(format!(
                "unexpected probe outcome: {other:?}"
            ))),
        }
    }
}

/// Loads the engine in-process, bypassing the coordinator.
pub struct DirectPath {
    slot: Arc<EngineSlot<EncoderEngine>>,
}

impl DirectPath {
    pub fn new(config: EngineConfig) -> Self {
        let slot = EngineSlot::new(move || {
            let config = config.clone();
            Box::pin(async move {
                let engine = EncoderEngine::load(&config, None).await?;
                Ok(Arc::new(engine))
            })
        });
        Self {
            slot: Arc::new(slot),
        }
    }
}

#[async_trait]
impl TranscodePath for DirectPath {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn transcode(
        &self,
        input_name: &str,
        bytes: Bytes,
        args: Vec<String>,
        output_file: &str,
    ) -> Result<Bytes> {
        let engine = self.slot.get().await.map_err(Error::from)?;
        engine.write_input(input_name, &bytes).await.map_err(Error::from)?;
        let run = engine.run(&args).await;
        engine.delete_file(input_name).await;
        run.map_err(Error::from)?;
        let output = engine.read_output(output_file).await.map_err(Error::from)?;
        engine.delete_file(output_file).await;
        Ok(Bytes::from(output))
    }

    async fn probe_duration(&self, input_name: &str, bytes: Bytes) -> Result<f64> {
        let engine = self.slot.get().await.map_err(Error::from)?;
        engine.write_input(input_name, &bytes).await.map_err(Error::from)?;
        let probed = engine.probe_duration(input_name).await;
        engine.delete_file(input_name).await;
        probed.map_err(Error::from)
    }
}

//! Offscreen coordinator.
//!
//! Owns the process's single encoder engine and exposes it as a
//! message-based RPC surface, since callers must never touch engine
//! internals directly. Requests go through a bounded FIFO mailbox and are
//! processed one at a time; the engine is not reentrant, so a second
//! operation queues behind the first instead of racing it.
//!
//! Every reply path is error-catching: a handler failure becomes an error
//! reply, never a dropped oneshot.

use bytes::Bytes;
use encoder_engine::{EncoderEngine, EngineConfig, EngineSlot};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fetch::fetch_media;

/// Mailbox capacity for queued operations.
pub const MAILBOX_CAPACITY: usize = 16;

/// What an operation asks the engine to do.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Run a transcode and read back the named output file.
    Transcode {
        args: Vec<String>,
        output_file: String,
    },
    /// Probe the staged input's duration from the diagnostic stream.
    ProbeDuration,
    /// Explicit scratch cleanup of a named file.
    DeleteFile(String),
}

/// Input descriptor for an operation.
///
/// Bytes may be provided inline or as a fetchable source reference; the
/// coordinator stages them under `file_name` before running the command.
#[derive(Debug, Clone)]
pub struct OperationInput {
    pub src_url: Option<String>,
    pub bytes: Option<Bytes>,
    pub file_name: String,
}

/// One request to the engine, correlated by a unique id.
#[derive(Debug, Clone)]
pub struct TranscodeOperation {
    pub id: Uuid,
    pub command: EngineCommand,
    pub input: Option<OperationInput>,
}

impl TranscodeOperation {
    pub fn transcode(input: OperationInput, args: Vec<String>, output_file: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: EngineCommand::Transcode { args, output_file },
            input: Some(input),
        }
    }

    pub fn probe_duration(input: OperationInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: EngineCommand::ProbeDuration,
            input: Some(input),
        }
    }

    pub fn delete_file(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: EngineCommand::DeleteFile(name.into()),
            input: None,
        }
    }
}

/// Successful operation result.
#[derive(Debug)]
pub enum OperationOutcome {
    Data { bytes: Bytes, file_name: String },
    Duration(f64),
    Deleted(String),
}

/// Events pushed by the coordinator, outside the request/reply flow.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Engine readiness transition: `scripts-loaded`, `complete`, or `error`.
    Status {
        status: &'static str,
        error: Option<String>,
    },
    /// One diagnostic line from the engine, forwarded best-effort.
    EngineLog(String),
}

enum CoordinatorMessage {
    /// Kick off an engine load; the outcome arrives as a status event.
    LoadEngine,
    RunOperation {
        operation: TranscodeOperation,
        reply: oneshot::Sender<Result<OperationOutcome>>,
    },
    Shutdown,
}

/// Handle for sending requests to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Request an engine load without waiting for it.
    pub async fn load_engine(&self) -> Result<()> {
        self.tx
            .send(CoordinatorMessage::LoadEngine)
            .await
            .map_err(|_| Error::other("coordinator stopped"))
    }

    /// Run one operation and wait for its reply.
    pub async fn run_operation(&self, operation: TranscodeOperation) -> Result<OperationOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::RunOperation { operation, reply })
            .await
            .map_err(|_| Error::other("coordinator stopped"))?;
        rx.await.map_err(|_| Error::other("coordinator dropped reply"))?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorMessage::Shutdown).await;
    }
}

/// The coordinator actor.
pub struct Coordinator {
    slot: EngineSlot<EncoderEngine>,
    client: reqwest::Client,
    event_tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl Coordinator {
    /// Spawn a coordinator for the given engine configuration.
    ///
    /// Returns the request handle, the push-event stream, and the actor's
    /// join handle.
    pub fn spawn(
        config: EngineConfig,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> (
        CoordinatorHandle,
        mpsc::UnboundedReceiver<CoordinatorEvent>,
        JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        // Engine diagnostics flow through one channel for the process
        // lifetime and are re-emitted as coordinator events.
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(line) = log_rx.recv().await {
                    let _ = event_tx.send(CoordinatorEvent::EngineLog(line));
                }
            });
        }

        let slot = EngineSlot::new(move || {
            let config = config.clone();
            let log_tx = log_tx.clone();
            Box::pin(async move {
                let engine = EncoderEngine::load(&config, Some(log_tx)).await?;
                Ok(std::sync::Arc::new(engine))
            })
        });

        let actor = Coordinator {
            slot,
            client,
            event_tx,
        };
        let handle = tokio::spawn(actor.run(rx, cancel));
        (CoordinatorHandle { tx }, event_rx, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<CoordinatorMessage>, cancel: CancellationToken) {
        info!("offscreen coordinator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("coordinator cancelled");
                    break;
                }
                message = rx.recv() => {
                    match message {
                        Some(CoordinatorMessage::LoadEngine) => self.handle_load().await,
                        Some(CoordinatorMessage::RunOperation { operation, reply }) => {
                            let outcome = self.handle_operation(operation).await;
                            let _ = reply.send(outcome);
                        }
                        Some(CoordinatorMessage::Shutdown) | None => break,
                    }
                }
            }
        }
        info!("offscreen coordinator stopped");
    }

    fn push_status(&self, status: &'static str, error: Option<String>) {
        let _ = self
            .event_tx
            .send(CoordinatorEvent::Status { status, error });
    }

    async fn handle_load(&self) {
        self.push_status("scripts-loaded", None);
        match self.slot.get().await {
            Ok(_) => self.push_status("complete", None),
            Err(e) => self.push_status("error", Some(e.to_string())),
        }
    }

    async fn handle_operation(&self, operation: TranscodeOperation) -> Result<OperationOutcome> {
        debug!(operation_id = %operation.id, "handling engine operation");
        let engine = self.slot.get().await.map_err(Error::from)?;

        // Pure cleanup needs no staging.
        if let EngineCommand::DeleteFile(name) = &operation.command {
            engine.delete_file(name).await;
            return Ok(OperationOutcome::Deleted(name.clone()));
        }

        let input = operation
            .input
            .as_ref()
            .ok_or_else(|| Error::other("operation carries no input"))?;
        let staged = match (&input.bytes, &input.src_url) {
            (Some(bytes), _) => bytes.clone(),
            (None, Some(src)) => fetch_media(&self.client, src).await?,
            (None, None) => return Err(Error::other("operation input has neither bytes nor url")),
        };
        engine.write_input(&input.file_name, &staged).await?;

        let outcome = match &operation.command {
            EngineCommand::Transcode { args, output_file } => {
                let run = engine.run(args).await;
                engine.delete_file(&input.file_name).await;
                run?;
                let bytes = engine.read_output(output_file).await?;
                engine.delete_file(output_file).await;
                Ok(OperationOutcome::Data {
                    bytes: Bytes::from(bytes),
                    file_name: output_file.clone(),
                })
            }
            EngineCommand::ProbeDuration => {
                let probed = engine.probe_duration(&input.file_name).await;
                engine.delete_file(&input.file_name).await;
                Ok(OperationOutcome::Duration(probed?))
            }
            EngineCommand::DeleteFile(_) => unreachable!("handled above"),
        };

        if let Err(e) = &outcome {
            warn!(operation_id = %operation.id, error = %e, "engine operation failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broken_config() -> EngineConfig {
        EngineConfig {
            ffmpeg_path: "/nonexistent/ffmpeg-binary".into(),
            load_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_load_failure_reported_as_status_events() {
        let cancel = CancellationToken::new();
        let (handle, mut events, _join) =
            Coordinator::spawn(broken_config(), reqwest::Client::new(), cancel.clone());

        handle.load_engine().await.unwrap();

        let mut saw_loading = false;
        let mut saw_error = false;
        while let Some(event) = events.recv().await {
            match event {
                CoordinatorEvent::Status { status: "scripts-loaded", .. } => saw_loading = true,
                CoordinatorEvent::Status {
                    status: "error",
                    error,
                } => {
                    assert!(error.is_some());
                    saw_error = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_loading && saw_error);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_operation_fails_cleanly_without_engine() {
        let cancel = CancellationToken::new();
        let (handle, _events, _join) =
            Coordinator::spawn(broken_config(), reqwest::Client::new(), cancel.clone());

        let operation = TranscodeOperation::probe_duration(OperationInput {
            src_url: None,
            bytes: Some(Bytes::from_static(b"not a video")),
            file_name: "input.mp4".to_string(),
        });
        let err = handle.run_operation(operation).await.unwrap_err();
        assert!(matches!(err, Error::EngineLoad(_)), "{err}");
        cancel.cancel();
    }

    /// A stand-in binary: answers `-version` like the real engine, and for
    /// any other invocation lists the scratch dir into its last argument.
    #[cfg(unix)]
    fn stub_engine_binary(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = "#!/bin/sh\n\
            if [ \"$1\" = \"-version\" ]; then\n\
            \x20 echo \"ffmpeg version 6.0-stub\"\n\
            \x20 exit 0\n\
            fi\n\
            for a in \"$@\"; do out=\"$a\"; done\n\
            ls -1 > \"$out\"\n";
        let path = dir.join("ffmpeg-stub");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcode_leaves_no_scratch_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            ffmpeg_path: stub_engine_binary(dir.path()),
            load_timeout: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let (handle, _events, _join) =
            Coordinator::spawn(config, reqwest::Client::new(), cancel.clone());

        let first = TranscodeOperation::transcode(
            OperationInput {
                src_url: None,
                bytes: Some(Bytes::from_static(b"a")),
                file_name: "first-input.mp4".to_string(),
            },
            vec![
                "-i".to_string(),
                "first-input.mp4".to_string(),
                "first-output.mp4".to_string(),
            ],
            "first-output.mp4".to_string(),
        );
        match handle.run_operation(first).await.unwrap() {
            OperationOutcome::Data { bytes, .. } => {
                let listing = String::from_utf8(bytes.to_vec()).unwrap();
                assert!(listing.contains("first-input.mp4"), "{listing}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // The second operation sees a scratch dir with no leftovers from
        // the first: input and output were both cleaned up.
        let second = TranscodeOperation::transcode(
            OperationInput {
                src_url: None,
                bytes: Some(Bytes::from_static(b"b")),
                file_name: "second-input.mp4".to_string(),
            },
            vec![
                "-i".to_string(),
                "second-input.mp4".to_string(),
                "second-output.mp4".to_string(),
            ],
            "second-output.mp4".to_string(),
        );
        match handle.run_operation(second).await.unwrap() {
            OperationOutcome::Data { bytes, .. } => {
                let listing = String::from_utf8(bytes.to_vec()).unwrap();
                assert!(!listing.contains("first-input.mp4"), "{listing}");
                assert!(!listing.contains("first-output.mp4"), "{listing}");
                assert!(listing.contains("second-input.mp4"), "{listing}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_actor() {
        let cancel = CancellationToken::new();
        let (handle, _events, join) =
            Coordinator::spawn(broken_config(), reqwest::Client::new(), cancel.clone());

        cancel.cancel();
        join.await.unwrap();

        let operation = TranscodeOperation::delete_file("anything.mp4");
        assert!(handle.run_operation(operation).await.is_err());
    }
}

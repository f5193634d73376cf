//! Messaging transport between the requester and the orchestrator.
//!
//! A requester connects a long-lived port and receives every event for its
//! jobs over it, in generation order. Reconnecting replaces the previous
//! port (last-connect-wins); events posted to a gone port are swallowed,
//! since progress is advisory and never gates correctness.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::job::{GenerationKind, VideoMetadata};

/// One generated caption document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VttResult {
    pub file_name: String,
    pub vtt_content: String,
}

/// Events delivered over the long-lived port.
///
/// Every job-scoped event carries the job's correlation id and the original
/// source URL; the id is the correlation key, the URL is kept for UI
/// matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PortEvent {
    Ping,
    Pong,
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: Uuid,
        message: String,
        original_src_url: String,
    },
    #[serde(rename = "ffmpegStatus", rename_all = "camelCase")]
    EngineStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        loading: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Warning {
        job_id: Uuid,
        message: String,
        original_src_url: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        job_id: Uuid,
        message: String,
        original_src_url: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    AltTextResult {
        job_id: Uuid,
        alt_text: String,
        original_src_url: String,
    },
    #[serde(rename_all = "camelCase")]
    CaptionResult {
        job_id: Uuid,
        vtt_results: Vec<VttResult>,
        original_src_url: String,
    },
}

/// One-shot job description sent by the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub media_src_url: String,
    pub file_name: String,
    pub media_type: String,
    pub generation_type: GenerationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_metadata: Option<VideoMetadata>,
}

/// Immediate acknowledgement of a job request; results arrive later over
/// the port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobAck {
    pub fn ok(job_id: Uuid) -> Self {
        Self {
            success: true,
            job_id: Some(job_id),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            job_id: None,
            error: Some(msg.into()),
        }
    }
}

/// Sending half of a connected port.
#[derive(Debug, Clone)]
pub struct Port {
    tx: mpsc::UnboundedSender<PortEvent>,
}

impl Port {
    /// Post an event; a disconnected receiver is not an error.
    pub fn post(&self, event: PortEvent) {
        if self.tx.send(event).is_err() {
            debug!("dropped event for disconnected port");
        }
    }
}

/// Registry holding the single live port.
#[derive(Debug, Default)]
pub struct PortRegistry {
    current: Mutex<Option<Port>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new port, replacing any previous one. The old port's
    /// receiver sees no further events.
    pub fn connect(&self) -> mpsc::UnboundedReceiver<PortEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut current = self.current.lock().expect("port registry lock poisoned");
        if current.is_some() {
            debug!("replacing existing port connection");
        }
        *current = Some(Port { tx });
        rx
    }

    /// Post to the live port, if any.
    pub fn post(&self, event: PortEvent) {
        let current = self.current.lock().expect("port registry lock poisoned");
        if let Some(port) = current.as_ref() {
            port.post(event);
        }
    }

    /// Handle for posting without holding the registry.
    pub fn port(&self) -> Option<Port> {
        self.current
            .lock()
            .expect("port registry lock poisoned")
            .clone()
    }
}

//! Single-flight lazy loading for the engine instance.
//!
//! A slot owns at most one loaded engine for the whole process. The first
//! caller triggers the load; concurrent callers await the same in-flight
//! attempt and share its outcome. Failed loads may be retried by later
//! callers up to a fixed attempt budget, after which the slot reports
//! permanent unavailability without invoking the loader again.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::{EngineError, Result};

/// Load attempts before the slot gives up for the rest of the session.
pub const DEFAULT_LOAD_ATTEMPTS: u32 = 2;

/// How long a waiter blocks on someone else's in-flight load.
pub const LOAD_WAIT_CEILING: Duration = Duration::from_secs(300);

/// Lifecycle of the slot's engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

type Loader<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync>;

struct SlotState<T> {
    engine: Option<Arc<T>>,
    attempts: u32,
    loading: bool,
    last_error: Option<String>,
}

/// Process-wide holder for a lazily loaded engine.
///
/// Generic over the engine type so the load path can be exercised with a
/// stand-in that needs no external binary.
pub struct EngineSlot<T> {
    loader: Loader<T>,
    max_attempts: u32,
    wait_ceiling: Duration,
    state: Mutex<SlotState<T>>,
    readiness_tx: watch::Sender<Readiness>,
}

impl<T: Send + Sync + 'static> EngineSlot<T> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync + 'static,
    {
        Self::with_limits(loader, DEFAULT_LOAD_ATTEMPTS, LOAD_WAIT_CEILING)
    }

    pub fn with_limits<F>(loader: F, max_attempts: u32, wait_ceiling: Duration) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Arc<T>>> + Send + Sync + 'static,
    {
        let (readiness_tx, _) = watch::channel(Readiness::Unloaded);
        Self {
            loader: Arc::new(loader),
            max_attempts,
            wait_ceiling,
            state: Mutex::new(SlotState {
                engine: None,
                attempts: 0,
                loading: false,
                last_error: None,
            }),
            readiness_tx,
        }
    }

    /// Current readiness, for status reporting.
    pub fn readiness(&self) -> Readiness {
        *self.readiness_tx.borrow()
    }

    /// Watch readiness transitions.
    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.readiness_tx.subscribe()
    }

    /// Get the loaded engine, loading it on first demand.
    ///
    /// Callers that arrive while another load is in flight share that
    /// attempt's outcome; they never start a second load and never wait
    /// longer than the slot's wait ceiling.
    pub async fn get(&self) -> Result<Arc<T>> {
        loop {
            // Subscribe before inspecting state so a completion between the
            // inspection and the wait below is not missed.
            let mut readiness_rx = self.readiness_tx.subscribe();

            {
                let mut state = self.state.lock().await;
                if let Some(engine) = &state.engine {
                    return Ok(engine.clone());
                }
                if !state.loading {
                    if state.attempts >= self.max_attempts {
                        return Err(EngineError::load(format!(
                            "engine unavailable after {} failed load attempts",
                            state.attempts
                        )));
                    }
                    state.loading = true;
                    self.readiness_tx.send_replace(Readiness::Loading);
                    drop(state);
                    return self.drive_load().await;
                }
            }

            // Someone else is loading; await the outcome of their attempt.
            let settled = tokio::time::timeout(self.wait_ceiling, async {
                loop {
                    match *readiness_rx.borrow_and_update() {
                        Readiness::Ready | Readiness::Failed => break,
                        _ => {}
                    }
                    if readiness_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;

            if settled.is_err() {
                return Err(EngineError::load(format!(
                    "timed out after {:?} waiting for in-flight engine load",
                    self.wait_ceiling
                )));
            }

            let state = self.state.lock().await;
            if let Some(engine) = &state.engine {
                return Ok(engine.clone());
            }
            if !state.loading {
                // The attempt we waited on failed; share its outcome rather
                // than starting a retry on behalf of the waiter.
                let detail = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "engine load failed".to_string());
                return Err(EngineError::Load(detail));
            }
            // Another load started between the notification and our lock;
            // go around and wait on it.
        }
    }

    async fn drive_load(&self) -> Result<Arc<T>> {
        let result = (self.loader)().await;

        let mut state = self.state.lock().await;
        state.loading = false;
        state.attempts += 1;
        match result {
            Ok(engine) => {
                info!(attempt = state.attempts, "encoder engine ready");
                state.engine = Some(engine.clone());
                state.last_error = None;
                self.readiness_tx.send_replace(Readiness::Ready);
                Ok(engine)
            }
            Err(e) => {
                warn!(
                    attempt = state.attempts,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "encoder engine load failed"
                );
                state.last_error = Some(e.to_string());
                self.readiness_tx.send_replace(Readiness::Failed);
                Err(e)
            }
        }
    }
}

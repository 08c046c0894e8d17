//! Backend adapters: a uniform generation interface over heterogeneous
//! model substrates. Preference order is data owned by the engine, not
//! control flow here.

pub(crate) mod embedded;
pub(crate) mod http;
pub(crate) mod mock;
pub(crate) mod native;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::BackendKind;

/// Knobs for a single generation attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GenerateOptions {
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
}

/// What a backend returns on success.
#[derive(Debug, Clone)]
pub(crate) struct BackendReply {
    pub(crate) text: String,
    pub(crate) model: String,
    pub(crate) prompt_tokens: Option<u64>,
    pub(crate) completion_tokens: Option<u64>,
}

/// Why a backend attempt did not produce a reply.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BackendFailure {
    /// The task's cancellation token tripped.
    #[error("cancelled")]
    Cancelled,
    /// The remote circuit is open; no wire call was made.
    #[error("circuit open; retry in {retry_in_ms} ms")]
    CircuitOpen { retry_in_ms: u64 },
    /// The backend demoted itself (degraded mode); chain continues.
    #[error("{note}")]
    Degraded { note: String },
    /// Any other failure; chain continues.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Readiness flag + last-status note shared by every adapter.
#[derive(Debug)]
pub(crate) struct AdapterState {
    ready: AtomicBool,
    note: Mutex<String>,
}

impl AdapterState {
    pub(crate) fn new(ready: bool, note: impl Into<String>) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            note: Mutex::new(note.into()),
        }
    }

    pub(crate) fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn note(&self) -> String {
        self.note.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub(crate) fn set_note(&self, note: impl Into<String>) {
        if let Ok(mut slot) = self.note.lock() {
            *slot = note.into();
        }
    }

    /// Sticky demotion for the remainder of the process.
    pub(crate) fn demote(&self, note: impl Into<String>) {
        self.ready.store(false, Ordering::SeqCst);
        self.set_note(note);
    }
}

/// The single-method generation interface every substrate implements.
#[async_trait]
pub(crate) trait BackendAdapter: Send + Sync {
    /// Which substrate this is.
    fn kind(&self) -> BackendKind;

    /// Whether the engine should attempt this backend.
    fn ready(&self) -> bool;

    /// Human-readable last-status note for diagnostics.
    fn note(&self) -> String;

    /// Record a failure reason without changing readiness.
    fn set_note(&self, note: String);

    /// Turn a prepared prompt into text. Must stop in bounded time once
    /// `cancel` trips.
    async fn generate(
        &self,
        prompt: &str,
        opts: GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendFailure>;
}

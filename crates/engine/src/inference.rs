//! Per-worker inference engine: walks the ranked backend chain, isolates
//! failures, and keeps a status cell the pool reads for `Status()`.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::api::{BackendKind, BackendStatus, PoolConfig};
use crate::backends::embedded::EmbeddedAdapter;
use crate::backends::http::HttpAdapter;
use crate::backends::mock::MockAdapter;
use crate::backends::native::NativeAdapter;
use crate::backends::{BackendAdapter, BackendFailure, GenerateOptions};

/// Result of one engine-level generation.
#[derive(Debug)]
pub(crate) struct EngineReply {
    pub(crate) text: String,
    pub(crate) model: String,
    pub(crate) backend: BackendKind,
    pub(crate) latency_ms: u64,
    pub(crate) prompt_tokens: Option<u64>,
    pub(crate) completion_tokens: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EngineError {
    #[error("cancelled")]
    Cancelled,
    #[error("{message}")]
    AllFailed { message: String },
}

#[derive(Debug, Default, Clone)]
pub(crate) struct EngineStatusSnapshot {
    /// Backend that served the most recent successful generation.
    pub(crate) current: Option<BackendKind>,
    pub(crate) backends: Vec<BackendStatus>,
}

/// Small shared cell: written by the worker's engine, read by the pool
/// control loop when building status snapshots.
#[derive(Debug, Default)]
pub(crate) struct EngineStatusCell {
    inner: Mutex<EngineStatusSnapshot>,
}

impl EngineStatusCell {
    pub(crate) fn snapshot(&self) -> EngineStatusSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, current: Option<BackendKind>, backends: Vec<BackendStatus>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current = current;
        inner.backends = backends;
    }

    fn set_backends(&self, backends: Vec<BackendStatus>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.backends = backends;
    }
}

pub(crate) struct InferenceEngine {
    /// Adapters in fixed preference order; only ready ones are attempted.
    adapters: Vec<Box<dyn BackendAdapter>>,
    status: Arc<EngineStatusCell>,
}

impl InferenceEngine {
    pub(crate) async fn new(cfg: &PoolConfig, status: Arc<EngineStatusCell>) -> Self {
        let mut adapters: Vec<Box<dyn BackendAdapter>> = Vec::with_capacity(4);

        if let Some(http_cfg) = &cfg.http {
            match HttpAdapter::new(http_cfg) {
                Ok(adapter) => adapters.push(Box::new(adapter)),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "disabling http backend");
                }
            }
        }
        if let Some(native_cfg) = &cfg.native {
            adapters.push(Box::new(NativeAdapter::new(native_cfg)));
        }
        if let Some(runtime) = &cfg.embedded {
            adapters.push(Box::new(
                EmbeddedAdapter::new(runtime.clone(), cfg.sona.enabled).await,
            ));
        }
        adapters.push(Box::new(MockAdapter::new(cfg.mock_latency)));

        let engine = Self { adapters, status };
        engine.status.set(None, engine.backend_statuses());
        engine
    }

    fn backend_statuses(&self) -> Vec<BackendStatus> {
        self.adapters
            .iter()
            .map(|a| BackendStatus {
                backend: a.kind(),
                ready: a.ready(),
                note: a.note(),
            })
            .collect()
    }

    /// Walk the chain in preference order. The mock adapter is always ready,
    /// so a request is never rejected for "no backend"; cancellation is the
    /// only way out without a reply or a last error.
    pub(crate) async fn generate(
        &self,
        prompt: &str,
        opts: GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<EngineReply, EngineError> {
        let mut last_failure: Option<String> = None;

        for adapter in &self.adapters {
            if cancel.is_cancelled() {
                self.status.set_backends(self.backend_statuses());
                return Err(EngineError::Cancelled);
            }
            if !adapter.ready() {
                continue;
            }

            let started = Instant::now();
            match adapter.generate(prompt, opts, cancel).await {
                Ok(reply) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    adapter.set_note("healthy".to_string());
                    self.status
                        .set(Some(adapter.kind()), self.backend_statuses());
                    return Ok(EngineReply {
                        text: reply.text,
                        model: reply.model,
                        backend: adapter.kind(),
                        latency_ms,
                        prompt_tokens: reply.prompt_tokens,
                        completion_tokens: reply.completion_tokens,
                    });
                }
                Err(BackendFailure::Cancelled) => {
                    self.status.set_backends(self.backend_statuses());
                    return Err(EngineError::Cancelled);
                }
                Err(BackendFailure::CircuitOpen { retry_in_ms }) => {
                    last_failure = Some(format!(
                        "{}: circuit open (retry in {retry_in_ms} ms)",
                        adapter.kind()
                    ));
                }
                Err(BackendFailure::Degraded { note }) => {
                    tracing::warn!(backend = %adapter.kind(), %note, "backend demoted");
                    last_failure = Some(format!("{}: {note}", adapter.kind()));
                }
                Err(BackendFailure::Other(err)) => {
                    let message = format!("{err:#}");
                    adapter.set_note(format!("error: {message}"));
                    tracing::debug!(backend = %adapter.kind(), %message, "backend attempt failed");
                    last_failure = Some(format!("{}: {message}", adapter.kind()));
                }
            }
        }

        self.status.set_backends(self.backend_statuses());
        Err(EngineError::AllFailed {
            message: last_failure.unwrap_or_else(|| "no backend available".to_string()),
        })
    }
}

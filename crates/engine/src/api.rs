//! Public API types for the in-process `ruvltra` execution core.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use ruvltra_core::{HttpFormat, RuvltraConfig};

use crate::pool::PoolCommand;

/// Kind of code-assistance task a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Generate new code from an instruction.
    Generate,
    /// Review existing code.
    Review,
    /// Refactor existing code.
    Refactor,
    /// Explain existing code.
    Explain,
    /// Write tests for existing code.
    Test,
    /// Fix code given an error.
    Fix,
    /// Complete a code prefix.
    Complete,
    /// Translate code to another language.
    Translate,
}

impl TaskType {
    /// Stable lowercase name, used in prompts and pattern keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generate => "generate",
            TaskType::Review => "review",
            TaskType::Refactor => "refactor",
            TaskType::Explain => "explain",
            TaskType::Test => "test",
            TaskType::Fix => "fix",
            TaskType::Complete => "complete",
            TaskType::Translate => "translate",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to a single generation. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// What kind of task this is.
    pub task_type: TaskType,
    /// The (non-empty) user instruction.
    pub instruction: String,
    /// Optional code or document context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Optional programming language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Optional file path the request concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Per-request token budget override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Per-request temperature override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-request deadline override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl GenerateRequest {
    /// A minimal request with everything optional left unset.
    pub fn new(task_type: TaskType, instruction: impl Into<String>) -> Self {
        Self {
            task_type,
            instruction: instruction.into(),
            context: None,
            language: None,
            file_path: None,
            max_tokens: None,
            temperature: None,
            timeout_ms: None,
        }
    }
}

/// Which backend substrate produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Remote HTTP model API.
    Http,
    /// Local native model runner.
    Native,
    /// Embedded in-process learning runtime.
    Embedded,
    /// Deterministic mock (always available).
    Mock,
}

impl BackendKind {
    /// Stable lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::Native => "native",
            BackendKind::Embedded => "embedded",
            BackendKind::Mock => "mock",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful generation, with its provenance envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResult {
    /// The generated text.
    pub text: String,
    /// Pool-assigned task id (monotonic per process).
    pub task_id: u64,
    /// Worker that executed the task.
    pub worker_id: String,
    /// Backend that produced the text.
    pub backend: BackendKind,
    /// Model identifier reported by the backend.
    pub model: String,
    /// Measured backend latency in milliseconds.
    pub latency_ms: u64,
}

/// How a submitted task can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// The queue already holds `queueMaxLength` undispatched tasks.
    #[error("queue full ({queue_len} tasks waiting); retry in ~{retry_after_ms} ms")]
    QueueOverflow {
        /// Queue length observed at rejection.
        queue_len: usize,
        /// Suggested retry delay (a quarter of the default task timeout).
        retry_after_ms: u64,
    },
    /// The task missed its deadline.
    #[error("task timed out after {timeout_ms} ms")]
    Timeout {
        /// The effective deadline in milliseconds.
        timeout_ms: u64,
    },
    /// The task was cancelled by shutdown or a higher-level abort.
    #[error("task cancelled")]
    Cancelled,
    /// Every ready backend failed or short-circuited.
    #[error("all backends failed: {message}")]
    Backend {
        /// The last underlying failure.
        message: String,
    },
}

/// Lifetime counters of a pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounters {
    /// Tasks admitted.
    pub submitted: u64,
    /// Tasks settled successfully.
    pub completed: u64,
    /// Tasks settled with a backend failure.
    pub failed: u64,
    /// Tasks settled as cancelled (includes timeouts).
    pub cancelled: u64,
    /// Tasks settled as timed out.
    pub timed_out: u64,
    /// Submissions rejected at the queue boundary.
    pub rejected: u64,
}

/// Readiness and status note for one backend of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Which backend.
    pub backend: BackendKind,
    /// Whether the backend is currently attempted.
    pub ready: bool,
    /// Human-readable last-status note.
    pub note: String,
}

/// Runtime stats for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Stable worker id (`worker-N`).
    pub id: String,
    /// Tasks currently in flight (0 or 1).
    pub active_tasks: usize,
    /// Tasks completed successfully.
    pub completed_tasks: u64,
    /// Tasks that settled as failures.
    pub failed_tasks: u64,
    /// Milliseconds since the worker last started or finished a task.
    pub idle_ms: u64,
    /// Backend that served this worker's most recent generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    /// Per-backend readiness and notes.
    pub backends: Vec<BackendStatus>,
}

/// Snapshot of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Current worker count.
    pub workers: usize,
    /// Configured scale-down floor.
    pub min_workers: usize,
    /// Configured scale-up ceiling.
    pub max_workers: usize,
    /// Admitted-but-undispatched tasks.
    pub queue_len: usize,
    /// Tasks currently executing on a worker.
    pub in_flight: usize,
    /// Lifetime counters.
    pub counters: PoolCounters,
    /// Per-worker runtime stats.
    pub worker_stats: Vec<WorkerStats>,
    /// Worker count by currently-selected backend tag.
    pub backends: BTreeMap<String, usize>,
}

/// One pattern as reported by `SonaStats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStats {
    /// Derived pattern key (e.g. `task:review`, `lang:rust`, `kw:parser`).
    pub key: String,
    /// Running quality estimate in `[0.01, 1.0]`.
    pub score: f64,
    /// Stability weight in `[0.05, 0.99]`.
    pub importance: f64,
    /// Times the pattern was touched.
    pub hits: u64,
    /// Times it was touched by a successful interaction.
    pub successes: u64,
}

/// Pattern-memory stats for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Owning worker id.
    pub worker_id: String,
    /// Interactions recorded.
    pub interactions: u64,
    /// Successful interactions recorded.
    pub successes: u64,
    /// Live pattern count.
    pub pattern_count: usize,
    /// Consolidation sweeps performed.
    pub consolidations: u64,
    /// Unix timestamp of the last consolidation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_consolidated_at: Option<i64>,
    /// Highest-value patterns (the ones hint selection would pick from).
    pub top_patterns: Vec<PatternStats>,
}

/// Remote HTTP backend configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint URL (chat-completions or raw-completion shaped).
    pub endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Model identifier sent with requests.
    pub model: Option<String>,
    /// Wire shape (`Auto` infers from the endpoint path).
    pub format: HttpFormat,
    /// Per-try timeout.
    pub timeout: Duration,
    /// Retries after the first try.
    pub max_retries: u32,
    /// Exponential backoff base.
    pub retry_base: Duration,
    /// Consecutive failed tries before the circuit opens.
    pub circuit_failure_threshold: u32,
    /// Cooldown while the circuit is open.
    pub circuit_cooldown: Duration,
}

/// Local native runner configuration.
#[derive(Debug, Clone)]
pub struct NativeConfig {
    /// Model file loaded by the runner.
    pub model_path: PathBuf,
    /// Runner executable; `None` resolves `llama-cli` from `PATH`.
    pub runner_path: Option<PathBuf>,
    /// Context window.
    pub context_length: u32,
    /// GPU layers (`-1` = all).
    pub gpu_layers: i32,
    /// Threads (`0` = runner default).
    pub threads: u32,
}

/// Pattern-memory configuration.
#[derive(Debug, Clone)]
pub struct SonaConfig {
    /// Whether memory is recorded and used at all.
    pub enabled: bool,
    /// Snapshot directory; `None` disables persistence.
    pub state_dir: Option<PathBuf>,
    /// Persist every N recorded interactions.
    pub persist_interval: u32,
}

/// The in-process learning runtime backing the embedded backend.
///
/// This is an external collaborator: the engine only needs a callable that
/// turns a prompt into text, plus enough introspection to detect the
/// degraded (non-native) fallback build.
#[async_trait]
pub trait EmbeddedRuntime: Send + Sync {
    /// One-time setup. `model_dir` is a stable path outside any package
    /// cache; implementations may download model weights into it.
    async fn initialize(&self, model_dir: &Path) -> anyhow::Result<()>;

    /// Generate a completion.
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<String>;

    /// Whether the native compute module actually loaded.
    fn is_native_loaded(&self) -> bool;

    /// Version tag; a `-js` suffix marks the degraded fallback build.
    fn version(&self) -> String;

    /// Record a prompt/response trajectory for later training, if supported.
    fn record_trajectory(&self, _prompt: &str, _response: &str, _confidence: f32) {}
}

/// Configuration for a pool.
#[derive(Clone)]
pub struct PoolConfig {
    /// Scale-down floor.
    pub min_workers: usize,
    /// Scale-up ceiling.
    pub max_workers: usize,
    /// Workers created at startup.
    pub initial_workers: usize,
    /// Maximum admitted-but-undispatched tasks.
    pub queue_max_length: usize,
    /// Default per-task deadline.
    pub task_timeout: Duration,
    /// Pattern-memory settings.
    pub sona: SonaConfig,
    /// Remote HTTP backend; `None` disables it.
    pub http: Option<HttpConfig>,
    /// Native runner backend; `None` disables it.
    pub native: Option<NativeConfig>,
    /// Embedded learning runtime; `None` disables that backend.
    pub embedded: Option<Arc<dyn EmbeddedRuntime>>,
    /// Default token budget.
    pub max_tokens: u32,
    /// Default temperature.
    pub temperature: f32,
    /// Simulated mock-backend latency.
    pub mock_latency: Duration,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("initial_workers", &self.initial_workers)
            .field("queue_max_length", &self.queue_max_length)
            .field("task_timeout", &self.task_timeout)
            .field("http", &self.http.as_ref().map(|h| h.endpoint.as_str()))
            .field("native", &self.native.as_ref().map(|n| n.model_path.as_path()))
            .field("embedded", &self.embedded.is_some())
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    /// Workers idle longer than this are eligible for scale-down.
    pub const IDLE_SCALE_DOWN: Duration = Duration::from_secs(20);

    /// Cadence of the idle scale-down sweep.
    pub const HEARTBEAT: Duration = Duration::from_secs(5);

    /// Build a pool configuration from the operator config surface.
    pub fn from_settings(cfg: &RuvltraConfig) -> Self {
        let http = cfg.http_endpoint.as_ref().map(|endpoint| HttpConfig {
            endpoint: endpoint.clone(),
            api_key: cfg.http_api_key.clone(),
            model: cfg.http_model.clone(),
            format: cfg.http_format,
            timeout: Duration::from_millis(cfg.http_timeout_ms),
            max_retries: cfg.http_max_retries,
            retry_base: Duration::from_millis(cfg.http_retry_base_ms),
            circuit_failure_threshold: cfg.http_circuit_failure_threshold,
            circuit_cooldown: Duration::from_millis(cfg.http_circuit_cooldown_ms),
        });
        let native = cfg.model_path.as_ref().map(|model_path| NativeConfig {
            model_path: model_path.clone(),
            runner_path: cfg.native_runner_path.clone(),
            context_length: cfg.context_length,
            gpu_layers: cfg.gpu_layers,
            threads: cfg.threads,
        });

        Self {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_workers,
            initial_workers: cfg.initial_workers,
            queue_max_length: cfg.queue_max_length,
            task_timeout: Duration::from_millis(cfg.task_timeout_ms),
            sona: SonaConfig {
                enabled: cfg.sona_enabled,
                state_dir: cfg.sona_state_dir.clone(),
                persist_interval: cfg.sona_persist_interval,
            },
            http,
            native,
            embedded: None,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            mock_latency: Duration::from_millis(cfg.mock_latency_ms),
        }
    }
}

/// Handle to a running pool instance. Cheap to clone.
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) cmd_tx: mpsc::Sender<PoolCommand>,
}

/// Start a new in-process pool instance.
pub fn start_pool(config: PoolConfig) -> PoolHandle {
    crate::pool::start_pool(config)
}

impl PoolHandle {
    /// Submit a request and wait for it to settle.
    pub async fn submit(&self, request: GenerateRequest) -> Result<GenerateResult, TaskError> {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Submit { request, respond })
            .await
            .is_err()
        {
            return Err(TaskError::Cancelled);
        }
        rx.await.unwrap_or(Err(TaskError::Cancelled))
    }

    /// Snapshot the pool state.
    pub async fn status(&self) -> Result<PoolStatus, TaskError> {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Status { respond })
            .await
            .is_err()
        {
            return Err(TaskError::Cancelled);
        }
        rx.await.map_err(|_| TaskError::Cancelled)
    }

    /// Pattern-memory stats, for one worker or all.
    pub async fn sona_stats(
        &self,
        worker_id: Option<String>,
    ) -> Result<Vec<MemoryStats>, TaskError> {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::SonaStats { worker_id, respond })
            .await
            .is_err()
        {
            return Err(TaskError::Cancelled);
        }
        rx.await.map_err(|_| TaskError::Cancelled)
    }

    /// Resize the pool, clamped to `[minWorkers, maxWorkers]`. Running tasks
    /// are never aborted; only idle workers are removed.
    pub async fn scale(&self, target: usize) -> Result<PoolStatus, TaskError> {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Scale { target, respond })
            .await
            .is_err()
        {
            return Err(TaskError::Cancelled);
        }
        rx.await.map_err(|_| TaskError::Cancelled)
    }

    /// Stop the pool: cancel pending and running tasks, flush every worker's
    /// pattern memory, release backend resources. Resolves once done.
    pub async fn shutdown(&self) {
        let (respond, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Shutdown { respond })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

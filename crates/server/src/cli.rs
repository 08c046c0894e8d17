use std::path::PathBuf;

use clap::Parser;

use ruvltra_core::{HttpFormat, RuvltraConfig};

fn parse_http_format(input: &str) -> Result<HttpFormat, String> {
    match input.to_ascii_lowercase().as_str() {
        "auto" => Ok(HttpFormat::Auto),
        "openai" => Ok(HttpFormat::OpenAi),
        "llama" => Ok(HttpFormat::Llama),
        other => Err(format!(
            "invalid http format {other:?} (expected auto, openai or llama)"
        )),
    }
}

/// Every operator knob is a flag with an env fallback; unset flags defer to
/// the config file, which defers to the documented defaults.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ruvltra",
    version,
    about = "Local code-assistance service over JSON-RPC stdio"
)]
pub struct Cli {
    /// JSON config file (defaults to the XDG config path when present).
    #[arg(long, env = "RUVLTRA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Scale-down floor for the worker pool.
    #[arg(long, env = "RUVLTRA_MIN_WORKERS")]
    pub min_workers: Option<usize>,

    /// Scale-up ceiling for the worker pool.
    #[arg(long, env = "RUVLTRA_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Workers created at startup.
    #[arg(long, env = "RUVLTRA_INITIAL_WORKERS")]
    pub initial_workers: Option<usize>,

    /// Maximum admitted-but-undispatched tasks.
    #[arg(long, env = "RUVLTRA_QUEUE_MAX_LENGTH")]
    pub queue_max_length: Option<usize>,

    /// Default per-task deadline in milliseconds.
    #[arg(long, env = "RUVLTRA_TASK_TIMEOUT_MS")]
    pub task_timeout_ms: Option<u64>,

    /// Enable or disable per-worker pattern memory.
    #[arg(long, env = "RUVLTRA_SONA_ENABLED")]
    pub sona_enabled: Option<bool>,

    /// Directory for persisted memory snapshots.
    #[arg(long, env = "RUVLTRA_SONA_STATE_DIR")]
    pub sona_state_dir: Option<PathBuf>,

    /// Persist a worker's memory every N recorded interactions.
    #[arg(long, env = "RUVLTRA_SONA_PERSIST_INTERVAL")]
    pub sona_persist_interval: Option<u32>,

    /// Remote model endpoint URL.
    #[arg(long, env = "RUVLTRA_HTTP_ENDPOINT")]
    pub http_endpoint: Option<String>,

    /// Bearer token for the remote endpoint.
    #[arg(long, env = "RUVLTRA_HTTP_API_KEY")]
    pub http_api_key: Option<String>,

    /// Model identifier sent to the remote endpoint.
    #[arg(long, env = "RUVLTRA_HTTP_MODEL")]
    pub http_model: Option<String>,

    /// Remote wire shape: auto, openai or llama.
    #[arg(long, env = "RUVLTRA_HTTP_FORMAT", value_parser = parse_http_format)]
    pub http_format: Option<HttpFormat>,

    /// Per-try HTTP timeout in milliseconds.
    #[arg(long, env = "RUVLTRA_HTTP_TIMEOUT_MS")]
    pub http_timeout_ms: Option<u64>,

    /// HTTP retries after the first try.
    #[arg(long, env = "RUVLTRA_HTTP_MAX_RETRIES")]
    pub http_max_retries: Option<u32>,

    /// Base of the exponential HTTP retry backoff in milliseconds.
    #[arg(long, env = "RUVLTRA_HTTP_RETRY_BASE_MS")]
    pub http_retry_base_ms: Option<u64>,

    /// Consecutive failed tries before the remote circuit opens.
    #[arg(long, env = "RUVLTRA_HTTP_CIRCUIT_FAILURE_THRESHOLD")]
    pub http_circuit_failure_threshold: Option<u32>,

    /// Open-circuit cooldown in milliseconds.
    #[arg(long, env = "RUVLTRA_HTTP_CIRCUIT_COOLDOWN_MS")]
    pub http_circuit_cooldown_ms: Option<u64>,

    /// Local model file for the native backend.
    #[arg(long, env = "RUVLTRA_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Runner executable for the native backend (default: llama-cli on PATH).
    #[arg(long, env = "RUVLTRA_NATIVE_RUNNER_PATH")]
    pub native_runner_path: Option<PathBuf>,

    /// Context window passed to the native runner.
    #[arg(long, env = "RUVLTRA_CONTEXT_LENGTH")]
    pub context_length: Option<u32>,

    /// GPU layers passed to the native runner (-1 = all).
    #[arg(long, env = "RUVLTRA_GPU_LAYERS", allow_hyphen_values = true)]
    pub gpu_layers: Option<i32>,

    /// Thread count passed to the native runner (0 = runner default).
    #[arg(long, env = "RUVLTRA_THREADS")]
    pub threads: Option<u32>,

    /// Default token budget for a generation.
    #[arg(long, env = "RUVLTRA_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Default sampling temperature.
    #[arg(long, env = "RUVLTRA_TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Simulated latency of the mock backend in milliseconds.
    #[arg(long, env = "RUVLTRA_MOCK_LATENCY_MS")]
    pub mock_latency_ms: Option<u64>,

    /// Diagnostic log level (error, warn, info, debug, trace).
    #[arg(long, env = "RUVLTRA_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Overlay set flags onto `cfg`; unset flags leave it untouched.
    pub fn apply(&self, cfg: &mut RuvltraConfig) {
        if let Some(v) = self.min_workers {
            cfg.min_workers = v;
        }
        if let Some(v) = self.max_workers {
            cfg.max_workers = v;
        }
        if let Some(v) = self.initial_workers {
            cfg.initial_workers = v;
        }
        if let Some(v) = self.queue_max_length {
            cfg.queue_max_length = v;
        }
        if let Some(v) = self.task_timeout_ms {
            cfg.task_timeout_ms = v;
        }
        if let Some(v) = self.sona_enabled {
            cfg.sona_enabled = v;
        }
        if let Some(v) = &self.sona_state_dir {
            cfg.sona_state_dir = Some(v.clone());
        }
        if let Some(v) = self.sona_persist_interval {
            cfg.sona_persist_interval = v;
        }
        if let Some(v) = &self.http_endpoint {
            cfg.http_endpoint = Some(v.clone());
        }
        if let Some(v) = &self.http_api_key {
            cfg.http_api_key = Some(v.clone());
        }
        if let Some(v) = &self.http_model {
            cfg.http_model = Some(v.clone());
        }
        if let Some(v) = self.http_format {
            cfg.http_format = v;
        }
        if let Some(v) = self.http_timeout_ms {
            cfg.http_timeout_ms = v;
        }
        if let Some(v) = self.http_max_retries {
            cfg.http_max_retries = v;
        }
        if let Some(v) = self.http_retry_base_ms {
            cfg.http_retry_base_ms = v;
        }
        if let Some(v) = self.http_circuit_failure_threshold {
            cfg.http_circuit_failure_threshold = v;
        }
        if let Some(v) = self.http_circuit_cooldown_ms {
            cfg.http_circuit_cooldown_ms = v;
        }
        if let Some(v) = &self.model_path {
            cfg.model_path = Some(v.clone());
        }
        if let Some(v) = &self.native_runner_path {
            cfg.native_runner_path = Some(v.clone());
        }
        if let Some(v) = self.context_length {
            cfg.context_length = v;
        }
        if let Some(v) = self.gpu_layers {
            cfg.gpu_layers = v;
        }
        if let Some(v) = self.threads {
            cfg.threads = v;
        }
        if let Some(v) = self.max_tokens {
            cfg.max_tokens = v;
        }
        if let Some(v) = self.temperature {
            cfg.temperature = v;
        }
        if let Some(v) = self.mock_latency_ms {
            cfg.mock_latency_ms = v;
        }
        if let Some(v) = &self.log_level {
            cfg.log_level = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_flags_keep_config_defaults() {
        let cli = Cli::parse_from(["ruvltra"]);
        let mut cfg = RuvltraConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.min_workers, 2);
        assert_eq!(cfg.queue_max_length, 256);
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "ruvltra",
            "--max-workers",
            "4",
            "--http-endpoint",
            "http://localhost:8080/v1/chat/completions",
            "--http-format",
            "openai",
        ]);
        let mut cfg = RuvltraConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(
            cfg.http_endpoint.as_deref(),
            Some("http://localhost:8080/v1/chat/completions")
        );
        assert_eq!(cfg.http_format, HttpFormat::OpenAi);
    }
}

//! The operator-facing configuration surface.
//!
//! Field names (camelCase in the JSON file) are a contract: they match the
//! environment/CLI knobs documented for the service. Values are clamped to
//! sane ranges on load; a malformed file is reported to the caller, which is
//! expected to fall back to defaults rather than abort.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Wire shape spoken by the remote HTTP model backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpFormat {
    /// Infer the shape from the endpoint path.
    #[default]
    Auto,
    /// Chat-completions shape (message array, `max_tokens`).
    OpenAi,
    /// Raw completion shape (single `prompt`, `n_predict`).
    Llama,
}

/// Full configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuvltraConfig {
    /// Lower bound on the worker count (scale-down floor).
    pub min_workers: usize,
    /// Upper bound on the worker count (scale-up ceiling).
    pub max_workers: usize,
    /// Workers created at startup.
    pub initial_workers: usize,
    /// Maximum number of admitted-but-undispatched tasks.
    pub queue_max_length: usize,
    /// Default per-task deadline in milliseconds.
    pub task_timeout_ms: u64,

    /// Whether per-worker pattern memory is enabled.
    pub sona_enabled: bool,
    /// Directory for persisted memory snapshots. `None` uses the XDG state dir.
    pub sona_state_dir: Option<PathBuf>,
    /// Persist a worker's memory every N recorded interactions.
    pub sona_persist_interval: u32,

    /// Remote model endpoint URL. `None` disables the HTTP backend.
    pub http_endpoint: Option<String>,
    /// Bearer token sent with remote requests.
    pub http_api_key: Option<String>,
    /// Model identifier sent with remote requests.
    pub http_model: Option<String>,
    /// Wire shape of the remote endpoint.
    pub http_format: HttpFormat,
    /// Per-try HTTP timeout in milliseconds.
    pub http_timeout_ms: u64,
    /// Retries after the first HTTP try (so `n + 1` tries total).
    pub http_max_retries: u32,
    /// Base of the exponential retry backoff in milliseconds.
    pub http_retry_base_ms: u64,
    /// Consecutive failed tries before the remote circuit opens.
    pub http_circuit_failure_threshold: u32,
    /// How long an open circuit blocks remote attempts, in milliseconds.
    pub http_circuit_cooldown_ms: u64,

    /// Local model file for the native backend. `None` disables it.
    pub model_path: Option<PathBuf>,
    /// Runner executable for the native backend. `None` resolves `llama-cli`
    /// from `PATH`.
    pub native_runner_path: Option<PathBuf>,
    /// Context window passed to the native runner.
    pub context_length: u32,
    /// GPU layers passed to the native runner (`-1` = all).
    pub gpu_layers: i32,
    /// Thread count passed to the native runner (`0` = runner default).
    pub threads: u32,

    /// Default token budget for a generation.
    pub max_tokens: u32,
    /// Default sampling temperature.
    pub temperature: f32,

    /// Simulated latency of the mock backend in milliseconds.
    pub mock_latency_ms: u64,

    /// Diagnostic log level (`error`..`trace`), written to stderr only.
    pub log_level: String,
}

impl Default for RuvltraConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            initial_workers: 2,
            queue_max_length: 256,
            task_timeout_ms: 60_000,
            sona_enabled: true,
            sona_state_dir: None,
            sona_persist_interval: 10,
            http_endpoint: None,
            http_api_key: None,
            http_model: None,
            http_format: HttpFormat::Auto,
            http_timeout_ms: 15_000,
            http_max_retries: 2,
            http_retry_base_ms: 250,
            http_circuit_failure_threshold: 5,
            http_circuit_cooldown_ms: 30_000,
            model_path: None,
            native_runner_path: None,
            context_length: 4096,
            gpu_layers: -1,
            threads: 0,
            max_tokens: 512,
            temperature: 0.2,
            mock_latency_ms: 120,
            log_level: "info".to_string(),
        }
    }
}

impl RuvltraConfig {
    /// Clamp every field to its legal range.
    ///
    /// Called after any load path (file, env, CLI) so the rest of the system
    /// never sees an out-of-range value.
    pub fn clamp(&mut self) {
        self.min_workers = self.min_workers.clamp(1, 64);
        self.max_workers = self.max_workers.clamp(self.min_workers, 64);
        self.initial_workers = self.initial_workers.clamp(self.min_workers, self.max_workers);
        self.queue_max_length = self.queue_max_length.clamp(1, 65_536);
        self.task_timeout_ms = self.task_timeout_ms.clamp(100, 3_600_000);
        self.sona_persist_interval = self.sona_persist_interval.clamp(1, 10_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(100, 300_000);
        self.http_max_retries = self.http_max_retries.min(10);
        self.http_retry_base_ms = self.http_retry_base_ms.clamp(10, 60_000);
        self.http_circuit_failure_threshold = self.http_circuit_failure_threshold.clamp(1, 1000);
        self.http_circuit_cooldown_ms = self.http_circuit_cooldown_ms.clamp(100, 600_000);
        self.context_length = self.context_length.clamp(256, 1_048_576);
        self.gpu_layers = self.gpu_layers.max(-1);
        self.threads = self.threads.min(1024);
        self.max_tokens = self.max_tokens.clamp(1, 65_536);
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.mock_latency_ms = self.mock_latency_ms.min(60_000);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.http_endpoint = self.http_endpoint.take().and_then(non_empty);
        self.http_api_key = self.http_api_key.take().and_then(non_empty);
        self.http_model = self.http_model.take().and_then(non_empty);
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

fn xdg_state_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_STATE_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("state"))
}

/// Default location of the config file.
pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("ruvltra").join("config.json"))
}

/// Default directory for persisted pattern-memory snapshots.
pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    Ok(xdg_state_home()?.join("ruvltra").join("sona"))
}

/// Load and clamp a config file.
///
/// Returns `Ok(None)` when the file does not exist. A file that exists but
/// fails to parse is an error the caller is expected to log and ignore.
pub fn load_config(path: &Path) -> anyhow::Result<Option<RuvltraConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut cfg: RuvltraConfig = serde_json::from_str(&raw)?;
    cfg.clamp();
    Ok(Some(cfg))
}

/// Save a config file, creating parent directories and replacing atomically.
pub fn save_config(path: &Path, cfg: &RuvltraConfig) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.clamp();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuvltraConfig::default();
        assert_eq!(cfg.min_workers, 2);
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.queue_max_length, 256);
        assert_eq!(cfg.task_timeout_ms, 60_000);
        assert_eq!(cfg.http_timeout_ms, 15_000);
        assert_eq!(cfg.http_circuit_failure_threshold, 5);
        assert_eq!(cfg.max_tokens, 512);
        assert!(cfg.sona_enabled);
    }

    #[test]
    fn clamp_repairs_inverted_worker_bounds() {
        let mut cfg = RuvltraConfig {
            min_workers: 10,
            max_workers: 3,
            initial_workers: 0,
            ..RuvltraConfig::default()
        };
        cfg.clamp();
        assert!(cfg.min_workers <= cfg.max_workers);
        assert!(cfg.initial_workers >= cfg.min_workers);
        assert!(cfg.initial_workers <= cfg.max_workers);
    }

    #[test]
    fn clamp_drops_empty_strings() {
        let mut cfg = RuvltraConfig {
            http_endpoint: Some("  ".to_string()),
            http_model: Some(" codellama ".to_string()),
            ..RuvltraConfig::default()
        };
        cfg.clamp();
        assert_eq!(cfg.http_endpoint, None);
        assert_eq!(cfg.http_model.as_deref(), Some("codellama"));
    }

    #[test]
    fn file_keys_are_camel_case() {
        let json = serde_json::to_string(&RuvltraConfig::default()).unwrap();
        assert!(json.contains("\"minWorkers\""));
        assert!(json.contains("\"queueMaxLength\""));
        assert!(json.contains("\"httpCircuitCooldownMs\""));
        assert!(json.contains("\"sonaPersistInterval\""));
    }
}

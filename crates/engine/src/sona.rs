//! SONA pattern memory: a per-worker bag of scored patterns that rewrites
//! future instructions with learned preferences.
//!
//! High-importance patterns learn slowly and successful hits cement them;
//! a periodic consolidation sweep evicts stale and low-value entries so the
//! map stays bounded. Snapshots persist as versioned JSON; anything
//! malformed on disk is skipped and the worker starts empty.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api::{MemoryStats, PatternStats, SonaConfig, TaskType};

const MEMORY_VERSION: u32 = 1;

const SCORE_MIN: f64 = 0.01;
const SCORE_MAX: f64 = 1.0;
const IMPORTANCE_MIN: f64 = 0.05;
const IMPORTANCE_MAX: f64 = 0.99;

const LEARNING_RATE: f64 = 0.28;
const IMPORTANCE_DECAY: f64 = 0.97;
const IMPORTANCE_GAIN_SUCCESS: f64 = 0.06;
const IMPORTANCE_GAIN_FAILURE: f64 = 0.01;

const CONSOLIDATE_EVERY: u64 = 20;
const MAX_PATTERNS: usize = 600;
const MAX_KEYWORD_KEYS: usize = 6;
const MIN_KEYWORD_LEN: usize = 4;
const MAX_HINTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pattern {
    key: String,
    score: f64,
    importance: f64,
    hits: u64,
    successes: u64,
    last_seen_at: i64,
}

impl Pattern {
    fn fresh(key: String, now: i64) -> Self {
        Self {
            key,
            score: 0.5,
            importance: 0.1,
            hits: 0,
            successes: 0,
            last_seen_at: now,
        }
    }

    fn clamp(&mut self) {
        self.score = self.score.clamp(SCORE_MIN, SCORE_MAX);
        self.importance = self.importance.clamp(IMPORTANCE_MIN, IMPORTANCE_MAX);
    }

    fn value(&self) -> f64 {
        0.65 * self.score + 0.35 * self.importance
    }

    fn rank(&self) -> f64 {
        0.7 * self.score + 0.3 * self.importance
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedMemory {
    version: u32,
    worker_id: String,
    interactions: u64,
    successes: u64,
    consolidations: u64,
    #[serde(default)]
    last_consolidated_at: Option<i64>,
    /// Kept loose so one malformed record does not poison the file.
    patterns: Vec<serde_json::Value>,
}

/// One finished interaction, as seen by the memory.
pub(crate) struct InteractionOutcome<'a> {
    pub(crate) task_type: TaskType,
    pub(crate) language: Option<&'a str>,
    pub(crate) file_path: Option<&'a str>,
    /// The original (pre-rewrite) instruction.
    pub(crate) instruction: &'a str,
    pub(crate) response: Option<&'a str>,
    pub(crate) success: bool,
    pub(crate) latency_ms: u64,
    pub(crate) prompt_tokens: Option<u64>,
    pub(crate) completion_tokens: Option<u64>,
}

pub(crate) struct PatternMemory {
    worker_id: String,
    enabled: bool,
    state_path: Option<PathBuf>,
    persist_interval: u32,
    patterns: HashMap<String, Pattern>,
    interactions: u64,
    successes: u64,
    consolidations: u64,
    last_consolidated_at: Option<i64>,
    recorded_since_persist: u32,
}

impl PatternMemory {
    /// Create the memory for `worker_id`, loading a persisted snapshot when
    /// one exists. A missing, version-mismatched or unparseable file means
    /// starting empty.
    pub(crate) fn load(worker_id: &str, cfg: &SonaConfig) -> Self {
        let state_path = cfg
            .state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{worker_id}.json")));

        let mut memory = Self {
            worker_id: worker_id.to_string(),
            enabled: cfg.enabled,
            state_path,
            persist_interval: cfg.persist_interval.max(1),
            patterns: HashMap::new(),
            interactions: 0,
            successes: 0,
            consolidations: 0,
            last_consolidated_at: None,
            recorded_since_persist: 0,
        };

        if !memory.enabled {
            return memory;
        }
        let Some(path) = memory.state_path.clone() else {
            return memory;
        };
        match read_snapshot(&path) {
            Ok(Some(file)) => {
                memory.interactions = file.interactions;
                memory.successes = file.successes;
                memory.consolidations = file.consolidations;
                memory.last_consolidated_at = file.last_consolidated_at;
                for raw in file.patterns {
                    let Ok(mut pattern) = serde_json::from_value::<Pattern>(raw) else {
                        continue;
                    };
                    pattern.clamp();
                    memory.patterns.insert(pattern.key.clone(), pattern);
                }
                tracing::debug!(
                    worker = %memory.worker_id,
                    patterns = memory.patterns.len(),
                    interactions = memory.interactions,
                    "restored pattern memory"
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    worker = %memory.worker_id,
                    error = %format!("{err:#}"),
                    "ignoring unreadable pattern memory snapshot"
                );
            }
        }
        memory
    }

    /// Prepend learned preference hints to `instruction`. Returns the
    /// instruction unchanged when memory is disabled or has nothing to say.
    pub(crate) fn rewrite(
        &self,
        task_type: TaskType,
        language: Option<&str>,
        instruction: &str,
    ) -> String {
        if !self.enabled || self.patterns.is_empty() {
            return instruction.to_string();
        }

        let task_key = format!("task:{task_type}");
        let lang_key = language.map(|l| format!("lang:{}", l.to_lowercase()));

        let mut candidates: Vec<&Pattern> = self
            .patterns
            .values()
            .filter(|p| {
                p.key == task_key
                    || p.key == "task:general"
                    || lang_key.as_deref() == Some(p.key.as_str())
                    || p.key.starts_with("kw:")
                    || p.key.starts_with("pattern:")
            })
            .collect();
        // Rank ties break on the key so hint order is stable across restarts.
        candidates.sort_by(|a, b| {
            b.rank()
                .total_cmp(&a.rank())
                .then_with(|| a.key.cmp(&b.key))
        });

        let hints: Vec<String> = candidates
            .iter()
            .take(MAX_HINTS)
            .filter_map(|p| hint_phrase(&p.key))
            .collect();
        if hints.is_empty() {
            return instruction.to_string();
        }

        let mut out = String::from("Apply these learned project preferences before answering:\n");
        for (idx, hint) in hints.iter().enumerate() {
            out.push_str(&format!("{}. {hint}\n", idx + 1));
        }
        out.push('\n');
        out.push_str(instruction);
        out
    }

    /// Record one finished interaction. Returns `true` when the caller
    /// should persist the snapshot now.
    pub(crate) fn record(&mut self, outcome: &InteractionOutcome<'_>) -> bool {
        self.record_at(outcome, Utc::now().timestamp())
    }

    fn record_at(&mut self, outcome: &InteractionOutcome<'_>, now: i64) -> bool {
        if !self.enabled {
            return false;
        }

        let q = quality(outcome);
        for key in extract_keys(outcome) {
            let pattern = self
                .patterns
                .entry(key.clone())
                .or_insert_with(|| Pattern::fresh(key, now));
            pattern.hits += 1;
            if outcome.success {
                pattern.successes += 1;
            }
            pattern.last_seen_at = now;

            let plasticity = (1.0 - pattern.importance).max(0.05);
            let alpha = LEARNING_RATE * plasticity;
            pattern.score = pattern.score * (1.0 - alpha) + q * alpha;

            let gain = if outcome.success {
                IMPORTANCE_GAIN_SUCCESS
            } else {
                IMPORTANCE_GAIN_FAILURE
            };
            pattern.importance = pattern.importance * IMPORTANCE_DECAY + gain;
            pattern.clamp();
        }

        self.interactions += 1;
        if outcome.success {
            self.successes += 1;
        }
        self.recorded_since_persist = self.recorded_since_persist.saturating_add(1);

        if self.interactions % CONSOLIDATE_EVERY == 0 {
            self.consolidate_at(now);
            return self.state_path.is_some();
        }
        self.state_path.is_some() && self.recorded_since_persist >= self.persist_interval
    }

    fn consolidate_at(&mut self, now: i64) {
        self.patterns.retain(|_, p| {
            let age_minutes = (now - p.last_seen_at) as f64 / 60.0;
            let stale_one_off = p.hits <= 1 && age_minutes > 30.0;
            let low_value = p.value() < 0.22 && age_minutes > 10.0;
            !(stale_one_off || low_value)
        });

        if self.patterns.len() > MAX_PATTERNS {
            let mut ranked: Vec<(String, f64)> = self
                .patterns
                .iter()
                .map(|(k, p)| (k.clone(), p.rank()))
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
            let excess = self.patterns.len() - MAX_PATTERNS;
            for (key, _) in ranked.into_iter().take(excess) {
                self.patterns.remove(&key);
            }
        }

        self.consolidations += 1;
        self.last_consolidated_at = Some(now);
    }

    /// Write the snapshot to disk. I/O failures are logged and swallowed:
    /// a memory flush must never take down a worker.
    pub(crate) async fn persist(&mut self) {
        let Some(path) = self.state_path.clone() else {
            return;
        };
        if !self.enabled {
            return;
        }

        self.consolidate_at(Utc::now().timestamp());
        self.recorded_since_persist = 0;

        let mut patterns: Vec<&Pattern> = self.patterns.values().collect();
        patterns.sort_by(|a, b| a.key.cmp(&b.key));
        let file = PersistedMemory {
            version: MEMORY_VERSION,
            worker_id: self.worker_id.clone(),
            interactions: self.interactions,
            successes: self.successes,
            consolidations: self.consolidations,
            last_consolidated_at: self.last_consolidated_at,
            patterns: patterns
                .into_iter()
                .filter_map(|p| serde_json::to_value(p).ok())
                .collect(),
        };

        let res = tokio::task::spawn_blocking(move || write_snapshot(&path, &file)).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    worker = %self.worker_id,
                    error = %format!("{err:#}"),
                    "failed to persist pattern memory"
                );
            }
            Err(err) => {
                tracing::warn!(
                    worker = %self.worker_id,
                    error = %err,
                    "pattern memory persist task failed"
                );
            }
        }
    }

    /// Unconditional persist, used on worker removal and shutdown.
    pub(crate) async fn flush(&mut self) {
        if self.enabled && self.state_path.is_some() && self.interactions > 0 {
            self.persist().await;
        }
    }

    pub(crate) fn stats(&self) -> MemoryStats {
        let mut ranked: Vec<&Pattern> = self.patterns.values().collect();
        ranked.sort_by(|a, b| {
            b.rank()
                .total_cmp(&a.rank())
                .then_with(|| a.key.cmp(&b.key))
        });

        MemoryStats {
            worker_id: self.worker_id.clone(),
            interactions: self.interactions,
            successes: self.successes,
            pattern_count: self.patterns.len(),
            consolidations: self.consolidations,
            last_consolidated_at: self.last_consolidated_at,
            top_patterns: ranked
                .into_iter()
                .take(5)
                .map(|p| PatternStats {
                    key: p.key.clone(),
                    score: p.score,
                    importance: p.importance,
                    hits: p.hits,
                    successes: p.successes,
                })
                .collect(),
        }
    }
}

/// Quality estimate of one interaction, in `[0.05, 1.0]`.
fn quality(outcome: &InteractionOutcome<'_>) -> f64 {
    let base = if outcome.success { 0.8 } else { 0.2 };
    let latency_penalty = (outcome.latency_ms as f64 / 12_000.0).min(0.4);
    let token_bonus = outcome
        .completion_tokens
        .map(|t| (t as f64 / 1_600.0).min(0.15))
        .unwrap_or(0.0);
    let prompt_penalty = outcome
        .prompt_tokens
        .map(|t| (t as f64 / 8_000.0).min(0.08))
        .unwrap_or(0.0);
    (base + token_bonus - latency_penalty - prompt_penalty).clamp(0.05, 1.0)
}

/// Deduplicated pattern keys for one interaction, in extraction order.
fn extract_keys(outcome: &InteractionOutcome<'_>) -> Vec<String> {
    fn push(seen: &mut HashSet<String>, keys: &mut Vec<String>, key: String) {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }

    let mut keys = Vec::new();
    let mut seen = HashSet::new();

    push(&mut seen, &mut keys, format!("task:{}", outcome.task_type));
    push(&mut seen, &mut keys, "task:general".to_string());

    if let Some(language) = outcome.language {
        push(&mut seen, &mut keys, format!("lang:{}", language.to_lowercase()));
    }
    if let Some(path) = outcome.file_path {
        if let Some(ext) = path.rsplit('.').next() {
            if ext.len() < path.len() && !ext.is_empty() {
                push(&mut seen, &mut keys, format!("fileext:{}", ext.to_lowercase()));
            }
        }
    }

    let lowered = outcome.instruction.to_lowercase();
    let mut kw_count = 0;
    for word in lowered.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if kw_count >= MAX_KEYWORD_KEYS {
            break;
        }
        if word.len() >= MIN_KEYWORD_LEN {
            let key = format!("kw:{word}");
            if seen.insert(key.clone()) {
                keys.push(key);
                kw_count += 1;
            }
        }
    }

    if let Some(response) = outcome.response {
        if response.contains("try") && response.contains("catch") {
            push(&mut seen, &mut keys, "pattern:error-handling".to_string());
        }
        if response.contains("interface ") || response.contains("type ") {
            push(&mut seen, &mut keys, "pattern:typed-api".to_string());
        }
    }

    keys
}

/// Directive phrase for one pattern key family.
fn hint_phrase(key: &str) -> Option<String> {
    if let Some(task) = key.strip_prefix("task:") {
        if task == "general" {
            return Some("Favor approaches that have worked on this project before.".to_string());
        }
        return Some(format!("Optimize the answer for a {task} task."));
    }
    if let Some(lang) = key.strip_prefix("lang:") {
        return Some(format!("Use idiomatic {lang} style."));
    }
    if let Some(word) = key.strip_prefix("kw:") {
        return Some(format!("Respect prior preferences around \"{word}\"."));
    }
    if let Some(ext) = key.strip_prefix("fileext:") {
        return Some(format!("Match the formatting conventions of .{ext} files."));
    }
    match key {
        "pattern:error-handling" => Some("Include defensive error handling.".to_string()),
        "pattern:typed-api" => Some("Keep interfaces and type contracts explicit.".to_string()),
        _ => None,
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<Option<PersistedMemory>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let file: PersistedMemory = serde_json::from_str(&raw)?;
    if file.version != MEMORY_VERSION {
        anyhow::bail!("snapshot version {} (expected {MEMORY_VERSION})", file.version);
    }
    Ok(Some(file))
}

fn write_snapshot(path: &Path, file: &PersistedMemory) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid snapshot path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

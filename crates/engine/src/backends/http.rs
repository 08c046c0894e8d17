//! Remote HTTP model adapter: chat-completions or raw-completion wire
//! shapes, per-try timeout, retry with exponential backoff, and a circuit
//! breaker that isolates a failing endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{StatusCode, Url};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use ruvltra_core::HttpFormat;

use super::{AdapterState, BackendAdapter, BackendFailure, BackendReply, GenerateOptions};
use crate::api::{BackendKind, HttpConfig};
use crate::breaker::{Admission, CircuitBreaker, CircuitState};

const MAX_BACKOFF: Duration = Duration::from_secs(15);
const MAX_JITTER_MS: u64 = 50;

/// Fields searched (recursively, in this order) for raw-completion output.
const CONTENT_FIELDS: [&str; 6] = [
    "content",
    "text",
    "response",
    "completion",
    "generated_text",
    "output",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireShape {
    Chat,
    Raw,
}

enum TryFailure {
    Cancelled,
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

pub(crate) struct HttpAdapter {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: Option<String>,
    shape: WireShape,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
    breaker: Mutex<CircuitBreaker>,
    state: AdapterState,
}

impl HttpAdapter {
    pub(crate) fn new(cfg: &HttpConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint)
            .map_err(|err| anyhow::anyhow!("invalid httpEndpoint {:?}: {err}", cfg.endpoint))?;
        let shape = match cfg.format {
            HttpFormat::OpenAi => WireShape::Chat,
            HttpFormat::Llama => WireShape::Raw,
            HttpFormat::Auto => infer_shape(endpoint.path()),
        };
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            shape,
            timeout: cfg.timeout,
            max_retries: cfg.max_retries,
            retry_base: cfg.retry_base,
            breaker: Mutex::new(CircuitBreaker::new(
                cfg.circuit_failure_threshold,
                cfg.circuit_cooldown,
            )),
            state: AdapterState::new(true, "configured"),
        })
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn try_once(
        &self,
        prompt: &str,
        opts: GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, TryFailure> {
        let body = match self.shape {
            WireShape::Chat => {
                let mut body = json!({
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": opts.max_tokens,
                    "temperature": opts.temperature,
                });
                if let Some(model) = &self.model {
                    body["model"] = json!(model);
                }
                body
            }
            WireShape::Raw => json!({
                "prompt": prompt,
                "n_predict": opts.max_tokens,
                "temperature": opts.temperature,
            }),
        };

        let mut req = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = tokio::select! {
            res = req.send() => res,
            _ = cancel.cancelled() => return Err(TryFailure::Cancelled),
        };
        let res = match res {
            Ok(res) => res,
            // Transport timeout, connection reset, fetch failure: retryable.
            Err(err) => return Err(TryFailure::Retryable(anyhow::anyhow!("request failed: {err}"))),
        };

        let status = res.status();
        if !status.is_success() {
            let text = tokio::select! {
                text = res.text() => text.unwrap_or_default(),
                _ = cancel.cancelled() => return Err(TryFailure::Cancelled),
            };
            let err = anyhow::anyhow!("http {status}: {}", snippet(&text));
            if status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error()
            {
                return Err(TryFailure::Retryable(err));
            }
            return Err(TryFailure::Fatal(err));
        }

        let value: Value = tokio::select! {
            value = res.json() => match value {
                Ok(value) => value,
                Err(err) => {
                    return Err(TryFailure::Fatal(anyhow::anyhow!("invalid response body: {err}")));
                }
            },
            _ = cancel.cancelled() => return Err(TryFailure::Cancelled),
        };

        let text = match self.shape {
            WireShape::Chat => value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string),
            WireShape::Raw => find_content(&value).map(str::to_string),
        };
        // A well-formed response without content fails fast.
        let Some(text) = text else {
            return Err(TryFailure::Fatal(anyhow::anyhow!(
                "response lacks generated content"
            )));
        };

        let model = value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| "remote".to_string());
        let prompt_tokens = value
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .or_else(|| value.get("tokens_evaluated").and_then(Value::as_u64));
        let completion_tokens = value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .or_else(|| value.get("tokens_predicted").and_then(Value::as_u64));

        Ok(BackendReply {
            text,
            model,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[async_trait::async_trait]
impl BackendAdapter for HttpAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn ready(&self) -> bool {
        self.state.ready()
    }

    fn note(&self) -> String {
        self.state.note()
    }

    fn set_note(&self, note: String) {
        self.state.set_note(note);
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendFailure> {
        let tries = match self.breaker().admit(Instant::now()) {
            Admission::ShortCircuit { retry_in } => {
                let retry_in_ms = retry_in.as_millis() as u64;
                self.state
                    .set_note(format!("circuit open (next probe in {retry_in_ms} ms)"));
                return Err(BackendFailure::CircuitOpen { retry_in_ms });
            }
            Admission::Probe => 1,
            Admission::Allow => self.max_retries + 1,
        };

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..tries {
            if attempt > 0 {
                let delay = backoff_delay(self.retry_base, attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(BackendFailure::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(BackendFailure::Cancelled);
            }

            match self.try_once(prompt, opts, cancel).await {
                Ok(reply) => {
                    self.breaker().record_success();
                    self.state.set_note("healthy");
                    return Ok(reply);
                }
                Err(TryFailure::Cancelled) => return Err(BackendFailure::Cancelled),
                Err(TryFailure::Retryable(err)) => last_err = Some(err),
                Err(TryFailure::Fatal(err)) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        // One overall try exhausted its retries: that is what the breaker counts.
        let now = Instant::now();
        let mut breaker = self.breaker();
        breaker.record_failure(now);
        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("http backend failed"));
        if breaker.state() == CircuitState::Closed {
            self.state.set_note(format!("error: {err:#}"));
        } else {
            self.state.set_note(breaker.describe(now));
        }
        drop(breaker);
        Err(BackendFailure::Other(err))
    }
}

fn infer_shape(path: &str) -> WireShape {
    if path.contains("/chat/completions") || path.contains("/v1/completions") {
        WireShape::Chat
    } else if path.contains("/completion") || path.contains("/generate") {
        WireShape::Raw
    } else {
        WireShape::Chat
    }
}

fn backoff_delay(base: Duration, exhausted_attempts: u32) -> Duration {
    let ms = (base.as_millis() as u64)
        .saturating_mul(1u64 << exhausted_attempts.min(20))
        .min(MAX_BACKOFF.as_millis() as u64);
    Duration::from_millis(ms + fastrand::u64(0..=MAX_JITTER_MS))
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    body[..end].trim_end()
}

/// Depth-first search for the first known content field holding a string.
fn find_content(value: &Value) -> Option<&str> {
    for field in CONTENT_FIELDS {
        if let Some(text) = find_field(value, field) {
            return Some(text);
        }
    }
    None
}

fn find_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    match value {
        Value::Object(map) => {
            if let Some(text) = map.get(field).and_then(Value::as_str) {
                return Some(text);
            }
            map.values().find_map(|v| find_field(v, field))
        }
        Value::Array(items) => items.iter().find_map(|v| find_field(v, field)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_inferred_from_endpoint_path() {
        assert_eq!(infer_shape("/v1/chat/completions"), WireShape::Chat);
        assert_eq!(infer_shape("/v1/completions"), WireShape::Chat);
        assert_eq!(infer_shape("/completion"), WireShape::Raw);
        assert_eq!(infer_shape("/api/generate"), WireShape::Raw);
        assert_eq!(infer_shape("/anything/else"), WireShape::Chat);
    }

    #[test]
    fn content_search_is_recursive_and_ordered() {
        let value = json!({
            "result": { "nested": { "text": "inner" } },
            "meta": "x"
        });
        assert_eq!(find_content(&value), Some("inner"));

        // "content" outranks "text" regardless of nesting depth.
        let value = json!({
            "text": "shallow",
            "deep": { "content": "preferred" }
        });
        assert_eq!(find_content(&value), Some("preferred"));

        let value = json!({ "choices": [ { "output": "from-array" } ] });
        assert_eq!(find_content(&value), Some("from-array"));

        assert_eq!(find_content(&json!({ "status": "ok" })), None);
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let base = Duration::from_millis(250);
        let first = backoff_delay(base, 0);
        assert!(first >= Duration::from_millis(250));
        assert!(first <= Duration::from_millis(250 + MAX_JITTER_MS));

        let huge = backoff_delay(base, 12);
        assert!(huge <= MAX_BACKOFF + Duration::from_millis(MAX_JITTER_MS));
        assert!(huge >= MAX_BACKOFF);
    }
}

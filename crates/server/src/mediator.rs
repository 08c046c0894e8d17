//! The tool mediator: validates per-tool arguments, composes instructions
//! from fixed templates, and maps everything onto normalized pool
//! submissions. This is the only place untyped transport input lives.

use std::time::Instant;

use serde_json::{Value, json};

use ruvltra_engine::{GenerateRequest, GenerateResult, PoolHandle, TaskError, TaskType};

const DEFAULT_PERSPECTIVES: [&str; 4] = ["security", "performance", "quality", "maintainability"];
const MAX_PERSPECTIVES: usize = 8;

#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub(crate) text: String,
    pub(crate) structured: Value,
    pub(crate) is_error: bool,
}

/// Conditions surfaced as protocol-level errors; no task is admitted.
#[derive(Debug)]
pub(crate) enum ToolCallError {
    UnknownTool(String),
    InvalidParams(String),
}

impl std::fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolCallError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            ToolCallError::InvalidParams(msg) => f.write_str(msg),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ToolCallError {
    ToolCallError::InvalidParams(msg.into())
}

pub(crate) async fn call_tool(
    pool: &PoolHandle,
    name: &str,
    args: &Value,
) -> Result<ToolOutput, ToolCallError> {
    if !args.is_object() && !args.is_null() {
        return Err(invalid("arguments must be an object"));
    }

    match name {
        "ruvltra_code_generate" => {
            let mut req = GenerateRequest::new(TaskType::Generate, require_str(args, "instruction")?);
            req.context = optional_str(args, "context")?;
            req.language = optional_str(args, "language")?;
            req.file_path = optional_str(args, "filePath")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "output").await)
        }
        "ruvltra_code_review" => {
            let code = require_str(args, "code")?;
            let mut req = GenerateRequest::new(
                TaskType::Review,
                "Review the following code for correctness, security, performance, and style. \
                 Report concrete issues and suggest fixes.",
            );
            req.context = Some(code);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "review").await)
        }
        "ruvltra_code_refactor" => {
            let code = require_str(args, "code")?;
            let instruction = match optional_str(args, "instruction")? {
                Some(goal) => format!("Refactor the following code. Goal: {goal}"),
                None => "Refactor the following code for clarity and maintainability without \
                         changing behavior."
                    .to_string(),
            };
            let mut req = GenerateRequest::new(TaskType::Refactor, instruction);
            req.context = Some(code);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "refactored").await)
        }
        "ruvltra_code_explain" => {
            let code = require_str(args, "code")?;
            let audience =
                optional_str(args, "audience")?.unwrap_or_else(|| "developer".to_string());
            let mut req = GenerateRequest::new(
                TaskType::Explain,
                format!("Explain the following code for a {audience}. Describe what it does and why."),
            );
            req.context = Some(code);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "explanation").await)
        }
        "ruvltra_code_test" => {
            let code = require_str(args, "code")?;
            let instruction = match optional_str(args, "framework")? {
                Some(framework) => format!(
                    "Write thorough unit tests for the following code using {framework}. \
                     Cover edge cases."
                ),
                None => "Write thorough unit tests for the following code. Cover edge cases."
                    .to_string(),
            };
            let mut req = GenerateRequest::new(TaskType::Test, instruction);
            req.context = Some(code);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "tests").await)
        }
        "ruvltra_code_fix" => {
            let code = require_str(args, "code")?;
            let error = require_str(args, "error")?;
            let mut req = GenerateRequest::new(
                TaskType::Fix,
                format!("Fix the following code. It fails with:\n{error}\nReturn the corrected code."),
            );
            req.context = Some(code);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "fix").await)
        }
        "ruvltra_code_complete" => {
            let prefix = require_str(args, "prefix")?;
            let mut req = GenerateRequest::new(
                TaskType::Complete,
                "Continue the following code from where it ends. Return only the continuation.",
            );
            req.context = Some(prefix);
            req.language = optional_str(args, "language")?;
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "completion").await)
        }
        "ruvltra_code_translate" => {
            let code = require_str(args, "code")?;
            let target = require_str(args, "targetLanguage")?;
            let mut req = GenerateRequest::new(
                TaskType::Translate,
                format!("Translate the following code to {target}. Preserve behavior and comments."),
            );
            req.context = Some(code);
            req.language = Some(target);
            apply_overrides(&mut req, args)?;
            Ok(run_single(pool, req, "translated").await)
        }
        "ruvltra_parallel_generate" => parallel_generate(pool, args).await,
        "ruvltra_swarm_review" => swarm_review(pool, args).await,
        "ruvltra_status" => match pool.status().await {
            Ok(status) => Ok(ToolOutput {
                text: format!(
                    "{} workers, {} queued, {} in flight",
                    status.workers, status.queue_len, status.in_flight
                ),
                structured: json!({ "status": status }),
                is_error: false,
            }),
            Err(err) => Ok(failure_output(&err)),
        },
        "ruvltra_sona_stats" => {
            let worker_id = optional_str(args, "workerId")?;
            match pool.sona_stats(worker_id).await {
                Ok(stats) => Ok(ToolOutput {
                    text: format!("{} worker memories", stats.len()),
                    structured: json!({ "sona": stats }),
                    is_error: false,
                }),
                Err(err) => Ok(failure_output(&err)),
            }
        }
        "ruvltra_scale_workers" => {
            let target = args
                .get("target")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid("'target' must be a non-negative integer"))?;
            match pool.scale(target as usize).await {
                Ok(status) => Ok(ToolOutput {
                    text: format!("pool scaled to {} workers", status.workers),
                    structured: json!({ "status": status }),
                    is_error: false,
                }),
                Err(err) => Ok(failure_output(&err)),
            }
        }
        other => Err(ToolCallError::UnknownTool(other.to_string())),
    }
}

/// One item of the `ruvltra_parallel_generate` fan-out. Each item is an
/// independent task: one failing never cancels its siblings.
async fn parallel_generate(pool: &PoolHandle, args: &Value) -> Result<ToolOutput, ToolCallError> {
    let items = args
        .get("tasks")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("'tasks' must be an array"))?;
    if items.is_empty() {
        return Err(invalid("'tasks' must not be empty"));
    }

    let mut requests = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        if !item.is_object() {
            return Err(invalid(format!("tasks[{idx}] must be an object")));
        }
        let instruction = require_str(item, "instruction")
            .map_err(|err| invalid(format!("tasks[{idx}]: {err}")))?;
        let mut req = GenerateRequest::new(TaskType::Generate, instruction);
        req.context = optional_str(item, "context")?;
        req.language = optional_str(item, "language")?;
        req.file_path = optional_str(item, "filePath")?;
        apply_overrides(&mut req, args)?;
        requests.push((req.file_path.clone(), req));
    }

    let started = Instant::now();
    let handles: Vec<_> = requests
        .into_iter()
        .map(|(file_path, req)| {
            let pool = pool.clone();
            (file_path, tokio::spawn(async move { pool.submit(req).await }))
        })
        .collect();

    let total = handles.len();
    let mut results = Vec::with_capacity(total);
    let mut succeeded = 0usize;
    for (idx, (file_path, handle)) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap_or(Err(TaskError::Cancelled));
        results.push(item_payload(idx, file_path, outcome, &mut succeeded));
    }
    let total_latency_ms = started.elapsed().as_millis() as u64;

    Ok(ToolOutput {
        text: format!("{succeeded}/{total} tasks succeeded in {total_latency_ms} ms"),
        structured: json!({
            "totalTasks": total,
            "totalLatencyMs": total_latency_ms,
            "results": results,
        }),
        is_error: succeeded == 0,
    })
}

async fn swarm_review(pool: &PoolHandle, args: &Value) -> Result<ToolOutput, ToolCallError> {
    let code = require_str(args, "code")?;
    let language = optional_str(args, "language")?;

    let mut perspectives: Vec<String> = match args.get("perspectives") {
        None | Some(Value::Null) => DEFAULT_PERSPECTIVES.iter().map(|s| s.to_string()).collect(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
                    _ => {
                        return Err(invalid(format!(
                            "perspectives[{idx}] must be a non-empty string"
                        )));
                    }
                }
            }
            if out.is_empty() {
                DEFAULT_PERSPECTIVES.iter().map(|s| s.to_string()).collect()
            } else {
                out
            }
        }
        Some(_) => return Err(invalid("'perspectives' must be an array of strings")),
    };
    perspectives.truncate(MAX_PERSPECTIVES);

    let started = Instant::now();
    let mut handles = Vec::with_capacity(perspectives.len());
    for perspective in &perspectives {
        let mut req = GenerateRequest::new(
            TaskType::Review,
            format!(
                "Review the following code strictly from the {perspective} perspective. \
                 Report findings ranked by severity."
            ),
        );
        req.context = Some(code.clone());
        req.language = language.clone();
        apply_overrides(&mut req, args)?;

        let pool = pool.clone();
        handles.push((
            perspective.clone(),
            tokio::spawn(async move { pool.submit(req).await }),
        ));
    }

    let mut reviews = Vec::with_capacity(handles.len());
    let mut succeeded = 0usize;
    for (perspective, handle) in handles {
        let outcome = handle.await.unwrap_or(Err(TaskError::Cancelled));
        reviews.push(match outcome {
            Ok(res) => {
                succeeded += 1;
                json!({
                    "perspective": perspective,
                    "review": res.text,
                    "workerId": res.worker_id,
                    "backend": res.backend,
                    "model": res.model,
                    "latencyMs": res.latency_ms,
                    "success": true,
                })
            }
            Err(err) => json!({
                "perspective": perspective,
                "error": err.to_string(),
                "success": false,
            }),
        });
    }
    let total_latency_ms = started.elapsed().as_millis() as u64;

    Ok(ToolOutput {
        text: format!(
            "{succeeded}/{} perspectives reviewed in {total_latency_ms} ms",
            reviews.len()
        ),
        structured: json!({
            "perspectives": perspectives,
            "totalLatencyMs": total_latency_ms,
            "reviews": reviews,
        }),
        is_error: succeeded == 0,
    })
}

async fn run_single(pool: &PoolHandle, request: GenerateRequest, shape_key: &str) -> ToolOutput {
    match pool.submit(request).await {
        Ok(res) => ToolOutput {
            text: res.text.clone(),
            structured: single_payload(shape_key, &res),
            is_error: false,
        },
        Err(err) => failure_output(&err),
    }
}

fn single_payload(shape_key: &str, res: &GenerateResult) -> Value {
    let mut payload = json!({
        "workerId": res.worker_id,
        "backend": res.backend,
        "model": res.model,
        "latencyMs": res.latency_ms,
        "taskId": res.task_id,
    });
    payload[shape_key] = json!(res.text);
    payload
}

fn item_payload(
    index: usize,
    file_path: Option<String>,
    outcome: Result<GenerateResult, TaskError>,
    succeeded: &mut usize,
) -> Value {
    match outcome {
        Ok(res) => {
            *succeeded += 1;
            json!({
                "index": index,
                "filePath": file_path,
                "output": res.text,
                "workerId": res.worker_id,
                "backend": res.backend,
                "model": res.model,
                "latencyMs": res.latency_ms,
                "taskId": res.task_id,
                "success": true,
            })
        }
        Err(err) => json!({
            "index": index,
            "filePath": file_path,
            "error": err.to_string(),
            "success": false,
        }),
    }
}

fn failure_output(err: &TaskError) -> ToolOutput {
    ToolOutput {
        text: err.to_string(),
        structured: json!({ "error": err.to_string() }),
        is_error: true,
    }
}

fn require_str(args: &Value, field: &str) -> Result<String, ToolCallError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(invalid(format!("'{field}' must be a non-empty string"))),
        Some(_) => Err(invalid(format!("'{field}' must be a string"))),
        None => Err(invalid(format!("missing required field '{field}'"))),
    }
}

fn optional_str(args: &Value, field: &str) -> Result<Option<String>, ToolCallError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok(if s.is_empty() { None } else { Some(s.to_string()) })
        }
        Some(_) => Err(invalid(format!("'{field}' must be a string"))),
    }
}

fn apply_overrides(req: &mut GenerateRequest, args: &Value) -> Result<(), ToolCallError> {
    if let Some(v) = args.get("maxTokens") {
        let n = v
            .as_u64()
            .filter(|n| (1..=65_536).contains(n))
            .ok_or_else(|| invalid("'maxTokens' must be an integer between 1 and 65536"))?;
        req.max_tokens = Some(n as u32);
    }
    if let Some(v) = args.get("temperature") {
        let t = v
            .as_f64()
            .filter(|t| (0.0..=2.0).contains(t))
            .ok_or_else(|| invalid("'temperature' must be a number between 0 and 2"))?;
        req.temperature = Some(t as f32);
    }
    if let Some(v) = args.get("timeoutMs") {
        let t = v
            .as_u64()
            .filter(|t| *t >= 1)
            .ok_or_else(|| invalid("'timeoutMs' must be a positive integer"))?;
        req.timeout_ms = Some(t);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ruvltra_engine::{PoolConfig, SonaConfig, start_pool};

    fn mock_pool() -> PoolHandle {
        start_pool(PoolConfig {
            min_workers: 1,
            max_workers: 2,
            initial_workers: 1,
            queue_max_length: 32,
            task_timeout: Duration::from_secs(5),
            sona: SonaConfig {
                enabled: false,
                state_dir: None,
                persist_interval: 10,
            },
            http: None,
            native: None,
            embedded: None,
            max_tokens: 64,
            temperature: 0.2,
            mock_latency: Duration::from_millis(5),
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_requires_instruction() {
        let pool = mock_pool();
        let err = call_tool(&pool, "ruvltra_code_generate", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidParams(_)));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fix_requires_both_code_and_error() {
        let pool = mock_pool();
        let err = call_tool(&pool, "ruvltra_code_fix", &json!({ "code": "x" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error"));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_tool_is_rejected() {
        let pool = mock_pool();
        let err = call_tool(&pool, "ruvltra_everything", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolCallError::UnknownTool(_)));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_override_type_is_invalid_params() {
        let pool = mock_pool();
        let err = call_tool(
            &pool,
            "ruvltra_code_generate",
            &json!({ "instruction": "x", "maxTokens": "many" }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("maxTokens"));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_returns_provenance_envelope() {
        let pool = mock_pool();
        let out = call_tool(
            &pool,
            "ruvltra_code_generate",
            &json!({ "instruction": "write a hello function" }),
        )
        .await
        .unwrap();
        assert!(!out.is_error);
        assert!(!out.text.is_empty());
        assert_eq!(out.structured["backend"], "mock");
        assert_eq!(out.structured["workerId"], "worker-1");
        assert!(out.structured["taskId"].is_u64());
        assert!(out.structured["output"].is_string());
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn swarm_review_defaults_to_four_perspectives() {
        let pool = mock_pool();
        let out = call_tool(&pool, "ruvltra_swarm_review", &json!({ "code": "fn x() {}" }))
            .await
            .unwrap();
        assert!(!out.is_error);
        let reviews = out.structured["reviews"].as_array().unwrap();
        assert_eq!(reviews.len(), 4);
        assert!(reviews.iter().all(|r| r["success"] == true));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_generate_preserves_submission_order() {
        let pool = mock_pool();
        let out = call_tool(
            &pool,
            "ruvltra_parallel_generate",
            &json!({ "tasks": [
                { "instruction": "first task", "filePath": "a.rs" },
                { "instruction": "second task", "filePath": "b.rs" },
                { "instruction": "third task", "filePath": "c.rs" },
            ] }),
        )
        .await
        .unwrap();
        assert!(!out.is_error);
        let results = out.structured["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["filePath"], "a.rs");
        assert_eq!(results[2]["filePath"], "c.rs");
        assert!(results.iter().all(|r| r["success"] == true));
        pool.shutdown().await;
    }
}

//! Local native model adapter. The model file is validated once per
//! worker; each call runs an isolated runner process so parallel workers
//! never share mutable decoder state. Cancellation kills the child.

use std::path::PathBuf;
use std::process::Stdio;

use tokio_util::sync::CancellationToken;

use super::{AdapterState, BackendAdapter, BackendFailure, BackendReply, GenerateOptions};
use crate::api::{BackendKind, NativeConfig};

const DEFAULT_RUNNER: &str = "llama-cli";

pub(crate) struct NativeAdapter {
    runner: PathBuf,
    model_path: PathBuf,
    context_length: u32,
    gpu_layers: i32,
    threads: u32,
    model_name: String,
    state: AdapterState,
}

impl NativeAdapter {
    pub(crate) fn new(cfg: &NativeConfig) -> Self {
        let runner = cfg
            .runner_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNNER));
        let model_name = cfg
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "native".to_string());

        let state = if cfg.model_path.is_file() {
            AdapterState::new(true, format!("model {}", cfg.model_path.display()))
        } else {
            AdapterState::new(
                false,
                format!("model file not found: {}", cfg.model_path.display()),
            )
        };

        Self {
            runner,
            model_path: cfg.model_path.clone(),
            context_length: cfg.context_length,
            gpu_layers: cfg.gpu_layers,
            threads: cfg.threads,
            model_name,
            state,
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for NativeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
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
        if cancel.is_cancelled() {
            return Err(BackendFailure::Cancelled);
        }

        let mut cmd = tokio::process::Command::new(&self.runner);
        cmd.arg("--model")
            .arg(&self.model_path)
            .arg("--ctx-size")
            .arg(self.context_length.to_string())
            .arg("--n-predict")
            .arg(opts.max_tokens.to_string())
            .arg("--temp")
            .arg(opts.temperature.to_string())
            .arg("--no-display-prompt")
            .arg("--prompt")
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if self.gpu_layers >= 0 {
            cmd.arg("--n-gpu-layers").arg(self.gpu_layers.to_string());
        }
        if self.threads > 0 {
            cmd.arg("--threads").arg(self.threads.to_string());
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let note = format!(
                    "runner '{}' not found; install a llama.cpp CLI build for {}-{}",
                    self.runner.display(),
                    std::env::consts::OS,
                    std::env::consts::ARCH
                );
                self.state.demote(note.clone());
                return Err(BackendFailure::Degraded { note });
            }
            Err(err) => {
                return Err(BackendFailure::Other(anyhow::anyhow!(
                    "failed to spawn runner: {err}"
                )));
            }
        };

        // kill_on_drop reaps the child when the cancel branch wins.
        let output = tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => output,
                Err(err) => {
                    return Err(BackendFailure::Other(anyhow::anyhow!("runner wait failed: {err}")));
                }
            },
            _ = cancel.cancelled() => return Err(BackendFailure::Cancelled),
        };

        if !output.status.success() {
            return Err(BackendFailure::Other(anyhow::anyhow!(
                "runner exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(BackendFailure::Other(anyhow::anyhow!(
                "runner produced no output"
            )));
        }

        Ok(BackendReply {
            text,
            model: self.model_name.clone(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_starts_unready() {
        let adapter = NativeAdapter::new(&NativeConfig {
            model_path: PathBuf::from("/nonexistent/model.gguf"),
            runner_path: None,
            context_length: 4096,
            gpu_layers: -1,
            threads: 0,
        });
        assert!(!adapter.ready());
        assert!(adapter.note().contains("not found"));
    }

    #[tokio::test]
    async fn missing_runner_demotes_with_host_note() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"stub").unwrap();

        let adapter = NativeAdapter::new(&NativeConfig {
            model_path: model,
            runner_path: Some(PathBuf::from("/nonexistent/llama-cli")),
            context_length: 4096,
            gpu_layers: -1,
            threads: 0,
        });
        assert!(adapter.ready());

        let res = adapter
            .generate(
                "Task: generate\n\nInstruction:\nhello\n",
                GenerateOptions {
                    max_tokens: 8,
                    temperature: 0.0,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(res, Err(BackendFailure::Degraded { .. })));
        assert!(!adapter.ready());
        assert!(adapter.note().contains(std::env::consts::OS));
    }
}

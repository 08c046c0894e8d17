//! Embedded learning-runtime adapter. The runtime itself is injected by
//! the host process; this adapter initializes it once, detects the
//! degraded (non-native) fallback build and demotes itself on first
//! evidence, and records prompt/response trajectories when enabled.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{AdapterState, BackendAdapter, BackendFailure, BackendReply, GenerateOptions};
use crate::api::{BackendKind, EmbeddedRuntime};

/// Confidence attached to recorded prompt/response trajectories.
const TRAJECTORY_CONFIDENCE: f32 = 0.9;

/// Output substrings that identify the fallback build at generation time.
const FALLBACK_MARKERS: [&str; 2] = ["[wasm-fallback]", "fallback mode"];

pub(crate) struct EmbeddedAdapter {
    runtime: Arc<dyn EmbeddedRuntime>,
    record_trajectories: bool,
    state: AdapterState,
}

impl EmbeddedAdapter {
    pub(crate) async fn new(runtime: Arc<dyn EmbeddedRuntime>, record_trajectories: bool) -> Self {
        let adapter = Self {
            runtime,
            record_trajectories,
            state: AdapterState::new(true, "initializing"),
        };

        match model_dir() {
            Ok(dir) => match adapter.runtime.initialize(&dir).await {
                Ok(()) => {
                    if let Some(note) = degraded_runtime_note(adapter.runtime.as_ref()) {
                        adapter.state.demote(note);
                    } else {
                        adapter
                            .state
                            .set_note(format!("runtime {}", adapter.runtime.version()));
                    }
                }
                Err(err) => adapter.state.demote(format!("initialization failed: {err:#}")),
            },
            Err(err) => adapter.state.demote(format!("no model directory: {err:#}")),
        }

        adapter
    }
}

#[async_trait::async_trait]
impl BackendAdapter for EmbeddedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
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

        let res = tokio::select! {
            res = self.runtime.generate(prompt, opts.max_tokens, opts.temperature) => res,
            _ = cancel.cancelled() => return Err(BackendFailure::Cancelled),
        };

        match res {
            Ok(text) => {
                if has_fallback_marker(&text) {
                    let note = degraded_note(&self.runtime.version());
                    self.state.demote(note.clone());
                    return Err(BackendFailure::Degraded { note });
                }
                if self.record_trajectories {
                    self.runtime
                        .record_trajectory(prompt, &text, TRAJECTORY_CONFIDENCE);
                }
                Ok(BackendReply {
                    text,
                    model: self.runtime.version(),
                    prompt_tokens: None,
                    completion_tokens: None,
                })
            }
            Err(err) => Err(BackendFailure::Other(err)),
        }
    }
}

fn degraded_runtime_note(runtime: &dyn EmbeddedRuntime) -> Option<String> {
    let version = runtime.version();
    if !runtime.is_native_loaded() || version.ends_with("-js") {
        return Some(degraded_note(&version));
    }
    None
}

fn degraded_note(version: &str) -> String {
    format!(
        "runtime {version} is the fallback build; expected the native module for {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn has_fallback_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    FALLBACK_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Fixed weights location outside any package cache, so a reinstall does
/// not re-trigger the one-time model download.
fn model_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_DATA_HOME is set but empty");
        }
        return Ok(dir.join("ruvltra").join("models"));
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home
        .join(".local")
        .join("share")
        .join("ruvltra")
        .join("models"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    struct StubRuntime {
        native: bool,
        version: &'static str,
        output: &'static str,
        trajectories: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl EmbeddedRuntime for StubRuntime {
        async fn initialize(&self, _model_dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        async fn generate(
            &self,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<String> {
            Ok(self.output.to_string())
        }

        fn is_native_loaded(&self) -> bool {
            self.native
        }

        fn version(&self) -> String {
            self.version.to_string()
        }

        fn record_trajectory(&self, prompt: &str, response: &str, _confidence: f32) {
            self.trajectories
                .lock()
                .unwrap()
                .push((prompt.to_string(), response.to_string()));
        }
    }

    fn stub(native: bool, version: &'static str, output: &'static str) -> Arc<StubRuntime> {
        Arc::new(StubRuntime {
            native,
            version,
            output,
            trajectories: Mutex::new(Vec::new()),
        })
    }

    const OPTS: GenerateOptions = GenerateOptions {
        max_tokens: 16,
        temperature: 0.0,
    };

    #[tokio::test]
    async fn healthy_runtime_generates_and_records() {
        let runtime = stub(true, "0.9.2", "fn main() {}");
        let adapter = EmbeddedAdapter::new(runtime.clone(), true).await;
        assert!(adapter.ready());

        let reply = adapter
            .generate("prompt", OPTS, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text, "fn main() {}");
        assert_eq!(runtime.trajectories.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn js_version_suffix_demotes_at_init() {
        let adapter = EmbeddedAdapter::new(stub(true, "0.9.2-js", "x"), false).await;
        assert!(!adapter.ready());
        assert!(adapter.note().contains("fallback build"));
        assert!(adapter.note().contains(std::env::consts::OS));
    }

    #[tokio::test]
    async fn fallback_marker_in_output_demotes_and_fails_the_call() {
        let runtime = stub(true, "0.9.2", "[WASM-fallback] best effort answer");
        let adapter = EmbeddedAdapter::new(runtime.clone(), true).await;
        assert!(adapter.ready());

        let res = adapter
            .generate("prompt", OPTS, &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(BackendFailure::Degraded { .. })));
        assert!(!adapter.ready());
        // Degraded output is never recorded as a trajectory.
        assert!(runtime.trajectories.lock().unwrap().is_empty());
    }
}

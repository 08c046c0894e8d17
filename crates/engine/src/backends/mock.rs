//! Deterministic last-resort adapter. Always ready, so the engine can
//! never reject a request for "no backend".

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{AdapterState, BackendAdapter, BackendFailure, BackendReply, GenerateOptions};
use crate::api::BackendKind;

const MOCK_JITTER_MS: u64 = 30;

pub(crate) struct MockAdapter {
    latency: Duration,
    state: AdapterState,
}

impl MockAdapter {
    pub(crate) fn new(latency: Duration) -> Self {
        Self {
            latency,
            state: AdapterState::new(true, "ready"),
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for MockAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
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
        _opts: GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<BackendReply, BackendFailure> {
        let jitter = Duration::from_millis(fastrand::u64(0..=MOCK_JITTER_MS));
        tokio::select! {
            _ = tokio::time::sleep(self.latency + jitter) => {}
            _ = cancel.cancelled() => return Err(BackendFailure::Cancelled),
        }

        Ok(BackendReply {
            text: format!("[mock] {}", instruction_excerpt(prompt)),
            model: "mock".to_string(),
            prompt_tokens: None,
            completion_tokens: None,
        })
    }
}

/// First line of the prompt's instruction block, capped for readability.
fn instruction_excerpt(prompt: &str) -> &str {
    let body = prompt
        .split_once("Instruction:\n")
        .map(|(_, rest)| rest)
        .unwrap_or(prompt);
    let line = body.lines().next().unwrap_or(body);
    let end = line
        .char_indices()
        .nth(120)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len());
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_marked_output_derived_from_prompt() {
        let adapter = MockAdapter::new(Duration::from_millis(1));
        let reply = adapter
            .generate(
                "Task: generate\n\nInstruction:\nsay hello\n",
                GenerateOptions {
                    max_tokens: 16,
                    temperature: 0.0,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "[mock] say hello");
        assert_eq!(reply.model, "mock");
    }

    #[tokio::test]
    async fn honours_cancellation_promptly() {
        let adapter = MockAdapter::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = adapter
            .generate(
                "x",
                GenerateOptions {
                    max_tokens: 16,
                    temperature: 0.0,
                },
                &cancel,
            )
            .await;
        assert!(matches!(res, Err(BackendFailure::Cancelled)));
    }
}

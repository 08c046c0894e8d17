use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::PoolConfig;
use crate::backends::GenerateOptions;
use crate::inference::{EngineError, EngineReply, EngineStatusCell, InferenceEngine};

pub(crate) enum WorkerCommand {
    Generate {
        task_id: u64,
        prompt: String,
        opts: GenerateOptions,
        cancel: CancellationToken,
    },
    Stop,
}

pub(crate) struct WorkerEvent {
    pub(crate) worker_seq: usize,
    pub(crate) task_id: u64,
    pub(crate) result: Result<EngineReply, EngineError>,
}

/// One worker: owns its inference engine and executes one generation at a
/// time. Dropping out of the loop releases the engine and its adapters.
pub(crate) async fn run_worker_task(
    worker_seq: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    cfg: Arc<PoolConfig>,
    status: Arc<EngineStatusCell>,
) {
    let engine = InferenceEngine::new(&cfg, status).await;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Generate {
                task_id,
                prompt,
                opts,
                cancel,
            } => {
                let result = engine.generate(&prompt, opts, &cancel).await;
                if event_tx
                    .send(WorkerEvent {
                        worker_seq,
                        task_id,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

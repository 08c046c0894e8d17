//! The worker pool control loop: bounded-queue admission, LRU-idle
//! dispatch, per-task deadlines and cancellation, idle auto-scaling, and
//! settle-once bookkeeping.
//!
//! Everything mutable lives on this single control task; workers only see
//! commands and report settlement events back over channels.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{
    GenerateRequest, GenerateResult, MemoryStats, PoolConfig, PoolCounters, PoolHandle,
    PoolStatus, TaskError, WorkerStats,
};
use crate::backends::GenerateOptions;
use crate::inference::{EngineError, EngineStatusCell};
use crate::prompt::{self, PromptInput};
use crate::sona::{InteractionOutcome, PatternMemory};
use crate::worker::{WorkerCommand, WorkerEvent, run_worker_task};

pub(crate) enum PoolCommand {
    Submit {
        request: GenerateRequest,
        respond: oneshot::Sender<Result<GenerateResult, TaskError>>,
    },
    Status {
        respond: oneshot::Sender<PoolStatus>,
    },
    SonaStats {
        worker_id: Option<String>,
        respond: oneshot::Sender<Vec<MemoryStats>>,
    },
    Scale {
        target: usize,
        respond: oneshot::Sender<PoolStatus>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

struct TaskEntry {
    request: GenerateRequest,
    respond: oneshot::Sender<Result<GenerateResult, TaskError>>,
    cancel: CancellationToken,
    timeout_ms: u64,
    started_at: Option<Instant>,
}

struct WorkerSlot {
    seq: usize,
    id: String,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    memory: PatternMemory,
    status: Arc<EngineStatusCell>,
    active_task: Option<u64>,
    completed: u64,
    failed: u64,
    last_used_at: Instant,
}

struct PoolRuntime {
    cfg: Arc<PoolConfig>,
    cmd_rx: mpsc::Receiver<PoolCommand>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    worker_join: JoinSet<()>,
    workers: Vec<WorkerSlot>,
    /// Admitted task ids in FIFO order. Ids whose task already settled
    /// (e.g. timed out while queued) are purged eagerly.
    queue: VecDeque<u64>,
    /// All unsettled tasks. Removal from this map IS the settle-once latch:
    /// anything arriving for an absent id is discarded.
    tasks: HashMap<u64, TaskEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_task_id: u64,
    next_worker_seq: usize,
    counters: PoolCounters,
}

pub(crate) fn start_pool(cfg: PoolConfig) -> PoolHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(run_pool(cfg, cmd_rx));
    PoolHandle { cmd_tx }
}

async fn run_pool(mut cfg: PoolConfig, cmd_rx: mpsc::Receiver<PoolCommand>) {
    cfg.min_workers = cfg.min_workers.max(1);
    cfg.max_workers = cfg.max_workers.max(cfg.min_workers);
    cfg.initial_workers = cfg.initial_workers.clamp(cfg.min_workers, cfg.max_workers);
    cfg.queue_max_length = cfg.queue_max_length.max(1);
    if cfg.task_timeout == Duration::ZERO {
        cfg.task_timeout = Duration::from_millis(60_000);
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut rt = PoolRuntime {
        cfg: Arc::new(cfg),
        cmd_rx,
        event_tx,
        event_rx,
        worker_join: JoinSet::new(),
        workers: Vec::new(),
        queue: VecDeque::new(),
        tasks: HashMap::new(),
        deadlines: BinaryHeap::new(),
        next_task_id: 0,
        next_worker_seq: 0,
        counters: PoolCounters::default(),
    };

    for _ in 0..rt.cfg.initial_workers {
        rt.spawn_worker();
    }
    tracing::info!(workers = rt.workers.len(), "pool started");
    rt.run().await;
}

impl PoolRuntime {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(PoolConfig::HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let stop = match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        // Every handle dropped: drain and stop.
                        None => {
                            self.shutdown().await;
                            true
                        }
                    };
                    if stop {
                        return;
                    }
                }
                ev = self.event_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_worker_event(ev).await;
                    }
                }
                _ = heartbeat.tick() => self.scale_down_idle().await,
                _ = deadline_sleep(next_deadline) => {
                    self.fire_deadlines();
                    self.dispatch().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: PoolCommand) -> bool {
        match cmd {
            PoolCommand::Submit { request, respond } => {
                self.admit(request, respond).await;
                false
            }
            PoolCommand::Status { respond } => {
                let _ = respond.send(self.build_status());
                false
            }
            PoolCommand::SonaStats { worker_id, respond } => {
                let stats = self
                    .workers
                    .iter()
                    .filter(|w| worker_id.as_deref().is_none_or(|id| id == w.id))
                    .map(|w| w.memory.stats())
                    .collect();
                let _ = respond.send(stats);
                false
            }
            PoolCommand::Scale { target, respond } => {
                self.scale_to(target).await;
                let _ = respond.send(self.build_status());
                false
            }
            PoolCommand::Shutdown { respond } => {
                self.shutdown().await;
                let _ = respond.send(());
                true
            }
        }
    }

    async fn admit(
        &mut self,
        request: GenerateRequest,
        respond: oneshot::Sender<Result<GenerateResult, TaskError>>,
    ) {
        // The queue boundary is the only backpressure point; in-flight tasks
        // do not count against it.
        if self.queue.len() >= self.cfg.queue_max_length {
            self.counters.rejected += 1;
            let retry_after_ms = (self.cfg.task_timeout.as_millis() as u64 / 4).max(1);
            let _ = respond.send(Err(TaskError::QueueOverflow {
                queue_len: self.queue.len(),
                retry_after_ms,
            }));
            return;
        }

        self.next_task_id += 1;
        let task_id = self.next_task_id;
        self.counters.submitted += 1;

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.cfg.task_timeout.as_millis() as u64)
            .max(1);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        self.tasks.insert(
            task_id,
            TaskEntry {
                request,
                respond,
                cancel: CancellationToken::new(),
                timeout_ms,
                started_at: None,
            },
        );
        self.queue.push_back(task_id);
        self.deadlines.push(Reverse((deadline, task_id)));

        if self.queue.len() > self.workers.len() && self.workers.len() < self.cfg.max_workers {
            self.spawn_worker();
        }
        self.dispatch().await;
    }

    /// Hand queued tasks to idle workers, least-recently-used worker first,
    /// until either runs out.
    async fn dispatch(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let Some(widx) = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.active_task.is_none())
                .min_by_key(|(_, w)| w.last_used_at)
                .map(|(idx, _)| idx)
            else {
                return;
            };

            let Some(task_id) = self.queue.pop_front() else {
                return;
            };
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                // Settled while queued (timeout); skip.
                continue;
            };

            let slot = &mut self.workers[widx];
            let request = &entry.request;
            let rewritten = slot.memory.rewrite(
                request.task_type,
                request.language.as_deref(),
                &request.instruction,
            );
            let prompt_text = prompt::render(&PromptInput {
                task_type: request.task_type,
                language: request.language.as_deref(),
                file_path: request.file_path.as_deref(),
                instruction: &rewritten,
                context: request.context.as_deref(),
            });
            let opts = GenerateOptions {
                max_tokens: request.max_tokens.unwrap_or(self.cfg.max_tokens),
                temperature: request.temperature.unwrap_or(self.cfg.temperature),
            };

            entry.started_at = Some(Instant::now());
            let cancel = entry.cancel.clone();
            slot.active_task = Some(task_id);
            slot.last_used_at = Instant::now();

            // The worker is idle and its channel holds one command, so this
            // never blocks the control loop.
            let sent = slot
                .cmd_tx
                .send(WorkerCommand::Generate {
                    task_id,
                    prompt: prompt_text,
                    opts,
                    cancel,
                })
                .await;
            if sent.is_err() {
                slot.active_task = None;
                if let Some(entry) = self.tasks.remove(&task_id) {
                    self.counters.failed += 1;
                    let _ = entry.respond.send(Err(TaskError::Backend {
                        message: "worker unavailable".to_string(),
                    }));
                }
            }
        }
    }

    async fn handle_worker_event(&mut self, ev: WorkerEvent) {
        let Some(widx) = self.workers.iter().position(|w| w.seq == ev.worker_seq) else {
            return;
        };
        {
            let slot = &mut self.workers[widx];
            if slot.active_task == Some(ev.task_id) {
                slot.active_task = None;
                slot.last_used_at = Instant::now();
            }
        }

        // The settle latch: a result for an already-settled task (a backend
        // answer that raced a timeout or shutdown) is discarded untouched.
        if let Some(entry) = self.tasks.remove(&ev.task_id) {
            match ev.result {
                Ok(reply) => {
                    self.counters.completed += 1;
                    {
                        let slot = &mut self.workers[widx];
                        slot.completed += 1;
                        let outcome = InteractionOutcome {
                            task_type: entry.request.task_type,
                            language: entry.request.language.as_deref(),
                            file_path: entry.request.file_path.as_deref(),
                            instruction: &entry.request.instruction,
                            response: Some(&reply.text),
                            success: true,
                            latency_ms: reply.latency_ms,
                            prompt_tokens: reply.prompt_tokens,
                            completion_tokens: reply.completion_tokens,
                        };
                        if slot.memory.record(&outcome) {
                            slot.memory.persist().await;
                        }
                    }
                    let worker_id = self.workers[widx].id.clone();
                    let _ = entry.respond.send(Ok(GenerateResult {
                        text: reply.text,
                        task_id: ev.task_id,
                        worker_id,
                        backend: reply.backend,
                        model: reply.model,
                        latency_ms: reply.latency_ms,
                    }));
                }
                Err(EngineError::Cancelled) => {
                    self.counters.cancelled += 1;
                    let _ = entry.respond.send(Err(TaskError::Cancelled));
                }
                Err(EngineError::AllFailed { message }) => {
                    self.counters.failed += 1;
                    let slot = &mut self.workers[widx];
                    slot.failed += 1;
                    let latency_ms = entry
                        .started_at
                        .map(|t| t.elapsed().as_millis() as u64)
                        .unwrap_or(0);
                    let outcome = InteractionOutcome {
                        task_type: entry.request.task_type,
                        language: entry.request.language.as_deref(),
                        file_path: entry.request.file_path.as_deref(),
                        instruction: &entry.request.instruction,
                        response: None,
                        success: false,
                        latency_ms,
                        prompt_tokens: None,
                        completion_tokens: None,
                    };
                    if slot.memory.record(&outcome) {
                        slot.memory.persist().await;
                    }
                    let _ = entry.respond.send(Err(TaskError::Backend { message }));
                }
            }
        }

        self.dispatch().await;
        self.scale_down_idle().await;
    }

    fn fire_deadlines(&mut self) {
        let now = Instant::now();
        let mut fired = false;
        while let Some(Reverse((at, task_id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(entry) = self.tasks.remove(&task_id) else {
                continue;
            };
            entry.cancel.cancel();
            self.counters.timed_out += 1;
            self.counters.cancelled += 1;
            let _ = entry.respond.send(Err(TaskError::Timeout {
                timeout_ms: entry.timeout_ms,
            }));
            tracing::debug!(task_id, timeout_ms = entry.timeout_ms, "task timed out");
            fired = true;
        }
        if fired {
            let tasks = &self.tasks;
            self.queue.retain(|id| tasks.contains_key(id));
        }
    }

    fn spawn_worker(&mut self) {
        self.next_worker_seq += 1;
        let seq = self.next_worker_seq;
        let id = format!("worker-{seq}");

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let status = Arc::new(EngineStatusCell::default());
        let memory = PatternMemory::load(&id, &self.cfg.sona);

        let cfg = self.cfg.clone();
        let event_tx = self.event_tx.clone();
        let task_status = status.clone();
        self.worker_join.spawn(async move {
            run_worker_task(seq, cmd_rx, event_tx, cfg, task_status).await;
        });

        self.workers.push(WorkerSlot {
            seq,
            id,
            cmd_tx,
            memory,
            status,
            active_task: None,
            completed: 0,
            failed: 0,
            last_used_at: Instant::now(),
        });
        tracing::debug!(workers = self.workers.len(), "scaled up");
    }

    async fn remove_worker(&mut self, widx: usize) {
        let mut slot = self.workers.remove(widx);
        slot.memory.flush().await;
        let _ = slot.cmd_tx.send(WorkerCommand::Stop).await;
        tracing::debug!(worker = %slot.id, workers = self.workers.len(), "scaled down");
    }

    async fn scale_down_idle(&mut self) {
        while self.workers.len() > self.cfg.min_workers {
            let Some(widx) = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| {
                    w.active_task.is_none()
                        && w.last_used_at.elapsed() > PoolConfig::IDLE_SCALE_DOWN
                })
                .min_by_key(|(_, w)| w.last_used_at)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            self.remove_worker(widx).await;
        }
    }

    async fn scale_to(&mut self, target: usize) {
        let target = target.clamp(self.cfg.min_workers, self.cfg.max_workers);
        while self.workers.len() < target {
            self.spawn_worker();
        }
        while self.workers.len() > target {
            // Running tasks are never aborted: only idle workers go.
            let Some(widx) = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.active_task.is_none())
                .min_by_key(|(_, w)| w.last_used_at)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            self.remove_worker(widx).await;
        }
        self.dispatch().await;
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            pending = self.queue.len(),
            unsettled = self.tasks.len(),
            "pool shutting down"
        );
        self.queue.clear();
        self.deadlines.clear();
        for (_, entry) in self.tasks.drain() {
            entry.cancel.cancel();
            self.counters.cancelled += 1;
            let _ = entry.respond.send(Err(TaskError::Cancelled));
        }

        for slot in &mut self.workers {
            slot.memory.flush().await;
            let _ = slot.cmd_tx.send(WorkerCommand::Stop).await;
        }
        self.workers.clear();
        while self.worker_join.join_next().await.is_some() {}
        tracing::info!("pool stopped");
    }

    fn build_status(&self) -> PoolStatus {
        let mut backends = BTreeMap::new();
        let worker_stats: Vec<WorkerStats> = self
            .workers
            .iter()
            .map(|w| {
                let snap = w.status.snapshot();
                if let Some(kind) = snap.current {
                    *backends.entry(kind.to_string()).or_insert(0) += 1;
                }
                WorkerStats {
                    id: w.id.clone(),
                    active_tasks: usize::from(w.active_task.is_some()),
                    completed_tasks: w.completed,
                    failed_tasks: w.failed,
                    idle_ms: w.last_used_at.elapsed().as_millis() as u64,
                    backend: snap.current,
                    backends: snap.backends,
                }
            })
            .collect();

        PoolStatus {
            workers: self.workers.len(),
            min_workers: self.cfg.min_workers,
            max_workers: self.cfg.max_workers,
            queue_len: self.queue.len(),
            in_flight: self.workers.iter().filter(|w| w.active_task.is_some()).count(),
            counters: self.counters,
            worker_stats,
            backends,
        }
    }
}

async fn deadline_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Execution core for `ruvltra` (worker pool, multi-backend inference, pattern memory).

/// Public API for the engine crate.
pub mod api;

mod backends;
mod breaker;
mod inference;
mod pool;
mod prompt;
mod sona;
mod worker;

pub use api::{
    start_pool, BackendKind, BackendStatus, EmbeddedRuntime, GenerateRequest, GenerateResult,
    HttpConfig, MemoryStats, NativeConfig, PatternStats, PoolConfig, PoolCounters, PoolHandle,
    PoolStatus, SonaConfig, TaskError, TaskType, WorkerStats,
};

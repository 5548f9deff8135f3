//! Cooperative scheduler
//!
//! Runnable contexts are multiplexed over a bounded tokio worker pool. A
//! scheduled context runs as one task: it executes a quantum of
//! continuations, yields the worker, and repeats until it suspends or
//! finishes. Suspension ends the task; whoever resumes the context spawns a
//! new one, so a parked session never occupies a worker thread.

use std::io;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use super::EngineConfig;
use super::context::{ExecutionContext, Quantum};

/// Build the worker pool described by `config`.
pub(crate) fn build_worker_pool(config: &EngineConfig) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("weft-worker")
        .enable_all()
        .build()
}

/// Spawns context run loops onto the worker pool.
pub(crate) struct Scheduler {
    handle: Handle,
    quantum: usize,
}

impl Scheduler {
    pub(crate) fn new(handle: Handle, quantum: usize) -> Self {
        Self { handle, quantum }
    }

    /// Make `context` run. The caller guarantees it is not already scheduled.
    pub(crate) fn schedule(&self, context: Arc<ExecutionContext>) {
        let quantum = self.quantum;
        self.handle.spawn(async move {
            loop {
                match context.run_quantum(quantum) {
                    Quantum::Yielded => tokio::task::yield_now().await,
                    Quantum::Parked => break,
                }
            }
        });
    }
}

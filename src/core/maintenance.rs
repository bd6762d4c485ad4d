//! Purpose: Run garbage collection and compaction on background threads.
//! Exports: `EngineConfig`, `PeriodicTask`, `Maintenance`.
//! Role: Owns the lifetime of the GC and compactor threads for a running server.
//! Invariants: Shutdown stops the compactor before the collector, then runs two
//! final collection passes so no reclaimable version outlives the engine.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::compactor::{BlockCompactor, CompactionQueue};
use crate::core::error::{Error, ErrorKind};
use crate::core::gc::{AccessObserver, GarbageCollector};
use crate::core::table::DataTable;
use crate::core::txn::TransactionManager;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub slots_per_block: u32,
    pub gc_period: Duration,
    pub compaction_period: Duration,
    /// GC passes without a write before a block is queued for compaction.
    pub cold_after_gc_runs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slots_per_block: 1024,
            gc_period: Duration::from_millis(1),
            compaction_period: Duration::from_millis(10),
            cold_after_gc_runs: 10,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.slots_per_block == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("slots per block must be positive"));
        }
        if self.gc_period.is_zero() || self.compaction_period.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("maintenance periods must be positive")
                .with_hint("Use at least 1ms for --gc-period-ms and --compaction-period-ms."));
        }
        if self.cold_after_gc_runs == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("cold threshold must be positive"));
        }
        Ok(())
    }
}

/// A named thread that runs `work` every `period` until stopped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, mut work: F) -> Result<Self, Error>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => work(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to spawn {name} thread"))
                    .with_source(err)
            })?;
        tracing::debug!(task = name, ?period, "started periodic task");
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the thread and waits for its current run to finish.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(task = %self.name, "periodic task panicked");
            } else {
                tracing::debug!(task = %self.name, "stopped periodic task");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background GC and compaction for a set of tables sharing one manager.
#[derive(Debug)]
pub struct Maintenance {
    gc: Arc<Mutex<GarbageCollector>>,
    gc_task: PeriodicTask,
    compactor_task: PeriodicTask,
}

impl Maintenance {
    pub fn start(
        config: &EngineConfig,
        manager: &TransactionManager,
        tables: Vec<Arc<DataTable>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let queue = CompactionQueue::new();
        let observer = AccessObserver::new(queue.clone(), config.cold_after_gc_runs);
        let gc = Arc::new(Mutex::new(GarbageCollector::new(
            manager.clone(),
            tables,
            observer,
        )));
        let compactor = BlockCompactor::new(manager.clone(), queue);

        let gc_for_task = Arc::clone(&gc);
        let gc_task = PeriodicTask::spawn("blockflight-gc", config.gc_period, move || {
            gc_for_task.lock().perform_garbage_collection();
        })?;
        let compactor_task =
            PeriodicTask::spawn("blockflight-compactor", config.compaction_period, move || {
                let stats = compactor.process_compaction_queue();
                if stats.frozen > 0 {
                    tracing::debug!(frozen = stats.frozen, deferred = stats.deferred, "compaction pass");
                }
            })?;
        Ok(Self {
            gc,
            gc_task,
            compactor_task,
        })
    }

    pub fn shutdown(mut self) {
        self.compactor_task.stop();
        self.gc_task.stop();
        let mut gc = self.gc.lock();
        gc.perform_garbage_collection();
        gc.perform_garbage_collection();
        tracing::info!("maintenance stopped");
    }
}

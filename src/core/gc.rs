// Version-chain reclamation plus the access observer that spots cold blocks.
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::block::{Block, BlockId};
use crate::core::compactor::CompactionQueue;
use crate::core::table::DataTable;
use crate::core::txn::TransactionManager;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcStats {
    pub blocks_scanned: usize,
    pub versions_reclaimed: usize,
    pub blocks_queued: usize,
}

/// Tracks the GC run in which each block was last written. A block untouched
/// for `cold_after` runs is handed to the compactor.
#[derive(Debug)]
pub struct AccessObserver {
    runs: u64,
    cold_after: u64,
    last_touched: HashMap<BlockId, (u64, Arc<Block>)>,
    queue: CompactionQueue,
}

impl AccessObserver {
    pub fn new(queue: CompactionQueue, cold_after: u64) -> Self {
        Self {
            runs: 0,
            cold_after: cold_after.max(1),
            last_touched: HashMap::new(),
            queue,
        }
    }

    pub fn observe_write(&mut self, block: &Arc<Block>) {
        self.last_touched
            .insert(block.id(), (self.runs, Arc::clone(block)));
    }

    /// Advances the run counter and queues blocks that went cold. Returns how
    /// many were queued.
    pub fn observe_gc_invocation(&mut self) -> usize {
        self.runs += 1;
        let runs = self.runs;
        let cold_after = self.cold_after;
        let mut queued = 0;
        let queue = &self.queue;
        self.last_touched.retain(|_, (touched, block)| {
            if runs - *touched < cold_after {
                return true;
            }
            queue.push(Arc::clone(block));
            queued += 1;
            false
        });
        queued
    }

    pub fn tracked_blocks(&self) -> usize {
        self.last_touched.len()
    }
}

#[derive(Debug)]
pub struct GarbageCollector {
    manager: TransactionManager,
    tables: Vec<Arc<DataTable>>,
    observer: AccessObserver,
}

impl GarbageCollector {
    pub fn new(
        manager: TransactionManager,
        tables: Vec<Arc<DataTable>>,
        observer: AccessObserver,
    ) -> Self {
        Self {
            manager,
            tables,
            observer,
        }
    }

    /// One pass: prune every block written since the previous pass down to
    /// what the oldest running transaction can still see.
    pub fn perform_garbage_collection(&mut self) -> GcStats {
        let oldest_active = self.manager.oldest_active_start();
        let mut stats = GcStats::default();
        for table in &self.tables {
            for block in table.take_modified() {
                self.observer.observe_write(&block);
                let outcome = block.prune(oldest_active);
                stats.blocks_scanned += 1;
                stats.versions_reclaimed += outcome.reclaimed;
                if outcome.multi_version_slots > 0 {
                    table.mark_modified(&block);
                }
            }
        }
        stats.blocks_queued = self.observer.observe_gc_invocation();
        if stats.versions_reclaimed > 0 || stats.blocks_queued > 0 {
            tracing::trace!(
                reclaimed = stats.versions_reclaimed,
                queued = stats.blocks_queued,
                "gc pass"
            );
        }
        stats
    }
}

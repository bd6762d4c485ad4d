//! Purpose: Freeze cold blocks in place into immutable Arrow buffers.
//! Exports: `CompactionQueue`, `BlockCompactor`, `CompactionStats`.
//! Role: Only writer of block state besides the engine's thaw-on-write path.
//! Invariants: A block is frozen only when no lease is held on it and every slot's
//! newest version is committed at or before the oldest running transaction.
//! Invariants: Frozen buffers hold one row per visible slot, in slot order.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::core::block::{Block, FreezeOutcome, FrozenColumns};
use crate::core::column::RowBuilders;
use crate::core::error::{Error, ErrorKind};
use crate::core::row::{RowImage, RowView};
use crate::core::txn::TransactionManager;

/// Blocks waiting to be frozen. Cloning shares the queue.
#[derive(Clone, Debug, Default)]
pub struct CompactionQueue {
    inner: Arc<Mutex<VecDeque<Arc<Block>>>>,
}

impl CompactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, block: Arc<Block>) {
        let mut queue = self.inner.lock();
        if queue.iter().any(|queued| queued.id() == block.id()) {
            return;
        }
        queue.push_back(block);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn drain(&self) -> Vec<Arc<Block>> {
        self.inner.lock().drain(..).collect()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompactionStats {
    pub frozen: usize,
    pub deferred: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct BlockCompactor {
    manager: TransactionManager,
    queue: CompactionQueue,
}

impl BlockCompactor {
    pub fn new(manager: TransactionManager, queue: CompactionQueue) -> Self {
        Self { manager, queue }
    }

    pub fn queue(&self) -> &CompactionQueue {
        &self.queue
    }

    /// One compaction pass over everything queued so far. Blocks that are
    /// leased or still carry recent writes go back on the queue.
    pub fn process_compaction_queue(&self) -> CompactionStats {
        let mut stats = CompactionStats::default();
        for block in self.queue.drain() {
            match self.freeze(&block) {
                FreezeOutcome::Frozen { rows } => {
                    tracing::debug!(block = %block.id(), rows, "froze block");
                    stats.frozen += 1;
                }
                FreezeOutcome::Leased | FreezeOutcome::InFlightWrites => {
                    stats.deferred += 1;
                    self.queue.push(block);
                }
                FreezeOutcome::Unconvertible => {
                    tracing::warn!(block = %block.id(), "block holds rows arrow cannot represent");
                    stats.dropped += 1;
                }
                FreezeOutcome::AlreadyFrozen | FreezeOutcome::Preempted => {
                    stats.dropped += 1;
                }
            }
        }
        stats
    }

    /// Attempts to freeze one block now.
    pub fn freeze(&self, block: &Block) -> FreezeOutcome {
        if let Some(outcome) = block.begin_freeze() {
            return outcome;
        }
        let horizon = self.manager.oldest_active_start();
        let frozen = block.committed_images(horizon).and_then(|images| {
            build_frozen(block, &images).map_err(|err| {
                tracing::debug!(block = %block.id(), error = %err, "freeze build failed");
                FreezeOutcome::Unconvertible
            })
        });
        block.finish_freeze(frozen)
    }
}

fn build_frozen(block: &Block, images: &[Arc<RowImage>]) -> Result<FrozenColumns, Error> {
    let layout = block.layout();
    let mut view = RowView::new(Arc::clone(layout));
    let mut builders = RowBuilders::new(layout);
    for image in images {
        view.fill(image);
        builders.append_row(&view)?;
    }
    let batch = RecordBatch::try_new(layout.schema(), builders.finish()).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to assemble frozen columns")
            .with_block(block.id().0)
            .with_source(err)
    })?;
    Ok(FrozenColumns::from_batch(batch))
}

#[cfg(test)]
mod tests {
    use super::{BlockCompactor, CompactionQueue};
    use crate::core::block::{BlockSnapshot, BlockState, FreezeOutcome};
    use crate::core::layout::{BlockLayout, ColumnDef, ColumnType};
    use crate::core::row::{Datum, RowView};
    use crate::core::table::DataTable;
    use crate::core::txn::TransactionManager;
    use arrow::array::{Array, StringArray, UInt32Array};
    use std::sync::Arc;

    fn table(slots: u32) -> DataTable {
        let layout = BlockLayout::new(
            vec![
                ColumnDef::new("id", ColumnType::UInt32).not_null(),
                ColumnDef::new("tag", ColumnType::Utf8),
            ],
            slots,
        )
        .expect("layout");
        DataTable::new("t", layout, TransactionManager::new())
    }

    fn load(table: &DataTable, rows: &[(u32, Option<&str>)]) {
        let mut txn = table.manager().begin();
        for (id, tag) in rows {
            let tag = tag.map_or(Datum::Null, |tag| Datum::Utf8(tag.to_string()));
            table.insert(&mut txn, &[tag, Datum::UInt32(*id)]).expect("insert");
        }
        table.manager().commit(txn, || {}).expect("commit");
    }

    fn compactor(table: &DataTable) -> BlockCompactor {
        BlockCompactor::new(table.manager().clone(), CompactionQueue::new())
    }

    #[test]
    fn freeze_builds_columns_in_slot_order() {
        let table = table(4);
        load(&table, &[(1, Some("a")), (2, None), (3, Some("c"))]);
        let block = table.blocks().remove(0);
        assert_eq!(compactor(&table).freeze(&block), FreezeOutcome::Frozen { rows: 3 });

        let BlockSnapshot::Frozen(frozen) = block.snapshot() else {
            panic!("expected frozen block");
        };
        let tags = frozen.columns()[0].as_any().downcast_ref::<StringArray>().expect("tags");
        let ids = frozen.columns()[1].as_any().downcast_ref::<UInt32Array>().expect("ids");
        assert_eq!(ids.values().to_vec(), vec![1, 2, 3]);
        assert!(tags.is_null(1));
        assert_eq!(tags.value(2), "c");
    }

    #[test]
    fn deleted_rows_are_left_out() {
        let table = table(4);
        load(&table, &[(1, Some("a")), (2, Some("b"))]);
        let block = table.blocks().remove(0);
        let mut txn = table.manager().begin();
        table
            .delete(&mut txn, crate::core::block::TupleSlot { block: block.id(), offset: 0 })
            .expect("delete");
        table.manager().commit(txn, || {}).expect("commit");
        assert_eq!(compactor(&table).freeze(&block), FreezeOutcome::Frozen { rows: 1 });
    }

    #[test]
    fn pending_writes_defer_freeze() {
        let table = table(4);
        load(&table, &[(1, Some("a"))]);
        let block = table.blocks().remove(0);
        let mut writer = table.manager().begin();
        table.insert(&mut writer, &[Datum::Null, Datum::UInt32(2)]).expect("insert");

        let compactor = compactor(&table);
        compactor.queue().push(Arc::clone(&block));
        let stats = compactor.process_compaction_queue();
        assert_eq!(stats.deferred, 1);
        assert_eq!(compactor.queue().len(), 1);
        assert_eq!(block.current_state(), BlockState::Hot);

        table.manager().commit(writer, || {}).expect("commit");
        let stats = compactor.process_compaction_queue();
        assert_eq!(stats.frozen, 1);
        assert!(compactor.queue().is_empty());
    }

    #[test]
    fn reader_older_than_last_commit_defers_freeze() {
        let table = table(4);
        let reader = table.manager().begin();
        load(&table, &[(1, Some("a"))]);
        let block = table.blocks().remove(0);
        assert_eq!(compactor(&table).freeze(&block), FreezeOutcome::InFlightWrites);
        drop(reader);
        assert_eq!(compactor(&table).freeze(&block), FreezeOutcome::Frozen { rows: 1 });
    }

    #[test]
    fn scan_lease_blocks_freeze_and_row_reads_stay_valid() {
        let table = table(4);
        load(&table, &[(7, Some("x"))]);
        let block = table.blocks().remove(0);
        let compactor = compactor(&table);
        compactor.queue().push(Arc::clone(&block));

        let lease = block.lease();
        let reader = table.manager().begin();
        assert_eq!(compactor.process_compaction_queue().deferred, 1);
        let mut view = RowView::new(Arc::clone(table.layout()));
        let slot = crate::core::block::TupleSlot { block: block.id(), offset: 0 };
        assert!(table.select(&reader, slot, &mut view).expect("select"));
        assert_eq!(view.datum(1).expect("id"), Datum::UInt32(7));
        drop(reader);
        drop(lease);

        assert_eq!(compactor.process_compaction_queue().frozen, 1);
        let reader = table.manager().begin();
        assert!(table.select(&reader, slot, &mut view).expect("select after freeze"));
    }

    #[test]
    fn invalid_payload_keeps_block_hot() {
        let table = table(4);
        let mut txn = table.manager().begin();
        table
            .insert(&mut txn, &[Datum::Bytes(vec![0xff, 0xfe]), Datum::UInt32(1)])
            .expect("insert");
        table.manager().commit(txn, || {}).expect("commit");
        let block = table.blocks().remove(0);
        let compactor = compactor(&table);
        compactor.queue().push(Arc::clone(&block));
        let stats = compactor.process_compaction_queue();
        assert_eq!(stats.dropped, 1);
        assert_eq!(block.current_state(), BlockState::Hot);
    }

    #[test]
    fn write_after_freeze_thaws_block() {
        let table = table(4);
        load(&table, &[(1, Some("a"))]);
        let block = table.blocks().remove(0);
        compactor(&table).freeze(&block);
        assert_eq!(block.current_state(), BlockState::Frozen);
        load(&table, &[(2, Some("b"))]);
        assert_eq!(block.current_state(), BlockState::Hot);
    }
}

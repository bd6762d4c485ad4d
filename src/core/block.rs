// Fixed-capacity blocks: per-slot version chains, state, and frozen columnar buffers.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::array::ArrayRef;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::BlockLayout;
use crate::core::row::{RowImage, RowView};
use crate::core::txn::{CommitStamp, StampState, Transaction};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TupleSlot {
    pub block: BlockId,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockState {
    Hot,
    Freezing,
    Frozen,
}

/// Immutable columnar image of a frozen block, in layout column order.
#[derive(Debug)]
pub struct FrozenColumns {
    schema: SchemaRef,
    columns: Vec<ArrayRef>,
    num_rows: usize,
}

impl FrozenColumns {
    pub fn new(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<Self, Error> {
        if schema.fields().len() != columns.len() {
            return Err(Error::new(ErrorKind::SchemaMismatch)
                .with_message("frozen column count differs from its schema"));
        }
        let num_rows = columns.first().map(|column| column.len()).unwrap_or(0);
        if columns.iter().any(|column| column.len() != num_rows) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("frozen columns have unequal lengths"));
        }
        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    pub(crate) fn from_batch(batch: RecordBatch) -> Self {
        let num_rows = batch.num_rows();
        Self {
            schema: batch.schema(),
            columns: batch.columns().to_vec(),
            num_rows,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn columns(&self) -> &[ArrayRef] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }
}

/// A block's state as observed at one instant. Frozen carries the buffers
/// that were current when the state was read.
#[derive(Clone, Debug)]
pub enum BlockSnapshot {
    Hot,
    Freezing,
    Frozen(Arc<FrozenColumns>),
}

impl BlockSnapshot {
    pub fn state(&self) -> BlockState {
        match self {
            BlockSnapshot::Hot => BlockState::Hot,
            BlockSnapshot::Freezing => BlockState::Freezing,
            BlockSnapshot::Frozen(_) => BlockState::Frozen,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Version {
    txn_id: u64,
    stamp: Arc<CommitStamp>,
    image: Option<Arc<RowImage>>,
}

impl Version {
    fn visible_to(&self, txn_id: u64, start_ts: u64) -> bool {
        if self.txn_id == txn_id {
            return true;
        }
        matches!(self.stamp.state(), StampState::Committed(ts) if ts <= start_ts)
    }
}

#[derive(Debug)]
struct BlockInner {
    state: BlockSnapshot,
    // Oldest version first. Slots past `len()` have never been written.
    slots: Vec<Vec<Version>>,
}

#[derive(Debug)]
pub struct Block {
    id: BlockId,
    layout: Arc<BlockLayout>,
    inner: RwLock<BlockInner>,
    leases: AtomicUsize,
}

/// Outcome of a compactor freeze attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreezeOutcome {
    Frozen { rows: usize },
    AlreadyFrozen,
    Leased,
    InFlightWrites,
    Preempted,
    Unconvertible,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PruneOutcome {
    pub reclaimed: usize,
    pub multi_version_slots: usize,
}

impl Block {
    pub(crate) fn new(id: BlockId, layout: Arc<BlockLayout>) -> Self {
        let capacity = layout.num_slots() as usize;
        Self {
            id,
            layout,
            inner: RwLock::new(BlockInner {
                state: BlockSnapshot::Hot,
                slots: Vec::with_capacity(capacity),
            }),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.layout.num_slots()
    }

    pub fn used_slots(&self) -> u32 {
        self.inner.read().slots.len() as u32
    }

    pub fn current_state(&self) -> BlockState {
        self.inner.read().state.state()
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        self.inner.read().state.clone()
    }

    /// Marks the block as being scanned. The compactor will not move a leased
    /// block to Frozen; writers are unaffected.
    pub fn lease(self: &Arc<Self>) -> BlockLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        BlockLease {
            block: Arc::clone(self),
        }
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Copies the version of `offset` visible to `txn` into `row`.
    pub(crate) fn select(&self, txn: &Transaction, offset: u32, row: &mut RowView) -> bool {
        let inner = self.inner.read();
        let visible = inner
            .slots
            .get(offset as usize)
            .and_then(|chain| {
                chain
                    .iter()
                    .rev()
                    .find(|version| version.visible_to(txn.id(), txn.start_ts()))
            })
            .and_then(|version| version.image.as_ref());
        match visible {
            Some(image) => {
                row.fill(image);
                true
            }
            None => {
                row.clear();
                false
            }
        }
    }

    /// Claims the next free slot for a new row, or `None` when full.
    pub(crate) fn stage_insert(&self, txn: &Transaction, image: Arc<RowImage>) -> Option<u32> {
        let mut inner = self.inner.write();
        if inner.slots.len() >= self.capacity() as usize {
            return None;
        }
        thaw(&mut inner);
        let offset = inner.slots.len() as u32;
        inner.slots.push(vec![Version {
            txn_id: txn.id(),
            stamp: txn.stamp(),
            image: Some(image),
        }]);
        Some(offset)
    }

    /// Stages an update (`Some`) or delete (`None`) of an existing row.
    pub(crate) fn stage_write(
        &self,
        txn: &Transaction,
        offset: u32,
        image: Option<Arc<RowImage>>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let Some(chain) = inner.slots.get(offset as usize) else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("slot has never been written")
                .with_block(self.id.0)
                .with_slot(offset));
        };
        let newest = chain
            .iter()
            .rev()
            .find(|version| version.stamp.state() != StampState::Aborted);
        match newest {
            Some(version) if version.txn_id == txn.id() => {}
            Some(version) => match version.stamp.state() {
                StampState::Committed(ts) if ts <= txn.start_ts() => {}
                _ => {
                    return Err(Error::new(ErrorKind::WriteConflict)
                        .with_message("row was modified by a concurrent transaction")
                        .with_block(self.id.0)
                        .with_slot(offset));
                }
            },
            None => {}
        }
        if newest.and_then(|version| version.image.as_ref()).is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("row does not exist")
                .with_block(self.id.0)
                .with_slot(offset));
        }

        thaw(&mut inner);
        inner.slots[offset as usize].push(Version {
            txn_id: txn.id(),
            stamp: txn.stamp(),
            image,
        });
        Ok(())
    }

    /// Drops aborted versions and every version hidden behind the newest one
    /// committed at or before `oldest_active`.
    pub(crate) fn prune(&self, oldest_active: u64) -> PruneOutcome {
        let mut inner = self.inner.write();
        let mut outcome = PruneOutcome::default();
        for chain in inner.slots.iter_mut() {
            let before = chain.len();
            chain.retain(|version| version.stamp.state() != StampState::Aborted);
            let floor = chain.iter().rposition(|version| {
                matches!(version.stamp.state(), StampState::Committed(ts) if ts <= oldest_active)
            });
            if let Some(floor) = floor {
                chain.drain(..floor);
                if chain.len() == 1 && chain[0].image.is_none() {
                    chain.clear();
                }
            }
            outcome.reclaimed += before - chain.len();
            if chain.len() > 1 {
                outcome.multi_version_slots += 1;
            }
        }
        outcome
    }

    pub(crate) fn begin_freeze(&self) -> Option<FreezeOutcome> {
        let mut inner = self.inner.write();
        match inner.state {
            BlockSnapshot::Frozen(_) => return Some(FreezeOutcome::AlreadyFrozen),
            BlockSnapshot::Freezing => return Some(FreezeOutcome::Preempted),
            BlockSnapshot::Hot => {}
        }
        if self.active_leases() > 0 {
            return Some(FreezeOutcome::Leased);
        }
        inner.state = BlockSnapshot::Freezing;
        None
    }

    /// Latest committed image of every slot, in slot order. Fails with
    /// `InFlightWrites` when any slot has an uncommitted version or one
    /// committed after `horizon`, since some running reader could not see it.
    pub(crate) fn committed_images(
        &self,
        horizon: u64,
    ) -> Result<Vec<Arc<RowImage>>, FreezeOutcome> {
        let inner = self.inner.read();
        let mut images = Vec::with_capacity(inner.slots.len());
        for chain in &inner.slots {
            let newest = chain
                .iter()
                .rev()
                .find(|version| version.stamp.state() != StampState::Aborted);
            let Some(version) = newest else {
                continue;
            };
            match version.stamp.state() {
                StampState::Committed(ts) if ts <= horizon => {}
                _ => return Err(FreezeOutcome::InFlightWrites),
            }
            if let Some(image) = &version.image {
                images.push(Arc::clone(image));
            }
        }
        Ok(images)
    }

    pub(crate) fn finish_freeze(
        &self,
        frozen: Result<FrozenColumns, FreezeOutcome>,
    ) -> FreezeOutcome {
        let mut inner = self.inner.write();
        if !matches!(inner.state, BlockSnapshot::Freezing) {
            return FreezeOutcome::Preempted;
        }
        let frozen = match frozen {
            Ok(frozen) => frozen,
            Err(outcome) => {
                inner.state = BlockSnapshot::Hot;
                return outcome;
            }
        };
        if self.active_leases() > 0 {
            inner.state = BlockSnapshot::Hot;
            return FreezeOutcome::Leased;
        }
        let rows = frozen.num_rows();
        inner.state = BlockSnapshot::Frozen(Arc::new(frozen));
        FreezeOutcome::Frozen { rows }
    }
}

// Any write to a non-hot block returns it to Hot and drops its columnar image.
fn thaw(inner: &mut BlockInner) {
    if !matches!(inner.state, BlockSnapshot::Hot) {
        inner.state = BlockSnapshot::Hot;
    }
}

pub struct BlockLease {
    block: Arc<Block>,
}

impl BlockLease {
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        self.block.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::{Block, BlockId, BlockState, FreezeOutcome, Version};
    use crate::core::layout::{BlockLayout, ColumnDef, ColumnType};
    use crate::core::row::{Datum, RowImage, RowView};
    use crate::core::txn::{CommitStamp, TransactionManager};
    use std::sync::Arc;

    fn layout(slots: u32) -> Arc<BlockLayout> {
        Arc::new(BlockLayout::new(vec![ColumnDef::new("v", ColumnType::UInt32)], slots).expect("layout"))
    }

    fn image(layout: &BlockLayout, value: u32) -> Arc<RowImage> {
        Arc::new(RowImage::encode(layout, &[Datum::UInt32(value)]).expect("image"))
    }

    #[test]
    fn uncommitted_insert_is_invisible_to_others() {
        let manager = TransactionManager::new();
        let layout = layout(4);
        let block = Block::new(BlockId(1), Arc::clone(&layout));
        let mut writer = manager.begin();
        writer.record_write();
        let offset = block.stage_insert(&writer, image(&layout, 9)).expect("slot");

        let mut row = RowView::new(Arc::clone(&layout));
        let reader = manager.begin();
        assert!(!block.select(&reader, offset, &mut row));
        assert!(block.select(&writer, offset, &mut row));

        manager.commit(writer, || {}).expect("commit");
        assert!(!block.select(&reader, offset, &mut row));
        let late = manager.begin();
        assert!(block.select(&late, offset, &mut row));
        assert_eq!(row.datum(0).expect("v"), Datum::UInt32(9));
    }

    #[test]
    fn full_block_refuses_insert() {
        let manager = TransactionManager::new();
        let layout = layout(1);
        let block = Block::new(BlockId(1), Arc::clone(&layout));
        let txn = manager.begin();
        assert_eq!(block.stage_insert(&txn, image(&layout, 1)), Some(0));
        assert_eq!(block.stage_insert(&txn, image(&layout, 2)), None);
    }

    #[test]
    fn prune_keeps_versions_needed_by_oldest_reader() {
        let layout = layout(1);
        let block = Block::new(BlockId(1), Arc::clone(&layout));
        {
            let mut inner = block.inner.write();
            inner.slots.push(
                (1..=3)
                    .map(|ts| Version {
                        txn_id: ts,
                        stamp: Arc::new(CommitStamp::committed(ts)),
                        image: Some(image(&layout, ts as u32)),
                    })
                    .collect(),
            );
        }
        let outcome = block.prune(2);
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(outcome.multi_version_slots, 1);
        let outcome = block.prune(3);
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(outcome.multi_version_slots, 0);
    }

    #[test]
    fn leased_block_is_not_frozen() {
        let layout = layout(2);
        let block = Arc::new(Block::new(BlockId(1), layout));
        let lease = block.lease();
        assert_eq!(block.begin_freeze(), Some(FreezeOutcome::Leased));
        drop(lease);
        assert_eq!(block.begin_freeze(), None);
        assert_eq!(block.current_state(), BlockState::Freezing);
    }

    #[test]
    fn write_during_freeze_preempts_it() {
        let manager = TransactionManager::new();
        let layout = layout(2);
        let block = Block::new(BlockId(1), Arc::clone(&layout));
        assert_eq!(block.begin_freeze(), None);
        let txn = manager.begin();
        block.stage_insert(&txn, image(&layout, 1)).expect("slot");
        assert_eq!(block.current_state(), BlockState::Hot);
        assert_eq!(block.finish_freeze(Err(FreezeOutcome::InFlightWrites)), FreezeOutcome::Preempted);
    }
}

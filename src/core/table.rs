// A table is an ordered set of blocks sharing one layout and one transaction manager.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::core::block::{Block, BlockId, TupleSlot};
use crate::core::error::{Error, ErrorKind};
use crate::core::layout::BlockLayout;
use crate::core::row::{Datum, RowImage, RowView};
use crate::core::txn::{Transaction, TransactionManager};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

// Enumeration order plus an id index over the same blocks.
#[derive(Debug, Default)]
struct BlockList {
    order: Vec<Arc<Block>>,
    by_id: HashMap<BlockId, Arc<Block>>,
}

#[derive(Debug)]
pub struct DataTable {
    name: String,
    layout: Arc<BlockLayout>,
    manager: TransactionManager,
    blocks: RwLock<BlockList>,
    // Blocks written since the last garbage-collection pass.
    modified: Mutex<BTreeMap<BlockId, Arc<Block>>>,
}

impl DataTable {
    pub fn new(name: impl Into<String>, layout: BlockLayout, manager: TransactionManager) -> Self {
        Self {
            name: name.into(),
            layout: Arc::new(layout),
            manager,
            blocks: RwLock::new(BlockList::default()),
            modified: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Blocks in enumeration order, as of this call.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.read().order.clone()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.read().order.len()
    }

    pub fn block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.blocks.read().by_id.get(&id).cloned()
    }

    /// Inserts a row given in layout column order.
    pub fn insert(&self, txn: &mut Transaction, values: &[Datum]) -> Result<TupleSlot, Error> {
        self.ensure_owned(txn)?;
        let image = Arc::new(RowImage::encode(&self.layout, values)?);
        loop {
            let tail = self.blocks.read().order.last().cloned();
            if let Some(block) = &tail {
                if let Some(offset) = block.stage_insert(txn, Arc::clone(&image)) {
                    txn.record_write();
                    self.mark_modified(block);
                    return Ok(TupleSlot {
                        block: block.id(),
                        offset,
                    });
                }
            }
            self.grow(tail.map(|block| block.id()));
        }
    }

    pub fn update(&self, txn: &mut Transaction, slot: TupleSlot, values: &[Datum]) -> Result<(), Error> {
        self.ensure_owned(txn)?;
        let image = Arc::new(RowImage::encode(&self.layout, values)?);
        let block = self.resolve(slot)?;
        block.stage_write(txn, slot.offset, Some(image))?;
        txn.record_write();
        self.mark_modified(&block);
        Ok(())
    }

    pub fn delete(&self, txn: &mut Transaction, slot: TupleSlot) -> Result<(), Error> {
        self.ensure_owned(txn)?;
        let block = self.resolve(slot)?;
        block.stage_write(txn, slot.offset, None)?;
        txn.record_write();
        self.mark_modified(&block);
        Ok(())
    }

    /// Fills `row` with the version of `slot` visible to `txn`. Returns false
    /// for empty, deleted, or not-yet-visible slots.
    pub fn select(&self, txn: &Transaction, slot: TupleSlot, row: &mut RowView) -> Result<bool, Error> {
        self.check_reader(txn, row, slot.block)?;
        let block = self.resolve(slot).map_err(|err| {
            Error::new(ErrorKind::Visibility)
                .with_message(err.message().unwrap_or("invalid slot").to_string())
                .with_block(slot.block.0)
                .with_slot(slot.offset)
        })?;
        Ok(block.select(txn, slot.offset, row))
    }

    /// Convenience read of one row in layout order.
    pub fn get(&self, txn: &Transaction, slot: TupleSlot) -> Result<Option<Vec<Datum>>, Error> {
        let mut row = RowView::new(Arc::clone(&self.layout));
        if !self.select(txn, slot, &mut row)? {
            return Ok(None);
        }
        (0..self.layout.num_columns())
            .map(|column| row.datum(column))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Scans every slot of one block under `txn`, handing each visible row to
    /// `visit` in slot order.
    pub fn scan_block<F>(
        &self,
        txn: &Transaction,
        block: &Block,
        row: &mut RowView,
        mut visit: F,
    ) -> Result<usize, Error>
    where
        F: FnMut(&RowView) -> Result<(), Error>,
    {
        self.check_reader(txn, row, block.id())?;
        let owned = self
            .blocks
            .read()
            .by_id
            .get(&block.id())
            .is_some_and(|owned| std::ptr::eq(owned.as_ref(), block));
        if !owned {
            return Err(Error::new(ErrorKind::Visibility)
                .with_message("block does not belong to this table")
                .with_block(block.id().0));
        }
        let mut visible = 0;
        for offset in 0..block.capacity() {
            if block.select(txn, offset, row) {
                visit(row)?;
                visible += 1;
            }
        }
        Ok(visible)
    }

    pub(crate) fn take_modified(&self) -> Vec<Arc<Block>> {
        std::mem::take(&mut *self.modified.lock()).into_values().collect()
    }

    pub(crate) fn mark_modified(&self, block: &Arc<Block>) {
        self.modified.lock().entry(block.id()).or_insert_with(|| Arc::clone(block));
    }

    fn resolve(&self, slot: TupleSlot) -> Result<Arc<Block>, Error> {
        let block = self.block(slot.block).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("block does not belong to this table")
                .with_block(slot.block.0)
        })?;
        if slot.offset >= block.capacity() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("slot offset exceeds block capacity")
                .with_block(slot.block.0)
                .with_slot(slot.offset));
        }
        Ok(block)
    }

    fn check_reader(&self, txn: &Transaction, row: &RowView, block: BlockId) -> Result<(), Error> {
        if !self.manager.owns(txn) {
            return Err(Error::new(ErrorKind::Visibility)
                .with_message("read context belongs to another transaction manager")
                .with_block(block.0));
        }
        if !Arc::ptr_eq(row.layout(), &self.layout) {
            return Err(Error::new(ErrorKind::Visibility)
                .with_message("row view is bound to a different layout")
                .with_block(block.0));
        }
        Ok(())
    }

    fn ensure_owned(&self, txn: &Transaction) -> Result<(), Error> {
        if self.manager.owns(txn) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Usage).with_message("transaction belongs to another manager"))
        }
    }

    // Appends a block unless another writer already replaced the full tail.
    fn grow(&self, seen_tail: Option<BlockId>) {
        let mut blocks = self.blocks.write();
        if tail_id(&blocks.order) != seen_tail {
            return;
        }
        let id = BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(table = %self.name, block = %id, "allocated block");
        let block = Arc::new(Block::new(id, Arc::clone(&self.layout)));
        blocks.by_id.insert(id, Arc::clone(&block));
        blocks.order.push(block);
    }
}

fn tail_id(blocks: &[Arc<Block>]) -> Option<BlockId> {
    blocks.last().map(|block| block.id())
}

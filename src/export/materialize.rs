// Transactional row materializer: one read transaction per block, slots in order.
use arrow::record_batch::RecordBatch;

use crate::core::block::Block;
use crate::core::column::RowBuilders;
use crate::core::error::{Error, ErrorKind};
use crate::core::row::RowView;
use crate::core::table::DataTable;

/// Builds one chunk from the rows of `block` visible to a fresh snapshot.
///
/// `row` is the caller's reusable view; it must be bound to the table's
/// layout. On any error the transaction is aborted and no chunk is produced.
pub fn materialize(table: &DataTable, block: &Block, row: &mut RowView) -> Result<RecordBatch, Error> {
    let manager = table.manager();
    let txn = manager.begin();
    let mut builders = RowBuilders::new(table.layout());
    table.scan_block(&txn, block, row, |row| {
        builders
            .append_row(row)
            .map_err(|err| err.with_block(block.id().0))
    })?;
    manager.commit(txn, || {})?;

    RecordBatch::try_new(table.layout().schema(), builders.finish()).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("materialized columns do not match the export schema")
            .with_block(block.id().0)
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::materialize;
    use crate::core::error::ErrorKind;
    use crate::core::layout::{BlockLayout, ColumnDef, ColumnType};
    use crate::core::row::{Datum, RowView};
    use crate::core::table::DataTable;
    use crate::core::txn::TransactionManager;
    use arrow::array::{Array, Float64Array, StringArray};
    use std::sync::Arc;

    fn table() -> DataTable {
        let layout = BlockLayout::new(
            vec![
                ColumnDef::new("price", ColumnType::Float64),
                ColumnDef::new("label", ColumnType::Utf8),
            ],
            8,
        )
        .expect("layout");
        DataTable::new("t", layout, TransactionManager::new())
    }

    #[test]
    fn skips_invisible_slots_and_keeps_nulls() {
        let table = table();
        let manager = table.manager().clone();
        let mut txn = manager.begin();
        table
            .insert(&mut txn, &[Datum::Utf8("a".into()), Datum::Float64(1.5)])
            .expect("insert");
        table.insert(&mut txn, &[Datum::Null, Datum::Null]).expect("insert");
        manager.commit(txn, || {}).expect("commit");
        let mut pending = manager.begin();
        table
            .insert(&mut pending, &[Datum::Utf8("late".into()), Datum::Float64(9.0)])
            .expect("insert");

        let block = table.blocks().remove(0);
        let mut row = RowView::new(Arc::clone(table.layout()));
        let batch = materialize(&table, &block, &mut row).expect("materialize");
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), table.layout().schema());
        let labels = batch.column(0).as_any().downcast_ref::<StringArray>().expect("labels");
        let prices = batch.column(1).as_any().downcast_ref::<Float64Array>().expect("prices");
        assert_eq!(labels.value(0), "a");
        assert!(labels.is_null(1));
        assert_eq!(prices.value(0), 1.5);
        assert!(prices.is_null(1));
        drop(pending);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn invalid_payload_aborts_the_block() {
        let table = table();
        let manager = table.manager().clone();
        let mut txn = manager.begin();
        table
            .insert(&mut txn, &[Datum::Bytes(vec![0xc3, 0x28]), Datum::Float64(1.0)])
            .expect("insert");
        manager.commit(txn, || {}).expect("commit");

        let block = table.blocks().remove(0);
        let mut row = RowView::new(Arc::clone(table.layout()));
        let err = materialize(&table, &block, &mut row).expect_err("bad utf8");
        assert_eq!(err.kind(), ErrorKind::ColumnAppend);
        assert_eq!(err.block(), Some(block.id().0));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn foreign_row_view_is_a_visibility_error() {
        let table = table();
        let mut txn = table.manager().begin();
        table.insert(&mut txn, &[Datum::Null, Datum::Float64(1.0)]).expect("insert");
        table.manager().commit(txn, || {}).expect("commit");
        let other = self::table();
        let mut row = RowView::new(Arc::clone(other.layout()));
        let block = table.blocks().remove(0);
        let err = materialize(&table, &block, &mut row).expect_err("foreign view");
        assert_eq!(err.kind(), ErrorKind::Visibility);
    }
}

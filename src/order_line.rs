//! Purpose: Deterministic `order_line` fixture used by the server and tests.
//! Exports: `layout`, `OrderLine`, `LoadConfig`, `load`, `deliver_oldest`.
//! Role: Populates a table with realistic mixed-width rows, some with null
//! delivery dates, and a delivery pass that rewrites a subset of them.
//! Invariants: The same `LoadConfig` always produces the same rows in the same slots.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::block::TupleSlot;
use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{BlockLayout, ColumnDef, ColumnType};
use crate::core::row::Datum;
use crate::core::table::DataTable;

pub const TABLE_NAME: &str = "order_line";

const DIST_INFO_LEN: usize = 24;

/// Columns in declaration order; the layout reorders them widest first.
pub fn layout(slots_per_block: u32) -> Result<BlockLayout, Error> {
    BlockLayout::new(
        vec![
            ColumnDef::new("o_id", ColumnType::UInt32).not_null(),
            ColumnDef::new("o_d_id", ColumnType::UInt8).not_null(),
            ColumnDef::new("o_w_id", ColumnType::UInt8).not_null(),
            ColumnDef::new("ol_number", ColumnType::UInt8).not_null(),
            ColumnDef::new("ol_i_id", ColumnType::UInt32).not_null(),
            ColumnDef::new("ol_supply_w_id", ColumnType::UInt8).not_null(),
            ColumnDef::new("ol_delivery_d", ColumnType::UInt64),
            ColumnDef::new("ol_quantity", ColumnType::UInt8).not_null(),
            ColumnDef::new("ol_amount", ColumnType::UInt64).not_null(),
            ColumnDef::new("ol_dist_info", ColumnType::Utf8).not_null(),
        ],
        slots_per_block,
    )
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderLine {
    pub o_id: u32,
    pub d_id: u8,
    pub w_id: u8,
    pub number: u8,
    pub i_id: u32,
    pub supply_w_id: u8,
    pub delivery_d: Option<u64>,
    pub quantity: u8,
    pub amount: u64,
    pub dist_info: String,
}

impl OrderLine {
    /// Values in `layout`'s column order.
    pub fn to_row(&self, layout: &BlockLayout) -> Result<Vec<Datum>, Error> {
        let named = [
            ("o_id", Datum::UInt32(self.o_id)),
            ("o_d_id", Datum::UInt8(self.d_id)),
            ("o_w_id", Datum::UInt8(self.w_id)),
            ("ol_number", Datum::UInt8(self.number)),
            ("ol_i_id", Datum::UInt32(self.i_id)),
            ("ol_supply_w_id", Datum::UInt8(self.supply_w_id)),
            ("ol_delivery_d", self.delivery_d.map_or(Datum::Null, Datum::UInt64)),
            ("ol_quantity", Datum::UInt8(self.quantity)),
            ("ol_amount", Datum::UInt64(self.amount)),
            ("ol_dist_info", Datum::Utf8(self.dist_info.clone())),
        ];
        let mut row = vec![Datum::Null; layout.num_columns()];
        for (name, value) in named {
            let index = layout.column_index(name).ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!("layout has no column {name}"))
            })?;
            row[index] = value;
        }
        Ok(row)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadConfig {
    pub warehouses: u8,
    pub districts_per_warehouse: u8,
    pub orders_per_district: u32,
    /// Orders above this id per district start undelivered.
    pub delivered_through: u32,
    pub seed: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            warehouses: 1,
            districts_per_warehouse: 10,
            orders_per_district: 300,
            delivered_through: 210,
            seed: 0x5eed,
        }
    }
}

/// Generates every order line for `config` in insertion order.
pub fn generate(config: &LoadConfig) -> Vec<OrderLine> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut lines = Vec::new();
    for w_id in 1..=config.warehouses {
        for d_id in 1..=config.districts_per_warehouse {
            for o_id in 1..=config.orders_per_district {
                let count: u8 = rng.gen_range(5..=15);
                for number in 1..=count {
                    let delivered = o_id <= config.delivered_through;
                    lines.push(OrderLine {
                        o_id,
                        d_id,
                        w_id,
                        number,
                        i_id: rng.gen_range(1..=100_000),
                        supply_w_id: w_id,
                        delivery_d: delivered.then(|| 1_600_000_000 + u64::from(o_id)),
                        quantity: 5,
                        amount: if delivered { 0 } else { rng.gen_range(1..=999_999) },
                        dist_info: (&mut rng)
                            .sample_iter(&Alphanumeric)
                            .take(DIST_INFO_LEN)
                            .map(char::from)
                            .collect(),
                    });
                }
            }
        }
    }
    lines
}

/// Loads the fixture in one transaction and returns the number of rows.
pub fn load(table: &DataTable, config: &LoadConfig) -> Result<usize, Error> {
    let lines = generate(config);
    let mut txn = table.manager().begin();
    for line in &lines {
        table.insert(&mut txn, &line.to_row(table.layout())?)?;
    }
    table.manager().commit(txn, || {})?;
    tracing::info!(table = table.name(), rows = lines.len(), blocks = table.num_blocks(), "loaded fixture");
    Ok(lines.len())
}

/// Stamps `delivery_d` on every line of the oldest undelivered order in each
/// district. Touched blocks return to Hot. Returns the number of lines updated.
pub fn deliver_oldest(table: &DataTable, delivery_d: u64) -> Result<usize, Error> {
    let layout = table.layout();
    let column = |name: &str| {
        layout.column_index(name).ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!("layout has no column {name}"))
        })
    };
    let (o_id, d_id, w_id, delivery) =
        (column("o_id")?, column("o_d_id")?, column("o_w_id")?, column("ol_delivery_d")?);

    let manager = table.manager();
    let mut txn = manager.begin();
    let mut pending: Vec<(TupleSlot, Vec<Datum>)> = Vec::new();
    let mut oldest: std::collections::BTreeMap<(u8, u8), u32> = std::collections::BTreeMap::new();
    for block in table.blocks() {
        for offset in 0..block.used_slots() {
            let slot = TupleSlot {
                block: block.id(),
                offset,
            };
            let Some(row) = table.get(&txn, slot)? else {
                continue;
            };
            if row[delivery] != Datum::Null {
                continue;
            }
            if let (Datum::UInt32(order), Datum::UInt8(district), Datum::UInt8(warehouse)) =
                (&row[o_id], &row[d_id], &row[w_id])
            {
                let entry = oldest.entry((*warehouse, *district)).or_insert(*order);
                *entry = (*entry).min(*order);
                pending.push((slot, row));
            }
        }
    }

    let mut updated = 0;
    for (slot, mut row) in pending {
        let key = match (&row[w_id], &row[d_id]) {
            (Datum::UInt8(warehouse), Datum::UInt8(district)) => (*warehouse, *district),
            _ => continue,
        };
        if row[o_id] != Datum::UInt32(oldest.get(&key).copied().unwrap_or(u32::MAX)) {
            continue;
        }
        row[delivery] = Datum::UInt64(delivery_d);
        table.update(&mut txn, slot, &row)?;
        updated += 1;
    }
    manager.commit(txn, || {})?;
    tracing::debug!(updated, "delivery pass");
    Ok(updated)
}

//! Purpose: Library crate behind the `blockflight` snapshot-export server.
//! Exports: `core` (block store, transactions, maintenance, errors), `export`
//! (per-block scan pipeline), `api` (service and HTTP client), `order_line` fixture.
//! Role: Shared by the binary and the integration tests.
//! Invariants: Export never mutates storage state; only the compactor and
//! writers change a block's representation.
pub mod api;
pub mod core;
pub mod export;
pub mod order_line;

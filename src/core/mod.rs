// Core modules: in-memory MVCC block store, maintenance, and error modeling.
pub mod block;
pub mod column;
pub mod compactor;
pub mod error;
pub mod gc;
pub mod layout;
pub mod maintenance;
pub mod row;
pub mod table;
pub mod txn;

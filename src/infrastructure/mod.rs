//! Adapters implementing the domain ports.

pub mod clock;
pub mod in_memory;
pub mod insurer;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod row_lock;

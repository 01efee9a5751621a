//! [`RmStore`](crate::rm::store::RmStore) backends.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use self::memory::MemoryStore;
#[cfg(feature = "redb")]
pub use self::redb::RedbStore;

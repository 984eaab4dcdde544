//! # fedfs-cache
//!
//! Key-addressed byte cache used by fedfs content providers to keep local
//! copies of remote or expensive resources.
//!
//! - [`CacheService`] - the contract: put/get/has/remove/remove_recursive
//!   plus [`CacheService::wrap_write`], whose callback fires after commit
//! - [`MemoryCache`] - `Arc`-shared values, copy-on-write appends
//! - [`DiskCache`] - generation-numbered blob files with a JSON index
//!
//! Both backends let readers keep consuming a value after it has been
//! replaced or removed; the old storage is released when the last reader
//! drops.

mod disk;
mod error;
mod memory;
mod service;

pub use disk::DiskCache;
pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
pub use service::{CacheReader, CacheService, CacheWriter, CommitCallback, CommitEvent, CommitInfo};

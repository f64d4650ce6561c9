//! Embedded memory-mapped B+tree key-value store
//!
//! decafdb is a single-file transactional storage engine in the LMDB
//! tradition: copy-on-write pages, two alternating meta pages for atomic
//! durability, MVCC with lock-free readers and a single serialized writer,
//! and a dedicated free DB that delays page reuse until no live snapshot can
//! still see a retired page. A thin cache layer on top stores file-hash
//! records with mark-and-sweep garbage collection.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

mod btree;
pub mod cache;
pub mod cursor;
pub mod env;
pub mod error;
mod freelist;
pub mod io;
pub mod meta;
pub mod page;
pub mod reader;
pub mod txn;

// Re-exports
pub use cache::{Cache, CacheEntry};
pub use cursor::Cursor;
pub use env::{EnvBuilder, EnvFlags, EnvInfo, Environment};
pub use error::{Error, Pgno, Result, TxnId};
pub use meta::Stat;
pub use page::PAGE_SIZE;
pub use txn::{ReadTransaction, Transaction, WriteTransaction};

// Type aliases for common use cases
/// A read-only transaction
pub type RoTxn<'env> = Transaction<'env, txn::Read>;
/// A read-write transaction
pub type RwTxn<'env> = Transaction<'env, txn::Write>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! StrandDB core - append-only time-series storage engine
//!
//! Each series is stored in its own necklace B-tree: a multi-level index
//! where every level is a backward-linked list of fixed-size nodes. All
//! trees share one block store.
//!
//! # Architecture
//!
//! - **Block store**: paged persistence with sequential allocation; blocks
//!   are immutable once written and old blocks may be evicted.
//! - **Compression**: delta-of-delta timestamps and XOR'd values (Gorilla),
//!   bit-packed into the leaf payload.
//! - **Tree**: leaves buffer incoming pairs, superblocks index committed
//!   subtrees through fixed-fanout child descriptors, extents maintain the
//!   open node at each level and promote on overflow.

pub mod blockstore;
pub mod compression;
pub mod tree;

mod error;
mod types;

pub use error::{Result, StrandError};
pub use types::*;

/// StrandDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Block size shared by the store and every tree node (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Superblock fanout: child descriptors per node, and the bound on the
    /// length of every per-level chain
    pub const FANOUT: usize = 64;
}

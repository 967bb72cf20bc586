//! Shared block store
//!
//! Fixed-size pages with sequential address allocation. Blocks are
//! immutable once written; reclaiming space means evicting whole blocks,
//! which readers must tolerate as a hard read error. Many trees share one
//! store through an `Arc` handle.

use crate::config::BLOCK_SIZE;
use crate::{LogicAddr, Result, StrandError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Notification invoked on the writer's thread after a block is visible
pub type PostWriteCallback = Box<dyn Fn(LogicAddr) + Send + Sync>;

/// Paged persistence consumed by every tree
pub trait BlockStore: Send + Sync {
    /// Append one block; `data` must be exactly `BLOCK_SIZE` bytes
    fn append_block(&self, data: &[u8]) -> Result<LogicAddr>;

    /// Read a block back; fails for addresses never written or evicted
    fn read_block(&self, addr: LogicAddr) -> Result<Bytes>;
}

/// Shared handle to a block store
pub type SharedBlockStore = Arc<dyn BlockStore>;

/// In-memory block store
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    on_write: Option<PostWriteCallback>,
}

struct MemStoreInner {
    blocks: HashMap<LogicAddr, Bytes>,
    next_addr: LogicAddr,
}

impl MemStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Create an empty store with a post-write callback
    pub fn with_callback(on_write: PostWriteCallback) -> Arc<Self> {
        Self::build(Some(on_write))
    }

    fn build(on_write: Option<PostWriteCallback>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MemStoreInner {
                blocks: HashMap::new(),
                next_addr: 0,
            }),
            on_write,
        })
    }

    /// Drop a block to reclaim space. Appends never need evicted blocks;
    /// scans descending through one fail with `BlockNotFound`.
    pub fn evict(&self, addr: LogicAddr) -> bool {
        self.inner.lock().blocks.remove(&addr).is_some()
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemStore {
    fn append_block(&self, data: &[u8]) -> Result<LogicAddr> {
        if data.len() != BLOCK_SIZE {
            return Err(StrandError::InvalidArgument(format!(
                "block must be {} bytes, got {}",
                BLOCK_SIZE,
                data.len()
            )));
        }

        let addr = {
            let mut inner = self.inner.lock();
            let addr = inner.next_addr;
            inner.next_addr += 1;
            inner.blocks.insert(addr, Bytes::copy_from_slice(data));
            addr
        };

        // Callback runs outside the lock, on the writer's thread
        if let Some(cb) = &self.on_write {
            cb(addr);
        }

        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Bytes> {
        self.inner
            .lock()
            .blocks
            .get(&addr)
            .cloned()
            .ok_or(StrandError::BlockNotFound(addr))
    }
}

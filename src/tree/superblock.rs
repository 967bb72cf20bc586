//! Superblock nodes
//!
//! A superblock indexes up to `FANOUT` committed child nodes one level
//! below it. On disk the descriptor area always holds `FANOUT` slots,
//! zero-padded past the child count, so every node body has the same size.

use super::{
    fetch_block, seal_block, verify_checksum, ChildRef, CommonHeader, NodeKind,
    CHILD_REF_SIZE, COMMON_HEADER_SIZE,
};
use crate::blockstore::SharedBlockStore;
use crate::compression::Aggregates;
use crate::config::{BLOCK_SIZE, FANOUT};
use crate::{AppendOutcome, LogicAddr, ParamId, Result, StrandError};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use tracing::debug;

fn fold_children(children: &[ChildRef]) -> Aggregates {
    let mut agg = Aggregates::empty();
    for child in children {
        agg.count += child.count;
        agg.ts_min = agg.ts_min.min(child.ts_min);
        agg.ts_max = agg.ts_max.max(child.ts_max);
        agg.v_min = agg.v_min.min(child.v_min);
        agg.v_max = agg.v_max.max(child.v_max);
        agg.sum += child.sum;
    }
    agg
}

/// Open, mutable superblock
pub struct SuperblockBuilder {
    id: ParamId,
    level: u8,
    prev: LogicAddr,
    children: Vec<ChildRef>,
}

impl SuperblockBuilder {
    /// Create an empty builder at `level` (1 or above), chained to `prev`
    pub fn new(id: ParamId, level: u8, prev: LogicAddr) -> Self {
        debug_assert!(level >= 1);
        Self {
            id,
            level,
            prev,
            children: Vec::with_capacity(FANOUT),
        }
    }

    /// Append one child descriptor
    ///
    /// A descriptor from the wrong level or series, or one that moves
    /// backwards in time, signals corruption rather than a full node.
    pub fn append(&mut self, child: &ChildRef) -> Result<AppendOutcome> {
        if self.children.len() == FANOUT {
            return Ok(AppendOutcome::Full);
        }

        if child.level + 1 != self.level {
            return Err(StrandError::Corruption(format!(
                "level {} descriptor appended to a level {} superblock",
                child.level, self.level
            )));
        }
        if child.id != self.id {
            return Err(StrandError::Corruption(format!(
                "descriptor for series {} appended to a tree of series {}",
                child.id, self.id
            )));
        }
        if let Some(last) = self.children.last() {
            if child.ts_min < last.ts_max {
                return Err(StrandError::Corruption(format!(
                    "descriptor time range regresses: {} < {}",
                    child.ts_min, last.ts_max
                )));
            }
        }

        self.children.push(*child);
        Ok(AppendOutcome::Ok)
    }

    /// Number of children so far
    pub fn nchildren(&self) -> usize {
        self.children.len()
    }

    /// Check if no child was appended yet
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Address of the previous superblock in this chain
    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    /// Serialize into the block store, spending the builder
    pub fn commit(self, bstore: &SharedBlockStore) -> Result<(LogicAddr, ChildRef)> {
        if self.children.is_empty() {
            return Err(StrandError::Internal("commit of an empty superblock".into()));
        }

        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        CommonHeader::new(
            NodeKind::Inner,
            self.level,
            self.id,
            self.prev,
            self.children.len() as u32,
        )
        .write_to(&mut buf);

        for child in &self.children {
            child.write_to(&mut buf);
        }
        // Unused descriptor slots stay zeroed
        buf.resize(COMMON_HEADER_SIZE + FANOUT * CHILD_REF_SIZE, 0);

        let block = seal_block(buf)?;
        let addr = bstore.append_block(&block)?;
        debug!(
            id = self.id,
            addr,
            level = self.level,
            children = self.children.len(),
            "committed superblock"
        );

        let agg = fold_children(&self.children);
        Ok((addr, ChildRef::from_aggregates(self.id, self.level, addr, &agg)))
    }
}

/// Committed, immutable superblock
#[derive(Debug)]
pub struct Superblock {
    id: ParamId,
    level: u8,
    prev: LogicAddr,
    children: Vec<ChildRef>,
}

impl Superblock {
    /// Rehydrate a committed superblock
    pub fn load(bstore: &SharedBlockStore, addr: LogicAddr) -> Result<Self> {
        let data = fetch_block(bstore, addr)?;
        let mut cursor = Cursor::new(data.as_ref());
        let header = CommonHeader::read_from(&mut cursor)?;
        Self::from_block(header, &data)
    }

    pub(crate) fn from_block(header: CommonHeader, data: &Bytes) -> Result<Self> {
        if header.kind != NodeKind::Inner {
            return Err(StrandError::Corruption("expected a superblock node".into()));
        }
        if header.level == 0 {
            return Err(StrandError::Corruption(
                "superblock node tagged with level 0".into(),
            ));
        }
        if header.count as usize > FANOUT {
            return Err(StrandError::Corruption(format!(
                "superblock claims {} children, fanout is {}",
                header.count, FANOUT
            )));
        }

        let body_len = COMMON_HEADER_SIZE + FANOUT * CHILD_REF_SIZE;
        verify_checksum(data, body_len)?;

        let mut cursor = Cursor::new(data.as_ref());
        cursor.set_position(COMMON_HEADER_SIZE as u64);
        let children = (0..header.count)
            .map(|_| ChildRef::read_from(&mut cursor))
            .collect();

        Ok(Self {
            id: header.id,
            level: header.level,
            prev: header.prev,
            children,
        })
    }

    /// Series id
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Level of this node
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Address of the previous superblock in this chain
    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    /// Child descriptors in insertion order
    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    pub(crate) fn aggregates(&self) -> Aggregates {
        fold_children(&self.children)
    }

    pub(crate) fn child_ref(&self, addr: LogicAddr) -> ChildRef {
        ChildRef::from_aggregates(self.id, self.level, addr, &self.aggregates())
    }
}

//! Necklace B-tree
//!
//! A tree has no single root. Each level is a backward-linked chain of
//! fixed-size nodes headed by the currently open builder; a node links to
//! its predecessor at the same level and chains never cross a subtree
//! boundary. Superblocks reference committed child nodes through fixed-size
//! descriptors carrying precomputed aggregates, so range scans prune whole
//! subtrees without touching them.
//!
//! Only the head of each chain is needed to keep appending, which is what
//! lets the block store reclaim old blocks underneath live trees.

mod extent;
mod leaf;
mod scan;
mod superblock;

pub use extent::{check_extent, Extent, RepairStatus, SeriesTree};
pub use leaf::{Leaf, LeafBuilder, LoadMode};
pub use scan::{ScanIter, ScanStatus};
pub use superblock::{Superblock, SuperblockBuilder};

use crate::compression::Aggregates;
use crate::config::{BLOCK_SIZE, FANOUT};
use crate::{LogicAddr, ParamId, Result, StrandError, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::blockstore::SharedBlockStore;

/// Magic prefix of every node block
pub const BLOCK_MAGIC: &[u8; 4] = b"STRD";

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

pub(crate) const CHECKSUM_SIZE: usize = 4;
pub(crate) const COMMON_HEADER_SIZE: usize = 28;
pub(crate) const LEAF_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 44;
pub(crate) const CHILD_REF_SIZE: usize = 63;

/// Codec budget for one leaf payload
pub(crate) const LEAF_PAYLOAD_CAP: usize = BLOCK_SIZE - LEAF_HEADER_SIZE - CHECKSUM_SIZE;

// A full superblock body must fit one block alongside header and checksum
const _: () = assert!(COMMON_HEADER_SIZE + FANOUT * CHILD_REF_SIZE + CHECKSUM_SIZE <= BLOCK_SIZE);

/// Node kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Compressed run of pairs
    Leaf,
    /// Child descriptors
    Inner,
}

impl NodeKind {
    fn to_u8(self) -> u8 {
        match self {
            NodeKind::Leaf => 0,
            NodeKind::Inner => 1,
        }
    }

    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(NodeKind::Leaf),
            1 => Ok(NodeKind::Inner),
            other => Err(StrandError::Corruption(format!(
                "unknown node kind tag {}",
                other
            ))),
        }
    }
}

/// Header fields shared by both node kinds
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommonHeader {
    pub version: u16,
    pub kind: NodeKind,
    pub level: u8,
    pub id: ParamId,
    pub prev: LogicAddr,
    pub count: u32,
}

impl CommonHeader {
    pub fn new(kind: NodeKind, level: u8, id: ParamId, prev: LogicAddr, count: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            kind,
            level,
            id,
            prev,
            count,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(BLOCK_MAGIC);
        buf.put_u16_le(self.version);
        buf.put_u8(self.kind.to_u8());
        buf.put_u8(self.level);
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.prev);
        buf.put_u32_le(self.count);
    }

    pub fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if &magic != BLOCK_MAGIC {
            return Err(StrandError::Corruption("bad block magic".into()));
        }

        let version = cursor.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(StrandError::Corruption(format!(
                "unsupported format version {}",
                version
            )));
        }

        Ok(Self {
            version,
            kind: NodeKind::from_u8(cursor.get_u8())?,
            level: cursor.get_u8(),
            id: cursor.get_u64_le(),
            prev: cursor.get_u64_le(),
            count: cursor.get_u32_le(),
        })
    }
}

/// Descriptor of one committed child node, stored inside a superblock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildRef {
    /// Format version of the child
    pub version: u16,
    /// Level of the child node
    pub level: u8,
    /// Elements in the child's subtree
    pub count: u32,
    /// Series id
    pub id: ParamId,
    /// Smallest timestamp in the subtree
    pub ts_min: Timestamp,
    /// Largest timestamp in the subtree
    pub ts_max: Timestamp,
    /// Address of the child node
    pub addr: LogicAddr,
    /// Smallest value in the subtree
    pub v_min: f64,
    /// Largest value in the subtree
    pub v_max: f64,
    /// Sum of values in the subtree
    pub sum: f64,
}

impl ChildRef {
    /// Build a descriptor for a node just committed at `addr`
    pub(crate) fn from_aggregates(
        id: ParamId,
        level: u8,
        addr: LogicAddr,
        agg: &Aggregates,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            level,
            count: agg.count,
            id,
            ts_min: agg.ts_min,
            ts_max: agg.ts_max,
            addr,
            v_min: agg.v_min,
            v_max: agg.v_max,
            sum: agg.sum,
        }
    }

    /// Check if the subtree may contain timestamps in `[lo, hi]`
    pub fn overlaps(&self, lo: Timestamp, hi: Timestamp) -> bool {
        self.ts_min <= hi && self.ts_max >= lo
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.version);
        buf.put_u8(self.level);
        buf.put_u32_le(self.count);
        buf.put_u64_le(self.id);
        buf.put_i64_le(self.ts_min);
        buf.put_i64_le(self.ts_max);
        buf.put_u64_le(self.addr);
        buf.put_f64_le(self.v_min);
        buf.put_f64_le(self.v_max);
        buf.put_f64_le(self.sum);
    }

    pub(crate) fn read_from(cursor: &mut Cursor<&[u8]>) -> Self {
        Self {
            version: cursor.get_u16_le(),
            level: cursor.get_u8(),
            count: cursor.get_u32_le(),
            id: cursor.get_u64_le(),
            ts_min: cursor.get_i64_le(),
            ts_max: cursor.get_i64_le(),
            addr: cursor.get_u64_le(),
            v_min: cursor.get_f64_le(),
            v_max: cursor.get_f64_le(),
            sum: cursor.get_f64_le(),
        }
    }
}

/// Append the checksum and pad the body out to one block
pub(crate) fn seal_block(mut buf: BytesMut) -> Result<Bytes> {
    if buf.len() + CHECKSUM_SIZE > BLOCK_SIZE {
        return Err(StrandError::Internal(format!(
            "node body of {} bytes does not fit a block",
            buf.len()
        )));
    }

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.resize(BLOCK_SIZE, 0);
    Ok(buf.freeze())
}

/// Verify the checksum covering `data[..body_len]`
pub(crate) fn verify_checksum(data: &[u8], body_len: usize) -> Result<()> {
    if body_len + CHECKSUM_SIZE > data.len() {
        return Err(StrandError::Corruption("node body overruns block".into()));
    }

    let expected = {
        let mut cursor = Cursor::new(&data[body_len..]);
        cursor.get_u32_le()
    };
    let actual = crc32fast::hash(&data[..body_len]);

    if expected != actual {
        return Err(StrandError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Fetch one block and check its size
pub(crate) fn fetch_block(bstore: &SharedBlockStore, addr: LogicAddr) -> Result<Bytes> {
    let data = bstore.read_block(addr)?;
    if data.len() != BLOCK_SIZE {
        return Err(StrandError::Corruption(format!(
            "block {} has size {}, expected {}",
            addr,
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(data)
}

/// A committed node of either kind
#[derive(Debug)]
pub enum Node {
    Leaf(Leaf),
    Inner(Superblock),
}

/// Load a committed node, dispatching on its kind tag
pub fn load_node(bstore: &SharedBlockStore, addr: LogicAddr) -> Result<Node> {
    let data = fetch_block(bstore, addr)?;
    let mut cursor = Cursor::new(data.as_ref());
    let header = CommonHeader::read_from(&mut cursor)?;

    match header.kind {
        NodeKind::Leaf => Ok(Node::Leaf(Leaf::from_block(header, &data, LoadMode::Full)?)),
        NodeKind::Inner => Ok(Node::Inner(Superblock::from_block(header, &data)?)),
    }
}

impl Node {
    /// Series id of the node
    pub fn id(&self) -> ParamId {
        match self {
            Node::Leaf(leaf) => leaf.id(),
            Node::Inner(sb) => sb.id(),
        }
    }

    /// Level of the node
    pub fn level(&self) -> u8 {
        match self {
            Node::Leaf(_) => 0,
            Node::Inner(sb) => sb.level(),
        }
    }

    /// Previous node at the same level in the same extent
    pub fn prev_addr(&self) -> LogicAddr {
        match self {
            Node::Leaf(leaf) => leaf.prev_addr(),
            Node::Inner(sb) => sb.prev_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_ref_roundtrip() {
        let child = ChildRef {
            version: FORMAT_VERSION,
            level: 3,
            count: 12345,
            id: 42,
            ts_min: -5,
            ts_max: 1_000_000,
            addr: 77,
            v_min: -2.5,
            v_max: 99.25,
            sum: 1234.125,
        };

        let mut buf = BytesMut::new();
        child.write_to(&mut buf);
        assert_eq!(buf.len(), CHILD_REF_SIZE);

        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        assert_eq!(ChildRef::read_from(&mut cursor), child);
    }

    #[test]
    fn test_common_header_roundtrip() {
        let header = CommonHeader::new(NodeKind::Inner, 2, 42, 17, 9);

        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), COMMON_HEADER_SIZE);

        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        let parsed = CommonHeader::read_from(&mut cursor).unwrap();
        assert_eq!(parsed.kind, NodeKind::Inner);
        assert_eq!(parsed.level, 2);
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.prev, 17);
        assert_eq!(parsed.count, 9);
    }

    #[test]
    fn test_seal_and_verify() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"some node body");
        let body_len = buf.len();

        let block = seal_block(buf).unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        verify_checksum(&block, body_len).unwrap();
    }

    #[test]
    fn test_corrupted_block_fails_checksum() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"some node body");
        let body_len = buf.len();

        let block = seal_block(buf).unwrap();
        let mut corrupted = block.to_vec();
        corrupted[3] ^= 0xFF;

        match verify_checksum(&corrupted, body_len) {
            Err(StrandError::ChecksumMismatch { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let data = vec![0u8; BLOCK_SIZE];
        let mut cursor = Cursor::new(data.as_slice());
        assert!(CommonHeader::read_from(&mut cursor).is_err());
    }
}

//! Leaf nodes
//!
//! A leaf buffers one compressed run of pairs. It is never split: when the
//! codec reports that the payload budget is spent, the leaf is committed
//! and a fresh builder takes over.

use super::{
    fetch_block, seal_block, verify_checksum, ChildRef, CommonHeader, NodeKind,
    COMMON_HEADER_SIZE, LEAF_HEADER_SIZE, LEAF_PAYLOAD_CAP,
};
use crate::blockstore::SharedBlockStore;
use crate::compression::{Aggregates, GorillaDecoder, GorillaEncoder};
use crate::config::BLOCK_SIZE;
use crate::{AppendOutcome, LogicAddr, ParamId, Result, StrandError, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use tracing::debug;

/// How much of a committed leaf to rehydrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Header fields only; `read_all` is unavailable
    HeaderOnly,
    /// Header and payload
    Full,
}

/// Open, mutable leaf
///
/// Consumed by `commit`; a spent builder cannot be appended to.
pub struct LeafBuilder {
    id: ParamId,
    prev: LogicAddr,
    encoder: GorillaEncoder,
}

impl LeafBuilder {
    /// Create an empty builder for series `id`, chained to `prev`
    pub fn new(id: ParamId, prev: LogicAddr) -> Self {
        Self {
            id,
            prev,
            encoder: GorillaEncoder::bounded(LEAF_PAYLOAD_CAP),
        }
    }

    /// Append one pair
    pub fn append(&mut self, ts: Timestamp, value: f64) -> AppendOutcome {
        self.encoder.put(ts, value)
    }

    /// Number of buffered pairs
    pub fn nelements(&self) -> u32 {
        self.encoder.count()
    }

    /// Check if no pair was buffered yet
    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    /// Address of the previous leaf in this chain
    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    /// Largest buffered timestamp, if any pair was accepted
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        (!self.is_empty()).then(|| self.encoder.aggregates().ts_max)
    }

    /// Decode the pairs buffered so far
    pub fn read_all(&self) -> Result<Vec<(Timestamp, f64)>> {
        let pending = self.encoder.pending_bytes();
        let mut decoder = GorillaDecoder::new(&pending, self.encoder.count() as usize);
        decoder.decode_all()
    }

    /// Serialize into the block store, spending the builder
    pub fn commit(self, bstore: &SharedBlockStore) -> Result<(LogicAddr, ChildRef)> {
        if self.encoder.is_empty() {
            return Err(StrandError::Internal("commit of an empty leaf".into()));
        }

        let id = self.id;
        let prev = self.prev;
        let run = self.encoder.finish();
        let agg = run.aggregates;

        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        CommonHeader::new(NodeKind::Leaf, 0, id, prev, agg.count).write_to(&mut buf);
        buf.put_i64_le(agg.ts_min);
        buf.put_i64_le(agg.ts_max);
        buf.put_f64_le(agg.v_min);
        buf.put_f64_le(agg.v_max);
        buf.put_f64_le(agg.sum);
        buf.put_u32_le(run.data.len() as u32);
        buf.put_slice(&run.data);

        let block = seal_block(buf)?;
        let addr = bstore.append_block(&block)?;
        debug!(id, addr, count = agg.count, "committed leaf");

        Ok((addr, ChildRef::from_aggregates(id, 0, addr, &agg)))
    }
}

/// Committed, immutable leaf
#[derive(Debug)]
pub struct Leaf {
    id: ParamId,
    prev: LogicAddr,
    aggregates: Aggregates,
    payload: Option<Bytes>,
}

impl Leaf {
    /// Rehydrate a committed leaf
    pub fn load(bstore: &SharedBlockStore, addr: LogicAddr, mode: LoadMode) -> Result<Self> {
        let data = fetch_block(bstore, addr)?;
        let mut cursor = Cursor::new(data.as_ref());
        let header = CommonHeader::read_from(&mut cursor)?;
        Self::from_block(header, &data, mode)
    }

    pub(crate) fn from_block(header: CommonHeader, data: &Bytes, mode: LoadMode) -> Result<Self> {
        if header.kind != NodeKind::Leaf {
            return Err(StrandError::Corruption("expected a leaf node".into()));
        }
        if header.level != 0 {
            return Err(StrandError::Corruption(format!(
                "leaf node tagged with level {}",
                header.level
            )));
        }

        let mut cursor = Cursor::new(data.as_ref());
        cursor.set_position(COMMON_HEADER_SIZE as u64);
        let ts_min = cursor.get_i64_le();
        let ts_max = cursor.get_i64_le();
        let v_min = cursor.get_f64_le();
        let v_max = cursor.get_f64_le();
        let sum = cursor.get_f64_le();
        let payload_len = cursor.get_u32_le() as usize;

        let body_len = LEAF_HEADER_SIZE + payload_len;
        verify_checksum(data, body_len)?;

        let payload = match mode {
            LoadMode::Full => Some(data.slice(LEAF_HEADER_SIZE..body_len)),
            LoadMode::HeaderOnly => None,
        };

        Ok(Self {
            id: header.id,
            prev: header.prev,
            aggregates: Aggregates {
                count: header.count,
                ts_min,
                ts_max,
                v_min,
                v_max,
                sum,
            },
            payload,
        })
    }

    /// Series id
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Number of stored pairs
    pub fn nelements(&self) -> u32 {
        self.aggregates.count
    }

    /// Smallest and largest stored timestamp
    pub fn timestamps(&self) -> (Timestamp, Timestamp) {
        (self.aggregates.ts_min, self.aggregates.ts_max)
    }

    /// Address of the previous leaf in this chain
    pub fn prev_addr(&self) -> LogicAddr {
        self.prev
    }

    pub(crate) fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub(crate) fn child_ref(&self, addr: LogicAddr) -> ChildRef {
        ChildRef::from_aggregates(self.id, 0, addr, &self.aggregates)
    }

    /// Decode the entire payload
    pub fn read_all(&self) -> Result<Vec<(Timestamp, f64)>> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| StrandError::Internal("leaf loaded without payload".into()))?;
        let mut decoder = GorillaDecoder::new(payload, self.aggregates.count as usize);
        decoder.decode_all()
    }
}

//! Range scans
//!
//! The committed chains partition a tree's data by promotion age: the top
//! extent's chain holds the oldest subtrees, level 0 the newest leaves,
//! and the open level-0 builder the newest pairs of all. A forward scan
//! therefore visits chains top-down and the pending buffer last; a
//! backward scan reverses that order. Superblock children are pruned by
//! descriptor time ranges before any descent.

use super::{load_node, Node};
use crate::blockstore::SharedBlockStore;
use crate::config::FANOUT;
use crate::{LogicAddr, ParamId, Result, StrandError, Timestamp, EMPTY_ADDR};
use std::collections::VecDeque;

/// Result of one chunked read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Output buffer filled exactly; more data may be pending
    Success,
    /// Scan exhausted; this chunk carries the final tail (possibly empty)
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanDir {
    Fwd,
    Bwd,
}

enum Source {
    /// Head of one per-level chain
    Chain(LogicAddr),
    /// Pending builder pairs, already filtered and ordered
    Memory(Vec<(Timestamp, f64)>),
}

struct Frame {
    addrs: Vec<LogicAddr>,
    next: usize,
}

/// Chunked iterator over one time range of one series
pub struct ScanIter {
    bstore: SharedBlockStore,
    id: ParamId,
    dir: ScanDir,
    /// Inclusive window bounds
    lo: Timestamp,
    hi: Timestamp,
    sources: VecDeque<Source>,
    frames: Vec<Frame>,
    current: Vec<(Timestamp, f64)>,
    pos: usize,
}

impl ScanIter {
    pub(crate) fn new(
        bstore: SharedBlockStore,
        id: ParamId,
        start: Timestamp,
        stop: Timestamp,
        heads: Vec<LogicAddr>,
        pending: Vec<(Timestamp, f64)>,
    ) -> Self {
        // Forward covers [start, stop), backward covers (stop, start].
        // Both bounds are kept inclusive; an empty request yields no
        // window at all.
        let window = if start < stop {
            Some((ScanDir::Fwd, start, stop - 1))
        } else if start > stop {
            Some((ScanDir::Bwd, stop + 1, start))
        } else {
            None
        };

        let (dir, lo, hi) = window.unwrap_or((ScanDir::Fwd, 0, -1));

        let mut sources = VecDeque::new();
        if window.is_some() {
            let mut mem: Vec<(Timestamp, f64)> = pending
                .into_iter()
                .filter(|&(ts, _)| ts >= lo && ts <= hi)
                .collect();

            match dir {
                ScanDir::Fwd => {
                    for &head in heads.iter().rev() {
                        if head != EMPTY_ADDR {
                            sources.push_back(Source::Chain(head));
                        }
                    }
                    if !mem.is_empty() {
                        sources.push_back(Source::Memory(mem));
                    }
                }
                ScanDir::Bwd => {
                    if !mem.is_empty() {
                        mem.reverse();
                        sources.push_back(Source::Memory(mem));
                    }
                    for &head in &heads {
                        if head != EMPTY_ADDR {
                            sources.push_back(Source::Chain(head));
                        }
                    }
                }
            }
        }

        Self {
            bstore,
            id,
            dir,
            lo,
            hi,
            sources,
            frames: Vec::new(),
            current: Vec::new(),
            pos: 0,
        }
    }

    /// Read up to `ts_out.len()` pairs.
    ///
    /// `Success` is returned only for an exactly filled buffer; `NoData`
    /// means the scan is exhausted and the returned count, possibly zero,
    /// is the tail. Successive calls yield one strictly ordered sequence
    /// with no duplicates or gaps.
    pub fn read(
        &mut self,
        ts_out: &mut [Timestamp],
        val_out: &mut [f64],
    ) -> Result<(ScanStatus, usize)> {
        if ts_out.is_empty() || ts_out.len() != val_out.len() {
            return Err(StrandError::InvalidArgument(
                "output buffers must be non-empty and equally sized".into(),
            ));
        }

        let mut n = 0;
        while n < ts_out.len() {
            if self.pos < self.current.len() {
                let take = (ts_out.len() - n).min(self.current.len() - self.pos);
                for k in 0..take {
                    let (ts, value) = self.current[self.pos + k];
                    ts_out[n + k] = ts;
                    val_out[n + k] = value;
                }
                self.pos += take;
                n += take;
                continue;
            }

            if !self.advance()? {
                return Ok((ScanStatus::NoData, n));
            }
        }

        Ok((ScanStatus::Success, n))
    }

    /// Drain the remainder into vectors
    pub fn collect_remaining(&mut self) -> Result<(Vec<Timestamp>, Vec<f64>)> {
        let mut ts = Vec::new();
        let mut values = Vec::new();
        let mut ts_buf = [0i64; 1024];
        let mut val_buf = [0f64; 1024];

        loop {
            let (status, n) = self.read(&mut ts_buf, &mut val_buf)?;
            ts.extend_from_slice(&ts_buf[..n]);
            values.extend_from_slice(&val_buf[..n]);
            if status == ScanStatus::NoData {
                return Ok((ts, values));
            }
        }
    }

    /// Move to the next non-empty run of decoded pairs
    fn advance(&mut self) -> Result<bool> {
        loop {
            while let Some(frame) = self.frames.last_mut() {
                if frame.next >= frame.addrs.len() {
                    self.frames.pop();
                    continue;
                }
                let addr = frame.addrs[frame.next];
                frame.next += 1;

                match load_node(&self.bstore, addr)? {
                    Node::Leaf(leaf) => {
                        if leaf.id() != self.id {
                            return Err(StrandError::Corruption(format!(
                                "leaf {} belongs to series {}",
                                addr,
                                leaf.id()
                            )));
                        }
                        let pairs = self.filter_pairs(leaf.read_all()?);
                        if !pairs.is_empty() {
                            self.current = pairs;
                            self.pos = 0;
                            return Ok(true);
                        }
                    }
                    Node::Inner(sb) => {
                        if sb.id() != self.id {
                            return Err(StrandError::Corruption(format!(
                                "superblock {} belongs to series {}",
                                addr,
                                sb.id()
                            )));
                        }
                        let mut addrs: Vec<LogicAddr> = sb
                            .children()
                            .iter()
                            .filter(|child| child.overlaps(self.lo, self.hi))
                            .map(|child| child.addr)
                            .collect();
                        if self.dir == ScanDir::Bwd {
                            addrs.reverse();
                        }
                        if !addrs.is_empty() {
                            self.frames.push(Frame { addrs, next: 0 });
                        }
                    }
                }
            }

            match self.sources.pop_front() {
                None => return Ok(false),
                Some(Source::Memory(pairs)) => {
                    if !pairs.is_empty() {
                        self.current = pairs;
                        self.pos = 0;
                        return Ok(true);
                    }
                }
                Some(Source::Chain(head)) => {
                    let addrs = self.walk_chain(head)?;
                    if !addrs.is_empty() {
                        self.frames.push(Frame { addrs, next: 0 });
                    }
                }
            }
        }
    }

    /// Materialize one chain in visit order
    fn walk_chain(&self, head: LogicAddr) -> Result<Vec<LogicAddr>> {
        let mut addrs = Vec::new();
        let mut cursor = head;

        while cursor != EMPTY_ADDR {
            if addrs.len() >= FANOUT {
                return Err(StrandError::Corruption(
                    "chain exceeds fanout; cyclic or cross-subtree link".into(),
                ));
            }
            let node = load_node(&self.bstore, cursor)?;
            if node.id() != self.id {
                return Err(StrandError::Corruption(format!(
                    "node {} belongs to series {}",
                    cursor,
                    node.id()
                )));
            }
            addrs.push(cursor);
            cursor = node.prev_addr();
        }

        // The walk is newest-first, which is backward visit order
        if self.dir == ScanDir::Fwd {
            addrs.reverse();
        }
        Ok(addrs)
    }

    fn filter_pairs(&self, pairs: Vec<(Timestamp, f64)>) -> Vec<(Timestamp, f64)> {
        let mut kept: Vec<(Timestamp, f64)> = pairs
            .into_iter()
            .filter(|&(ts, _)| ts >= self.lo && ts <= self.hi)
            .collect();
        if self.dir == ScanDir::Bwd {
            kept.reverse();
        }
        kept
    }
}

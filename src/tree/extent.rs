//! Extents and the per-series tree
//!
//! An extent is one level of the necklace: the head of that level's
//! backward chain, the position inside the current chain, and the open
//! builder. The tree owns the extents bottom-up and routes promotions:
//! committing a node at level N hands its descriptor to level N+1,
//! growing the tree when no such level exists yet.
//!
//! A chain wraps after `FANOUT` commits. The wrapped chain is exactly the
//! child set of one parent node, so the next node at that level starts a
//! new chain with no link to the previous subtree.

use super::scan::ScanIter;
use super::{load_node, ChildRef, LeafBuilder, Node, SuperblockBuilder};
use crate::blockstore::SharedBlockStore;
use crate::compression::Aggregates;
use crate::config::FANOUT;
use crate::{
    AppendOutcome, LogicAddr, ParamId, Result, StrandError, Timestamp, EMPTY_ADDR,
};
use std::mem;
use tracing::{debug, info, warn};

/// Classification of a persisted head list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// The tree was closed cleanly (or never held data)
    Ok,
    /// Mid-fill snapshot; data still in open builders at crash time is lost
    Repair,
    /// The list matches no reachable append or close state
    Broken,
}

pub(crate) enum NodeBuilder {
    Leaf(LeafBuilder),
    Inner(SuperblockBuilder),
}

impl NodeBuilder {
    fn fresh(id: ParamId, level: u8, prev: LogicAddr) -> Self {
        if level == 0 {
            NodeBuilder::Leaf(LeafBuilder::new(id, prev))
        } else {
            NodeBuilder::Inner(SuperblockBuilder::new(id, level, prev))
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            NodeBuilder::Leaf(b) => b.is_empty(),
            NodeBuilder::Inner(b) => b.is_empty(),
        }
    }
}

/// One level of the necklace
pub struct Extent {
    id: ParamId,
    level: u8,
    head: LogicAddr,
    fanout: usize,
    builder: NodeBuilder,
}

impl Extent {
    fn new(id: ParamId, level: u8) -> Self {
        Self {
            id,
            level,
            head: EMPTY_ADDR,
            fanout: 0,
            builder: NodeBuilder::fresh(id, level, EMPTY_ADDR),
        }
    }

    /// Level of this extent
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Head of this level's chain, `EMPTY_ADDR` when none
    pub fn head_addr(&self) -> LogicAddr {
        self.head
    }

    /// Nodes committed in the current chain
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Commit the open builder, wrap the chain at `FANOUT`, link a fresh
    /// builder to the new head
    fn commit_builder(&mut self, bstore: &SharedBlockStore) -> Result<ChildRef> {
        let spent = mem::replace(
            &mut self.builder,
            NodeBuilder::fresh(self.id, self.level, EMPTY_ADDR),
        );
        let (addr, child) = match spent {
            NodeBuilder::Leaf(b) => b.commit(bstore)?,
            NodeBuilder::Inner(b) => b.commit(bstore)?,
        };

        self.fanout += 1;
        if self.fanout == FANOUT {
            self.fanout = 0;
            self.head = EMPTY_ADDR;
        } else {
            self.head = addr;
        }
        self.builder = NodeBuilder::fresh(self.id, self.level, self.head);

        Ok(child)
    }
}

/// Append-only tree for one series: the ordered stack of extents
pub struct SeriesTree {
    id: ParamId,
    bstore: SharedBlockStore,
    extents: Vec<Extent>,
    rescue: Vec<LogicAddr>,
    initialized: bool,
    closed: bool,
}

impl SeriesTree {
    /// Construct uninitialized from a persisted head list (empty for a new
    /// series)
    pub fn new(id: ParamId, addr_list: Vec<LogicAddr>, bstore: SharedBlockStore) -> Self {
        Self {
            id,
            bstore,
            extents: Vec::new(),
            rescue: addr_list,
            initialized: false,
            closed: false,
        }
    }

    /// Series id
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Classify a persisted head list without touching the store.
    ///
    /// While appends are running the highest extent never has a committed
    /// chain (it is created by the first promotion into it, and its own
    /// first commit immediately creates the level above), so a mid-fill
    /// snapshot always ends with `EMPTY_ADDR`. A clean close promotes every
    /// lower chain into a committed parent and reports only the top
    /// address. The single-entry all-empty list is the close of a tree
    /// that never held data; a longer all-empty list is the wrap moment of
    /// a mid-fill snapshot. Any other shape is unreachable.
    pub fn repair_status(addr_list: &[LogicAddr]) -> RepairStatus {
        if addr_list.is_empty() {
            return RepairStatus::Ok;
        }

        let nroots = addr_list.iter().filter(|&&a| a != EMPTY_ADDR).count();
        match addr_list.last() {
            Some(&last) if last != EMPTY_ADDR => {
                if nroots == 1 {
                    RepairStatus::Ok
                } else {
                    RepairStatus::Broken
                }
            }
            _ if nroots == 0 && addr_list.len() == 1 => RepairStatus::Ok,
            _ => RepairStatus::Repair,
        }
    }

    /// Rehydrate the extents from the head list. Idempotent; `append`
    /// self-initializes, but a reopened tree must be initialized before
    /// `search`.
    pub fn force_init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        if self.rescue.is_empty() {
            self.extents.push(Extent::new(self.id, 0));
            self.initialized = true;
            return Ok(());
        }

        let status = Self::repair_status(&self.rescue);
        if status == RepairStatus::Broken {
            return Err(StrandError::Corruption(
                "head list matches no valid tree state".into(),
            ));
        }
        info!(id = self.id, levels = self.rescue.len(), ?status, "opening tree");
        if status == RepairStatus::Repair {
            warn!(
                id = self.id,
                "reopening from a mid-fill snapshot; unpromoted buffers are lost"
            );
        }

        // Walk every persisted chain, validating links and tags
        let rescue = self.rescue.clone();
        let mut chains: Vec<Vec<ChildRef>> = Vec::with_capacity(rescue.len());
        for (level, &head) in rescue.iter().enumerate() {
            chains.push(self.collect_chain(head, level as u8)?);
        }

        for (level, &head) in rescue.iter().enumerate() {
            let mut extent = Extent::new(self.id, level as u8);
            if head != EMPTY_ADDR {
                extent.head = head;
                extent.fanout = chains[level].len();
                extent.builder = NodeBuilder::fresh(self.id, level as u8, head);
            }
            self.extents.push(extent);
        }

        // Every chain below a future parent commit was promoted in memory
        // only; rebuild those descriptors so the next overflow at each
        // level seals a complete child set.
        for (level, chain) in chains.iter().enumerate() {
            if chain.is_empty() {
                continue;
            }
            if level + 1 == self.extents.len() {
                self.extents.push(Extent::new(self.id, (level + 1) as u8));
            }
            for child in chain.iter().rev() {
                match &mut self.extents[level + 1].builder {
                    NodeBuilder::Inner(b) => match b.append(child)? {
                        AppendOutcome::Ok => {}
                        _ => {
                            return Err(StrandError::Corruption(
                                "rebuilt chain overflows its parent node".into(),
                            ))
                        }
                    },
                    NodeBuilder::Leaf(_) => {
                        return Err(StrandError::Internal(
                            "leaf builder above level 0".into(),
                        ))
                    }
                }
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// Walk one chain newest-first, returning a descriptor per node
    fn collect_chain(&self, head: LogicAddr, level: u8) -> Result<Vec<ChildRef>> {
        let mut chain = Vec::new();
        let mut cursor = head;

        while cursor != EMPTY_ADDR {
            if chain.len() >= FANOUT {
                return Err(StrandError::Corruption(format!(
                    "chain at level {} exceeds fanout; cyclic or cross-subtree link",
                    level
                )));
            }

            let node = load_node(&self.bstore, cursor)?;
            if node.id() != self.id {
                return Err(StrandError::Corruption(format!(
                    "node {} belongs to series {}, expected {}",
                    cursor,
                    node.id(),
                    self.id
                )));
            }
            if node.level() != level {
                return Err(StrandError::Corruption(format!(
                    "node {} has level {}, expected {}",
                    cursor,
                    node.level(),
                    level
                )));
            }

            let child = match &node {
                Node::Leaf(leaf) => leaf.child_ref(cursor),
                Node::Inner(sb) => sb.child_ref(cursor),
            };
            chain.push(child);
            cursor = node.prev_addr();
        }

        Ok(chain)
    }

    /// Append one pair. Returns `true` iff the head list changed, which is
    /// the host's cue to snapshot `roots()`.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<bool> {
        if self.closed {
            return Err(StrandError::TreeClosed);
        }
        self.force_init()?;

        let leaf = match &mut self.extents[0].builder {
            NodeBuilder::Leaf(b) => b,
            NodeBuilder::Inner(_) => {
                return Err(StrandError::Internal("superblock builder at level 0".into()))
            }
        };

        match leaf.append(ts, value) {
            AppendOutcome::Ok => Ok(false),
            AppendOutcome::OutOfOrder => Err(StrandError::OutOfOrderTimestamp {
                last: leaf.last_timestamp().unwrap_or(ts),
                got: ts,
            }),
            AppendOutcome::Full => {
                // The pair passed the ordering check, so it belongs in the
                // successor leaf
                let child = self.commit_at(0)?;
                self.promote(1, child)?;

                match &mut self.extents[0].builder {
                    NodeBuilder::Leaf(b) => match b.append(ts, value) {
                        AppendOutcome::Ok => Ok(true),
                        _ => Err(StrandError::Internal("fresh leaf rejected a pair".into())),
                    },
                    NodeBuilder::Inner(_) => {
                        Err(StrandError::Internal("superblock builder at level 0".into()))
                    }
                }
            }
        }
    }

    fn commit_at(&mut self, level: usize) -> Result<ChildRef> {
        let bstore = self.bstore.clone();
        self.extents[level].commit_builder(&bstore)
    }

    /// Hand a freshly committed node's descriptor to the extent above,
    /// growing the tree when that level does not exist yet
    fn promote(&mut self, level: usize, child: ChildRef) -> Result<()> {
        if self.extents.len() == level {
            debug!(id = self.id, level, "growing tree by one level");
            self.extents.push(Extent::new(self.id, level as u8));
        }

        let outcome = match &mut self.extents[level].builder {
            NodeBuilder::Inner(b) => b.append(&child)?,
            NodeBuilder::Leaf(_) => {
                return Err(StrandError::Internal("leaf builder above level 0".into()))
            }
        };

        match outcome {
            AppendOutcome::Ok => Ok(()),
            AppendOutcome::Full => {
                let parent = self.commit_at(level)?;
                self.promote(level + 1, parent)?;

                match &mut self.extents[level].builder {
                    NodeBuilder::Inner(b) => match b.append(&child)? {
                        AppendOutcome::Ok => Ok(()),
                        _ => Err(StrandError::Internal(
                            "fresh superblock rejected a descriptor".into(),
                        )),
                    },
                    NodeBuilder::Leaf(_) => {
                        Err(StrandError::Internal("leaf builder above level 0".into()))
                    }
                }
            }
            AppendOutcome::OutOfOrder => {
                Err(StrandError::Internal("unexpected append outcome".into()))
            }
        }
    }

    /// Current heads, bottom-up
    pub fn roots(&self) -> Vec<LogicAddr> {
        if !self.initialized {
            return self.rescue.clone();
        }
        self.extents.iter().map(|e| e.head_addr()).collect()
    }

    /// Extents bottom-up, for consistency checking
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Pending pairs of the uncommitted level-0 builder
    pub fn read_all(&self) -> Result<Vec<(Timestamp, f64)>> {
        match self.extents.first() {
            Some(extent) => match &extent.builder {
                NodeBuilder::Leaf(b) => b.read_all(),
                NodeBuilder::Inner(_) => {
                    Err(StrandError::Internal("superblock builder at level 0".into()))
                }
            },
            None => Ok(Vec::new()),
        }
    }

    /// Flush every pending builder bottom-up and seal the tree.
    ///
    /// Each committed builder promotes its descriptor before the parent
    /// commits in turn, so afterwards the top node covers every lower
    /// chain. The returned head list is `EMPTY_ADDR` for all levels below
    /// the top and ends with the last address written.
    pub fn close(&mut self) -> Result<Vec<LogicAddr>> {
        if self.closed {
            return Err(StrandError::TreeClosed);
        }
        self.force_init()?;
        self.closed = true;

        let mut level = 0;
        while level < self.extents.len() {
            if !self.extents[level].builder.is_empty() {
                let child = self.commit_at(level)?;
                if level + 1 < self.extents.len() {
                    self.promote(level + 1, child)?;
                }
            }
            level += 1;
        }

        // Lower chains are now covered by committed parents
        let top = self.extents.len() - 1;
        for extent in &mut self.extents[..top] {
            extent.head = EMPTY_ADDR;
            extent.fanout = 0;
        }

        let roots = self.roots();
        info!(id = self.id, levels = roots.len(), "closed tree");
        Ok(roots)
    }

    /// Range scan; forward iff `start <= stop`. A forward scan covers
    /// `[start, stop)`, a backward scan covers `(stop, start]` delivered in
    /// decreasing order.
    pub fn search(&self, start: Timestamp, stop: Timestamp) -> ScanIter {
        let heads: Vec<LogicAddr> = self.extents.iter().map(|e| e.head_addr()).collect();
        let pending = self.read_all().unwrap_or_default();
        ScanIter::new(self.bstore.clone(), self.id, start, stop, heads, pending)
    }
}

/// Verify invariants along one extent's chain.
///
/// Walks the `prev` links, re-derives every reachable subtree's aggregates
/// from payload bytes and compares them against the stored descriptors,
/// and checks chain length, node tags and time ordering.
pub fn check_extent(
    extent: &Extent,
    bstore: &SharedBlockStore,
    expected_level: usize,
) -> Result<()> {
    if extent.level() as usize != expected_level {
        return Err(StrandError::Corruption(format!(
            "extent has level {}, expected {}",
            extent.level(),
            expected_level
        )));
    }

    let mut cursor = extent.head_addr();
    let mut visited = 0usize;
    let mut newer_ts_min: Option<Timestamp> = None;

    while cursor != EMPTY_ADDR {
        if visited >= FANOUT {
            return Err(StrandError::Corruption(format!(
                "chain at level {} exceeds fanout",
                extent.level()
            )));
        }

        let node = load_node(bstore, cursor)?;
        if node.id() != extent.id {
            return Err(StrandError::Corruption(format!(
                "node {} belongs to series {}",
                cursor,
                node.id()
            )));
        }
        if node.level() != extent.level() {
            return Err(StrandError::Corruption(format!(
                "node {} at level {} linked into a level {} chain",
                cursor,
                node.level(),
                extent.level()
            )));
        }

        let (agg, _leaves) = verify_subtree(bstore, cursor)?;
        if let Some(limit) = newer_ts_min {
            if agg.ts_max > limit {
                return Err(StrandError::Corruption(format!(
                    "chain at level {} is not time ordered",
                    extent.level()
                )));
            }
        }
        newer_ts_min = Some(agg.ts_min);

        visited += 1;
        cursor = node.prev_addr();
    }

    if visited != extent.fanout() {
        return Err(StrandError::Corruption(format!(
            "chain length {} disagrees with fanout position {}",
            visited,
            extent.fanout()
        )));
    }

    Ok(())
}

/// Recompute a committed subtree's aggregates and leaf count, comparing
/// every stored descriptor against its subtree on the way
fn verify_subtree(bstore: &SharedBlockStore, addr: LogicAddr) -> Result<(Aggregates, u64)> {
    match load_node(bstore, addr)? {
        Node::Leaf(leaf) => {
            let pairs = leaf.read_all()?;

            let mut agg = Aggregates::empty();
            let mut last_ts = None;
            for &(ts, value) in &pairs {
                if let Some(last) = last_ts {
                    if ts < last {
                        return Err(StrandError::Corruption(format!(
                            "leaf {} is not time ordered",
                            addr
                        )));
                    }
                }
                last_ts = Some(ts);
                agg.update(ts, value);
            }

            if agg != *leaf.aggregates() {
                return Err(StrandError::Corruption(format!(
                    "leaf {} header aggregates disagree with payload",
                    addr
                )));
            }
            Ok((agg, 1))
        }
        Node::Inner(sb) => {
            let mut agg = Aggregates::empty();
            let mut leaves = 0u64;
            let mut prev_ts_max: Option<Timestamp> = None;

            for child in sb.children() {
                if child.level + 1 != sb.level() {
                    return Err(StrandError::Corruption(format!(
                        "superblock {} holds a level {} descriptor",
                        addr, child.level
                    )));
                }
                if let Some(limit) = prev_ts_max {
                    if child.ts_min < limit {
                        return Err(StrandError::Corruption(format!(
                            "superblock {} children are not time ordered",
                            addr
                        )));
                    }
                }
                prev_ts_max = Some(child.ts_max);

                let (rec, sub_leaves) = verify_subtree(bstore, child.addr)?;
                if rec.count != child.count
                    || rec.ts_min != child.ts_min
                    || rec.ts_max != child.ts_max
                    || rec.v_min != child.v_min
                    || rec.v_max != child.v_max
                    || rec.sum != child.sum
                {
                    return Err(StrandError::Corruption(format!(
                        "descriptor for node {} disagrees with its subtree",
                        child.addr
                    )));
                }

                agg.count += rec.count;
                agg.ts_min = agg.ts_min.min(rec.ts_min);
                agg.ts_max = agg.ts_max.max(rec.ts_max);
                agg.v_min = agg.v_min.min(rec.v_min);
                agg.v_max = agg.v_max.max(rec.v_max);
                agg.sum += rec.sum;
                leaves += sub_leaves;
            }

            let limit = (FANOUT as u64)
                .checked_pow(sb.level() as u32)
                .unwrap_or(u64::MAX);
            if leaves > limit {
                return Err(StrandError::Corruption(format!(
                    "level {} node {} reaches {} leaves, limit {}",
                    sb.level(),
                    addr,
                    leaves,
                    limit
                )));
            }

            Ok((agg, leaves))
        }
    }
}

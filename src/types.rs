//! Core types for StrandDB

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Series identifier
pub type ParamId = u64;

/// Handle into the block store
pub type LogicAddr = u64;

/// Sentinel address denoting "no predecessor"
pub const EMPTY_ADDR: LogicAddr = LogicAddr::MAX;

/// Outcome of appending to a bounded builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Accepted
    Ok,
    /// The builder is at capacity; commit it and retry in a fresh one
    Full,
    /// The timestamp is older than the last stored one
    OutOfOrder,
}

use serde::{Deserialize, Serialize};

use crate::lifecycle::PoolState;

/// Read-only point-in-time view of a pool, for diagnostics.
///
/// Taking a snapshot never mutates pool state. Counters are sampled
/// together under the admission lock, so they are mutually consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Lifecycle state at sampling time.
    pub state: PoolState,
    /// Live workers (core + overflow).
    pub workers: usize,
    /// Tasks admitted but not yet started. An entry mid-handoff at
    /// capacity zero is already bound for a worker and is not counted.
    pub queued: usize,
    /// Task runs finished since the pool started (inline runs included).
    pub completed: u64,
    /// High-water mark of the worker count.
    pub largest_workers: usize,
}

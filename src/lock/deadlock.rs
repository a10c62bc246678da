// Wait-for-graph construction and cycle detection.
//
// A wait edge T1 → T2 means T1 is blocked by a lock T2 holds (or by T2
// sitting ahead of T1 in a FIFO queue). Cycles are found by depth-first
// search; the victim is the youngest transaction in the cycle by start time,
// which the time-ordered transaction ID encoding makes the lexicographic
// maximum.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::common::TransactionId;

/// Adjacency representation of the wait-for graph.
pub type WaitForGraph = HashMap<TransactionId, HashSet<TransactionId>>;

/// Cycle search over wait-for graphs, with counters.
pub struct DeadlockDetector {
    stats: Mutex<DeadlockStats>,
    /// Bail-out for pathological graphs.
    max_depth: usize,
}

#[derive(Debug, Default, Clone)]
pub struct DeadlockStats {
    pub scans: u64,
    pub deadlocks_found: u64,
    pub victims_selected: u64,
    pub max_cycle_length: usize,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        DeadlockDetector {
            stats: Mutex::new(DeadlockStats::default()),
            max_depth: 1_000,
        }
    }

    /// Finds one cycle anywhere in the graph, as the list of transactions on
    /// it (first element repeated implicitly).
    pub fn find_cycle(&self, graph: &WaitForGraph) -> Option<Vec<TransactionId>> {
        self.stats.lock().scans += 1;

        let mut cleared: HashSet<TransactionId> = HashSet::new();
        for start in graph.keys() {
            if cleared.contains(start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs(start, graph, &mut cleared, &mut path, 0) {
                let mut stats = self.stats.lock();
                stats.deadlocks_found += 1;
                stats.max_cycle_length = stats.max_cycle_length.max(cycle.len());
                return Some(cycle);
            }
        }
        None
    }

    /// The cycle `txn` itself lies on, if any. Used for the proactive check
    /// before a waiter is enqueued: a downstream cycle not involving `txn`
    /// does not refuse the request.
    pub fn cycle_through(
        &self,
        graph: &WaitForGraph,
        txn: &TransactionId,
    ) -> Option<Vec<TransactionId>> {
        let mut cleared = HashSet::new();
        let mut path = Vec::new();
        self.dfs(txn, graph, &mut cleared, &mut path, 0)
            .filter(|cycle| cycle.contains(txn))
    }

    fn dfs(
        &self,
        node: &TransactionId,
        graph: &WaitForGraph,
        cleared: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        depth: usize,
    ) -> Option<Vec<TransactionId>> {
        if depth > self.max_depth {
            return None;
        }
        if let Some(pos) = path.iter().position(|t| t == node) {
            return Some(path[pos..].to_vec());
        }
        if cleared.contains(node) {
            return None;
        }

        path.push(node.clone());
        if let Some(next) = graph.get(node) {
            for succ in next {
                if let Some(cycle) = self.dfs(succ, graph, cleared, path, depth + 1) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        cleared.insert(node.clone());
        None
    }

    /// Picks the youngest transaction in the cycle by start time.
    pub fn select_victim(&self, cycle: &[TransactionId]) -> TransactionId {
        self.stats.lock().victims_selected += 1;
        cycle
            .iter()
            .max()
            .expect("deadlock cycle is never empty")
            .clone()
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().clone()
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

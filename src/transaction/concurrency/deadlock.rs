use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::common::types::{TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::TransactionState;
use crate::transaction::concurrency::transaction_manager::TransactionManager;

/// Waits-for graph rebuilt on every detection pass.
///
/// An edge T1 -> T2 means T1 is waiting on a lock T2 holds. Adjacency
/// lists are kept sorted by transaction id so the DFS order (and hence the
/// reported cycle) is deterministic.
#[derive(Default)]
pub(crate) struct WaitsForGraph {
    edges: BTreeMap<TxnId, Vec<TxnId>>,
}

impl WaitsForGraph {
    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().push(to);
    }

    pub fn normalize(&mut self) {
        for targets in self.edges.values_mut() {
            targets.sort_unstable();
            targets.dedup();
        }
    }

    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let mut list = Vec::new();
        for (&from, targets) in &self.edges {
            for &to in targets {
                list.push((from, to));
            }
        }
        list
    }

    /// Find a cycle and return its youngest member (the highest txn id)
    pub fn find_cycle_victim(&self) -> Option<TxnId> {
        let mut visited = HashSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(victim) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if on_path.contains(&next) {
                    // back edge closes a cycle: the victim is the youngest
                    // transaction on it
                    let start = path.iter().position(|&t| t == next)?;
                    return path[start..].iter().copied().max();
                }
                if !visited.contains(&next) {
                    if let Some(victim) = self.dfs(next, visited, path, on_path) {
                        return Some(victim);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}

impl LockManager {
    /// Build the waits-for graph from every request queue: each waiting
    /// request waits on every granted request it is incompatible with.
    pub(crate) fn build_waits_for(&self) -> WaitsForGraph {
        let mut graph = WaitsForGraph::default();
        for queue in self.all_queues() {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if !holder.mode.compatible_with(waiter.mode) {
                        graph.add_edge(waiter.txn_id, holder.txn_id);
                    }
                }
            }
        }
        graph.normalize();
        graph
    }

    /// Current waits-for edges, sorted by source then target
    pub fn waits_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        self.build_waits_for().edge_list()
    }

    /// One detection pass: abort the youngest transaction of each cycle
    /// until the graph is acyclic. The intermediate graph is rebuilt from
    /// the queues after every victim, then discarded.
    pub fn run_cycle_detection_pass(&self, transactions: &TransactionManager) {
        loop {
            let graph = self.build_waits_for();
            let Some(victim_id) = graph.find_cycle_victim() else {
                return;
            };

            debug!("deadlock detected; aborting youngest txn {}", victim_id);
            if let Some(victim) = transactions.get_transaction(victim_id) {
                victim.set_state(TransactionState::Aborted);
                victim.lock_sets().clear();
            }
            self.purge_transaction(victim_id);
        }
    }

    /// Remove every request a victim holds or waits for, and wake each
    /// affected queue so waiters re-evaluate grantability.
    fn purge_transaction(&self, txn_id: TxnId) {
        for queue in self.all_queues() {
            let mut state = queue.state.lock();
            if state.upgrading == txn_id {
                state.upgrading = INVALID_TXN_ID;
            }
            let before = state.requests.len();
            state.requests.retain(|r| r.txn_id != txn_id);
            if state.requests.len() != before {
                queue.cv.notify_all();
            }
        }
    }

    /// Spawn the background detector. It shares the manager's queue
    /// latches and checks the shutdown flag at every tick.
    pub fn start_deadlock_detection(
        self: &Arc<Self>,
        transactions: Arc<TransactionManager>,
        interval: Duration,
    ) {
        let lock_manager = Arc::clone(self);
        let shutdown = self.detector_shutdown.clone();
        shutdown.store(false, Ordering::SeqCst);

        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                lock_manager.run_cycle_detection_pass(&transactions);
            }
        });
        *self.detector_handle.lock() = Some(handle);
    }

    /// Signal the detector to stop and wait for it to exit
    pub fn stop_deadlock_detection(&self) {
        self.detector_shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Multi-granularity lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility matrix
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) | (_, IntentionExclusive) => false,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Allowed upgrades: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> {X}
    pub fn upgrade_valid(from: LockMode, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (from, to),
            (
                IntentionShared,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ) | (Shared, Exclusive | SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }
}

/// One entry in a resource's request queue
#[derive(Debug, Clone)]
pub(crate) struct LockRequest {
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub granted: bool,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub requests: Vec<LockRequest>,
    /// Transaction currently upgrading on this queue, or INVALID_TXN_ID
    pub upgrading: TxnId,
}

/// FIFO request queue with a condition variable for waiters. Upgrading
/// requests jump to the head of the queue.
#[derive(Default)]
pub(crate) struct LockRequestQueue {
    pub state: Mutex<QueueState>,
    pub cv: Condvar,
}

/// Hierarchical table/row lock manager with strict two-phase locking.
///
/// Lock requests validate the transaction's isolation rules, queue up on
/// the resource, and block on the queue's condition variable until every
/// request ahead of them (and every granted request behind them) is
/// compatible. Directory latches are always taken before queue latches
/// and dropped before waiting.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    pub(crate) detector_shutdown: Arc<AtomicBool>,
    pub(crate) detector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detector_shutdown: Arc::new(AtomicBool::new(false)),
            detector_handle: Mutex::new(None),
        }
    }

    /// Acquire a table lock, blocking until granted. Returns `Ok(false)`
    /// when the transaction was aborted while waiting (deadlock victim).
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionError> {
        debug!("txn {} requesting {:?} on table {}", txn.id(), mode, oid);
        self.check_table_isolation(txn, mode)?;

        let queue = {
            let mut table_map = self.table_lock_map.lock();
            table_map
                .entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::default()))
                .clone()
        };
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held_mode = state.requests[pos].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TXN_ID {
                return Err(txn.abort_with(AbortReason::UpgradeConflict));
            }
            if !LockMode::upgrade_valid(held_mode, mode) {
                return Err(txn.abort_with(AbortReason::IncompatibleUpgrade));
            }
            // Stage the upgrade: the old grant is dropped and the new
            // request goes to the head of the queue
            Self::remove_table_lock_set(txn, held_mode, oid);
            state.requests.remove(pos);
            state.requests.insert(
                0,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    granted: false,
                },
            );
            state.upgrading = txn.id();
            upgrading = true;
        } else {
            state.requests.push(LockRequest {
                txn_id: txn.id(),
                mode,
                granted: false,
            });
        }

        while txn.state() != TransactionState::Aborted
            && !grantable(&state.requests, txn.id(), mode)
        {
            queue.cv.wait(&mut state);
        }

        if upgrading {
            state.upgrading = INVALID_TXN_ID;
        }

        if txn.state() == TransactionState::Aborted {
            state.requests.retain(|r| r.txn_id != txn.id());
            queue.cv.notify_all();
            return Ok(false);
        }

        if let Some(request) = state.requests.iter_mut().find(|r| r.txn_id == txn.id()) {
            request.granted = true;
        }
        drop(state);

        Self::add_table_lock_set(txn, mode, oid);
        debug!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
        Ok(true)
    }

    /// Release a table lock and wake the queue
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<(), TransactionError> {
        let queue = {
            let table_map = self.table_lock_map.lock();
            match table_map.get(&oid) {
                Some(queue) => queue.clone(),
                None => return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };
        let mut state = queue.state.lock();

        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };

        // Row locks under this table must go first
        {
            let sets = txn.lock_sets();
            let rows_held = sets.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
                || sets.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty());
            if rows_held {
                drop(sets);
                return Err(txn.abort_with(AbortReason::TableUnlockedBeforeUnlockingRows));
            }
        }

        let mode = state.requests[pos].mode;
        state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        self.transition_after_unlock(txn, mode);
        Self::remove_table_lock_set(txn, mode, oid);
        debug!("txn {} released {:?} on table {}", txn.id(), mode, oid);
        Ok(())
    }

    /// Acquire a row lock. Rows take only S and X; exclusive row locks
    /// require an X, IX or SIX lock on the owning table.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        debug!("txn {} requesting {:?} on row {}", txn.id(), mode, rid);
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(txn.abort_with(AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_row_isolation(txn, mode)?;

        if mode == LockMode::Exclusive {
            let table_held = {
                let sets = txn.lock_sets();
                sets.exclusive_table.contains(&oid)
                    || sets.intention_exclusive_table.contains(&oid)
                    || sets.shared_intention_exclusive_table.contains(&oid)
            };
            if !table_held {
                return Err(txn.abort_with(AbortReason::TableLockNotPresent));
            }
        }

        let queue = {
            let mut row_map = self.row_lock_map.lock();
            row_map
                .entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::default()))
                .clone()
        };
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held_mode = state.requests[pos].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TXN_ID {
                return Err(txn.abort_with(AbortReason::UpgradeConflict));
            }
            if !LockMode::upgrade_valid(held_mode, mode) {
                return Err(txn.abort_with(AbortReason::IncompatibleUpgrade));
            }
            Self::remove_row_lock_set(txn, held_mode, oid, rid);
            state.requests.remove(pos);
            state.requests.insert(
                0,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    granted: false,
                },
            );
            state.upgrading = txn.id();
            upgrading = true;
        } else {
            state.requests.push(LockRequest {
                txn_id: txn.id(),
                mode,
                granted: false,
            });
        }

        while txn.state() != TransactionState::Aborted
            && !grantable(&state.requests, txn.id(), mode)
        {
            queue.cv.wait(&mut state);
        }

        if upgrading {
            state.upgrading = INVALID_TXN_ID;
        }

        if txn.state() == TransactionState::Aborted {
            state.requests.retain(|r| r.txn_id != txn.id());
            queue.cv.notify_all();
            return Ok(false);
        }

        if let Some(request) = state.requests.iter_mut().find(|r| r.txn_id == txn.id()) {
            request.granted = true;
        }
        drop(state);

        Self::add_row_lock_set(txn, mode, oid, rid);
        debug!("txn {} granted {:?} on row {}", txn.id(), mode, rid);
        Ok(true)
    }

    /// Release a row lock and wake the queue
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        let queue = {
            let row_map = self.row_lock_map.lock();
            match row_map.get(&rid) {
                Some(queue) => queue.clone(),
                None => return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };
        let mut state = queue.state.lock();

        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            return Err(txn.abort_with(AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = state.requests[pos].mode;
        state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        self.transition_after_unlock(txn, mode);
        Self::remove_row_lock_set(txn, mode, oid, rid);
        debug!("txn {} released {:?} on row {}", txn.id(), mode, rid);
        Ok(())
    }

    /// Isolation gate for table lock requests
    fn check_table_isolation(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionError> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared
                        | LockMode::IntentionShared
                        | LockMode::SharedIntentionExclusive
                ) {
                    return Err(txn.abort_with(AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Isolation gate for row lock requests
    fn check_row_isolation(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionError> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking && mode != LockMode::Shared {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if mode == LockMode::Shared {
                    return Err(txn.abort_with(AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(txn.abort_with(AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Two-phase locking transition after releasing a lock. Repeatable
    /// read shrinks on any S or X unlock; the weaker levels only on X.
    fn transition_after_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn add_table_lock_set(txn: &Transaction, mode: LockMode, oid: TableOid) {
        let mut sets = txn.lock_sets();
        match mode {
            LockMode::IntentionShared => sets.intention_shared_table.insert(oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_table.insert(oid),
            LockMode::Shared => sets.shared_table.insert(oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_table.insert(oid)
            }
            LockMode::Exclusive => sets.exclusive_table.insert(oid),
        };
    }

    fn remove_table_lock_set(txn: &Transaction, mode: LockMode, oid: TableOid) {
        let mut sets = txn.lock_sets();
        match mode {
            LockMode::IntentionShared => sets.intention_shared_table.remove(&oid),
            LockMode::IntentionExclusive => sets.intention_exclusive_table.remove(&oid),
            LockMode::Shared => sets.shared_table.remove(&oid),
            LockMode::SharedIntentionExclusive => {
                sets.shared_intention_exclusive_table.remove(&oid)
            }
            LockMode::Exclusive => sets.exclusive_table.remove(&oid),
        };
    }

    fn add_row_lock_set(txn: &Transaction, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = txn.lock_sets();
        match mode {
            LockMode::Shared => {
                sets.shared_rows.entry(oid).or_default().insert(rid);
            }
            LockMode::Exclusive => {
                sets.exclusive_rows.entry(oid).or_default().insert(rid);
            }
            _ => {}
        }
    }

    fn remove_row_lock_set(txn: &Transaction, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = txn.lock_sets();
        match mode {
            LockMode::Shared => {
                if let Some(rows) = sets.shared_rows.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            LockMode::Exclusive => {
                if let Some(rows) = sets.exclusive_rows.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            _ => {}
        }
    }

    /// Snapshot every live queue, tables then rows
    pub(crate) fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<Arc<LockRequestQueue>> = {
            let table_map = self.table_lock_map.lock();
            table_map.values().cloned().collect()
        };
        {
            let row_map = self.row_lock_map.lock();
            queues.extend(row_map.values().cloned());
        }
        queues
    }
}

/// A request can be granted when every request queued ahead of it is
/// compatible, and every already-granted request behind it is compatible.
fn grantable(requests: &[LockRequest], txn_id: TxnId, mode: LockMode) -> bool {
    let mut ahead = true;
    for request in requests {
        if request.txn_id == txn_id {
            ahead = false;
            continue;
        }
        if ahead {
            if !request.mode.compatible_with(mode) {
                return false;
            }
        } else if request.granted && !request.mode.compatible_with(mode) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        let expected = [
            // IS     IX     S      SIX    X
            [true, true, true, true, false],   // IS
            [true, true, false, false, false], // IX
            [true, false, true, false, false], // S
            [true, false, false, false, false], // SIX
            [false, false, false, false, false], // X
        ];
        for (i, &a) in modes.iter().enumerate() {
            for (j, &b) in modes.iter().enumerate() {
                assert_eq!(
                    a.compatible_with(b),
                    expected[i][j],
                    "{:?} vs {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_upgrade_table() {
        use LockMode::*;
        assert!(LockMode::upgrade_valid(IntentionShared, Shared));
        assert!(LockMode::upgrade_valid(IntentionShared, Exclusive));
        assert!(LockMode::upgrade_valid(Shared, SharedIntentionExclusive));
        assert!(LockMode::upgrade_valid(IntentionExclusive, Exclusive));
        assert!(LockMode::upgrade_valid(SharedIntentionExclusive, Exclusive));

        assert!(!LockMode::upgrade_valid(Exclusive, Shared));
        assert!(!LockMode::upgrade_valid(Shared, IntentionShared));
        assert!(!LockMode::upgrade_valid(SharedIntentionExclusive, Shared));
    }

    #[test]
    fn test_grantable_fifo() {
        use LockMode::*;
        let requests = vec![
            LockRequest {
                txn_id: 1,
                mode: Shared,
                granted: true,
            },
            LockRequest {
                txn_id: 2,
                mode: Exclusive,
                granted: false,
            },
            LockRequest {
                txn_id: 3,
                mode: Shared,
                granted: false,
            },
        ];
        // txn 2 waits behind txn 1's grant
        assert!(!grantable(&requests, 2, Exclusive));
        // txn 3 is compatible with txn 1 but queued behind txn 2
        assert!(!grantable(&requests, 3, Shared));

        let drained = vec![LockRequest {
            txn_id: 2,
            mode: Exclusive,
            granted: false,
        }];
        assert!(grantable(&drained, 2, Exclusive));
    }
}

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested at read-uncommitted"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "incompatible lock upgrade",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock requested without a table lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before its row locks"
            }
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock requested but no lock held",
        };
        write!(f, "{}", reason)
    }
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {txn_id} aborted: {reason}")]
    Abort { txn_id: TxnId, reason: AbortReason },

    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Transaction {0} not found")]
    NotFound(TxnId),
}

/// Everything a transaction currently holds, by mode.
///
/// Row locks are additionally bucketed by table so unlocking a table can
/// cheaply check for remaining row locks beneath it.
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_table: HashSet<TableOid>,
    pub exclusive_table: HashSet<TableOid>,
    pub intention_shared_table: HashSet<TableOid>,
    pub intention_exclusive_table: HashSet<TableOid>,
    pub shared_intention_exclusive_table: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    pub fn clear(&mut self) {
        self.shared_table.clear();
        self.exclusive_table.clear();
        self.intention_shared_table.clear();
        self.intention_exclusive_table.clear();
        self.shared_intention_exclusive_table.clear();
        self.shared_rows.clear();
        self.exclusive_rows.clear();
    }
}

/// Transaction - an active unit of work tracked by the lock manager.
///
/// Shared between the requesting thread and the deadlock detector, so the
/// mutable pieces sit behind their own mutexes.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn lock_sets(&self) -> MutexGuard<'_, LockSets> {
        self.lock_sets.lock()
    }

    /// Mark aborted and surface the reason as an error
    pub(crate) fn abort_with(&self, reason: AbortReason) -> TransactionError {
        self.set_state(TransactionState::Aborted);
        TransactionError::Abort {
            txn_id: self.id,
            reason,
        }
    }
}

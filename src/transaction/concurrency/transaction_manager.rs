use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Transaction manager - creates and tracks transactions, and releases
/// their locks through the lock manager at commit or abort.
pub struct TransactionManager {
    /// Next transaction ID to assign
    next_txn_id: AtomicU32,

    /// Active transactions map (txn_id -> Transaction); also consulted by
    /// the deadlock detector to look up victims
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,

    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            active_transactions: Mutex::new(HashMap::new()),
            lock_manager,
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        debug!("txn {} begun at {:?}", txn_id, isolation_level);
        txn
    }

    /// Get an active transaction by ID
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: release every held lock, then mark the transaction
    /// committed and drop it from the active set.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()))
            }
            _ => {}
        }

        self.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.active_transactions.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Abort: release every held lock and mark the transaction aborted.
    /// Aborting an already-aborted transaction (a deadlock victim) is the
    /// executor's cleanup path and succeeds.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }

        self.release_all_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.active_transactions.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    /// Number of transactions currently active
    pub fn active_count(&self) -> usize {
        self.active_transactions.lock().len()
    }

    /// Release row locks first, then table locks, from a snapshot of the
    /// transaction's lock sets.
    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = {
            let sets = txn.lock_sets();
            let mut rows: Vec<(TableOid, Rid)> = Vec::new();
            for (&oid, rids) in sets.shared_rows.iter().chain(sets.exclusive_rows.iter()) {
                rows.extend(rids.iter().map(|&rid| (oid, rid)));
            }
            let tables: Vec<TableOid> = sets
                .shared_table
                .iter()
                .chain(sets.exclusive_table.iter())
                .chain(sets.intention_shared_table.iter())
                .chain(sets.intention_exclusive_table.iter())
                .chain(sets.shared_intention_exclusive_table.iter())
                .copied()
                .collect();
            (rows, tables)
        };

        for (oid, rid) in rows {
            if let Err(e) = self.lock_manager.unlock_row(txn, oid, rid) {
                debug!("txn {} row unlock during teardown failed: {}", txn.id(), e);
            }
        }
        for oid in tables {
            if let Err(e) = self.lock_manager.unlock_table(txn, oid) {
                debug!("txn {} table unlock during teardown failed: {}", txn.id(), e);
            }
        }
    }
}

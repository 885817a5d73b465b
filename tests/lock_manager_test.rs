use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use kitedb::common::types::Rid;
use kitedb::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionError, TransactionManager,
    TransactionState,
};

const TABLE_A: u32 = 1;

fn setup() -> (Arc<LockManager>, Arc<TransactionManager>) {
    let lock_manager = Arc::new(LockManager::new());
    let transaction_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    (lock_manager, transaction_manager)
}

fn abort_reason(err: TransactionError) -> AbortReason {
    match err {
        TransactionError::Abort { reason, .. } => reason,
        other => panic!("expected abort, got {other:?}"),
    }
}

#[test]
fn test_shared_lock_and_unlock() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&txn, LockMode::Shared, TABLE_A)?);
    assert!(txn.lock_sets().shared_table.contains(&TABLE_A));

    lm.unlock_table(&txn, TABLE_A)?;
    assert!(!txn.lock_sets().shared_table.contains(&TABLE_A));
    // repeatable read shrinks on any S/X unlock
    assert_eq!(txn.state(), TransactionState::Shrinking);
    Ok(())
}

#[test]
fn test_relock_same_mode_is_idempotent() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&txn, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&txn, LockMode::Shared, TABLE_A)?);
    lm.unlock_table(&txn, TABLE_A)?;
    Ok(())
}

#[test]
fn test_two_phase_locking_blocks_relock() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap();
    lm.unlock_table(&txn, TABLE_A).unwrap();

    // shrinking phase: no new locks at repeatable read
    let err = lm.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockOnShrinking);
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_read_committed_allows_shared_while_shrinking() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::ReadCommitted);

    lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)?;
    lm.lock_row(&txn, LockMode::Exclusive, TABLE_A, Rid::new(1, 1))?;
    lm.unlock_row(&txn, TABLE_A, Rid::new(1, 1))?;
    assert_eq!(txn.state(), TransactionState::Shrinking);

    // S and IS stay permitted while shrinking
    assert!(lm.lock_table(&txn, LockMode::IntentionShared, TABLE_A + 1)?);
    assert!(lm.lock_row(&txn, LockMode::Shared, TABLE_A, Rid::new(1, 2))?);

    // but X does not
    let err = lm
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, Rid::new(1, 3))
        .unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockOnShrinking);
    Ok(())
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::ReadUncommitted);

    let err = lm.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockSharedOnReadUncommitted);
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_read_uncommitted_allows_exclusive() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::ReadUncommitted);

    assert!(lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_row(&txn, LockMode::Exclusive, TABLE_A, Rid::new(1, 1))?);
    Ok(())
}

#[test]
fn test_row_rejects_intention_modes() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm
        .lock_row(&txn, LockMode::IntentionShared, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::AttemptedIntentionLockOnRow);
}

#[test]
fn test_row_exclusive_requires_table_lock() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::TableLockNotPresent);
}

#[test]
fn test_table_unlock_before_rows_rejected() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)?;
    lm.lock_row(&txn, LockMode::Exclusive, TABLE_A, Rid::new(1, 1))?;

    let err = lm.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(
        abort_reason(err),
        AbortReason::TableUnlockedBeforeUnlockingRows
    );
    Ok(())
}

#[test]
fn test_unlock_without_lock_rejected() {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(
        abort_reason(err),
        AbortReason::AttemptedUnlockButNoLockHeld
    );
}

#[test]
fn test_intention_locks_are_compatible() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);

    // IS, IX and a second IX coexist on one table
    assert!(lm.lock_table(&t1, LockMode::IntentionShared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_table(&t3, LockMode::IntentionExclusive, TABLE_A)?);

    // row locks under them on different rows
    assert!(lm.lock_row(&t2, LockMode::Exclusive, TABLE_A, Rid::new(1, 1))?);
    assert!(lm.lock_row(&t3, LockMode::Exclusive, TABLE_A, Rid::new(1, 2))?);
    Ok(())
}

#[test]
fn test_exclusive_waits_for_shared() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);

    let (tx, rx) = mpsc::channel();
    let blocked = {
        let lm = lm.clone();
        let t2 = t2.clone();
        thread::spawn(move || {
            let granted = lm.lock_table(&t2, LockMode::Exclusive, TABLE_A);
            tx.send(()).ok();
            granted
        })
    };

    // the X request stays queued while S is held
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(lm.waits_for_edges(), vec![(t2.id(), t1.id())]);

    lm.unlock_table(&t1, TABLE_A)?;
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    assert!(blocked.join().expect("locking thread panicked")?);
    assert!(t2.lock_sets().exclusive_table.contains(&TABLE_A));
    Ok(())
}

#[test]
fn test_upgrade_waits_for_other_holder() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Shared, TABLE_A)?);

    let (tx, rx) = mpsc::channel();
    let upgrader = {
        let lm = lm.clone();
        let t1 = t1.clone();
        thread::spawn(move || {
            // S -> X upgrade queues at the head and waits for t2
            let granted = lm.lock_table(&t1, LockMode::Exclusive, TABLE_A);
            tx.send(()).ok();
            granted
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    lm.unlock_table(&t2, TABLE_A)?;
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    assert!(upgrader.join().expect("upgrader panicked")?);

    let sets = t1.lock_sets();
    assert!(sets.exclusive_table.contains(&TABLE_A));
    assert!(!sets.shared_table.contains(&TABLE_A));
    Ok(())
}

#[test]
fn test_concurrent_upgrade_conflict() -> Result<()> {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::Shared, TABLE_A)?);

    let upgrader = {
        let lm = lm.clone();
        let t1 = t1.clone();
        thread::spawn(move || lm.lock_table(&t1, LockMode::Exclusive, TABLE_A))
    };
    // let t1's upgrade reach the queue before t2 tries
    thread::sleep(Duration::from_millis(100));

    let err = lm.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::UpgradeConflict);

    // dropping the aborted holder's lock lets the upgrade through
    tm.abort(&t2)?;
    assert!(upgrader.join().expect("upgrader panicked")?);
    Ok(())
}

#[test]
fn test_incompatible_upgrade_rejected() -> Result<()> {
    let (lm, tm) = setup();
    let txn = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&txn, LockMode::Exclusive, TABLE_A)?);
    let err = lm.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::IncompatibleUpgrade);
    Ok(())
}

#[test]
fn test_deadlock_detection_aborts_youngest() -> Result<()> {
    let (lm, tm) = setup();
    lm.start_deadlock_detection(tm.clone(), Duration::from_millis(50));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    let r1 = Rid::new(1, 1);
    let r2 = Rid::new(1, 2);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_table(&t2, LockMode::IntentionExclusive, TABLE_A)?);
    assert!(lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, r1)?);
    assert!(lm.lock_row(&t2, LockMode::Exclusive, TABLE_A, r2)?);

    // t1 wants r2 (held by t2), t2 wants r1 (held by t1)
    let older = {
        let (lm, t1) = (lm.clone(), t1.clone());
        thread::spawn(move || lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, r2))
    };
    let younger = {
        let (lm, t2) = (lm.clone(), t2.clone());
        thread::spawn(move || lm.lock_row(&t2, LockMode::Exclusive, TABLE_A, r1))
    };

    // within two detection intervals the youngest txn is the victim and
    // the older one acquires its pending lock
    let older_result = older.join().expect("t1 thread panicked")?;
    let younger_result = younger.join().expect("t2 thread panicked")?;

    assert!(older_result);
    assert!(!younger_result);
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert_eq!(t1.state(), TransactionState::Growing);

    tm.abort(&t2)?;
    tm.commit(&t1)?;
    lm.stop_deadlock_detection();
    Ok(())
}

#[test]
fn test_detector_idle_on_plain_waiting() -> Result<()> {
    let (lm, tm) = setup();
    lm.start_deadlock_detection(tm.clone(), Duration::from_millis(50));

    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, TABLE_A)?);

    let waiter = {
        let (lm, t2) = (lm.clone(), t2.clone());
        thread::spawn(move || lm.lock_table(&t2, LockMode::Exclusive, TABLE_A))
    };

    // a wait without a cycle is not a deadlock: several intervals pass
    // and nobody is aborted
    thread::sleep(Duration::from_millis(300));
    assert_eq!(t2.state(), TransactionState::Growing);

    lm.unlock_table(&t1, TABLE_A)?;
    assert!(waiter.join().expect("waiter panicked")?);

    lm.stop_deadlock_detection();
    Ok(())
}

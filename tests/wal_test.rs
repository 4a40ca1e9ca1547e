use caprock::wal::WalManager;
use tempfile::tempdir;

#[test]
fn test_commit_survives_a_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");

    {
        let mut wal = WalManager::open(&path).unwrap();
        let txn = wal.begin().unwrap();
        wal.log_insert(txn, 0, 0, b"row one").unwrap();
        wal.commit(txn).unwrap();
        // Simulate a crash: no drop, no extra flush. The commit itself must
        // have forced the record to stable storage.
        std::mem::forget(wal);
    }

    let mut wal = WalManager::open(&path).unwrap();
    let summary = wal.recover().unwrap();
    assert!(summary.committed.contains(&1));
    assert!(summary.in_flight.is_empty());
}

#[test]
fn test_recovery_separates_committed_from_in_flight() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");

    {
        let mut wal = WalManager::open(&path).unwrap();
        let t1 = wal.begin().unwrap();
        wal.log_insert(t1, 0, 0, b"uncommitted row").unwrap();

        let t2 = wal.begin().unwrap();
        wal.log_update(t2, 0, 1, b"before", b"after").unwrap();
        wal.commit(t2).unwrap();
        std::mem::forget(wal);
    }

    let mut wal = WalManager::open(&path).unwrap();
    let summary = wal.recover().unwrap();
    assert!(summary.in_flight.contains(&1));
    assert!(summary.committed.contains(&2));
    // Every record before the crash is accounted for: two BEGINs, two data
    // records, one COMMIT.
    assert_eq!(wal.current_lsn(), 6);
}

#[test]
fn test_recovered_wal_continues_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");

    {
        let mut wal = WalManager::open(&path).unwrap();
        let t1 = wal.begin().unwrap();
        wal.commit(t1).unwrap();
        let t2 = wal.begin().unwrap();
        wal.log_delete(t2, 4, 2, b"gone").unwrap();
        wal.commit(t2).unwrap();
    }

    let mut wal = WalManager::open(&path).unwrap();
    wal.recover().unwrap();
    // New work starts past everything in the log.
    let t3 = wal.begin().unwrap();
    assert_eq!(t3, 3);
    wal.commit(t3).unwrap();

    let mut wal = WalManager::open(&path).unwrap();
    let summary = wal.recover().unwrap();
    assert_eq!(summary.committed.len(), 3);
}

#[test]
fn test_recover_twice_is_stable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    {
        let mut wal = WalManager::open(&path).unwrap();
        let txn = wal.begin().unwrap();
        wal.commit(txn).unwrap();
    }

    let mut wal = WalManager::open(&path).unwrap();
    let first = wal.recover().unwrap();
    let lsn_after_first = wal.current_lsn();
    let second = wal.recover().unwrap();
    assert_eq!(first.committed, second.committed);
    assert_eq!(lsn_after_first, wal.current_lsn());
}

#[test]
fn test_garbage_tail_does_not_break_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    {
        let mut wal = WalManager::open(&path).unwrap();
        let txn = wal.begin().unwrap();
        wal.log_insert(txn, 1, 0, b"kept").unwrap();
        wal.commit(txn).unwrap();
    }

    // A torn write leaves partial bytes after the last complete record.
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
    std::fs::write(&path, &raw).unwrap();

    let mut wal = WalManager::open(&path).unwrap();
    let summary = wal.recover().unwrap();
    assert!(summary.committed.contains(&1));
    assert_eq!(wal.current_lsn(), 4);
}

#[test]
fn test_empty_log_recovers_to_a_fresh_state() {
    let dir = tempdir().unwrap();
    let mut wal = WalManager::open(dir.path().join("t.wal")).unwrap();
    let summary = wal.recover().unwrap();
    assert!(summary.committed.is_empty());
    assert!(summary.in_flight.is_empty());
    assert_eq!(wal.current_lsn(), 1);
    assert_eq!(wal.begin().unwrap(), 1);
}

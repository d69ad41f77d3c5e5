//! Checkpoint record and store tests

use pretty_assertions::assert_eq;

use crate::checkpoint::{CheckpointError, CheckpointStore, Position};

fn store_in(dir: &tempfile::TempDir) -> CheckpointStore {
    CheckpointStore::open(dir.path().join("position.chk")).unwrap()
}

// ============================================================================
// Record codec
// ============================================================================

#[test]
fn test_record_layout_is_pinned() {
    let pos = Position::new("log.000001", 4, 7);
    let record = pos.encode();
    // 16 fixed bytes + 10 name bytes.
    assert_eq!(&record[0..2], &[26, 0]);
    assert_eq!(&record[2..10], &4i64.to_le_bytes());
    assert_eq!(&record[10..18], &7i64.to_le_bytes());
    assert_eq!(&record[18..], b"log.000001");
}

#[test]
fn test_record_roundtrip() {
    let pos = Position::new("mysql-bin.000042", 193_847_561, 88);
    assert_eq!(Position::decode(&pos.encode()).unwrap(), pos);
}

#[test]
fn test_empty_file_name_roundtrip() {
    let pos = Position::default();
    assert!(pos.is_initial());
    let decoded = Position::decode(&pos.encode()).unwrap();
    assert_eq!(decoded, pos);
    assert!(decoded.is_initial());
}

#[test]
fn test_decode_tolerates_trailing_garbage() {
    let mut buf = Position::new("f", 1, 2).encode().to_vec();
    buf.extend_from_slice(b"stale tail from a longer record");
    let decoded = Position::decode(&buf).unwrap();
    assert_eq!(decoded.file, "f");
    assert_eq!(decoded.offset, 1);
}

#[test]
fn test_decode_rejects_truncated_body() {
    let record = Position::new("log.000001", 4, 7).encode();
    let err = Position::decode(&record[..record.len() - 3]).unwrap_err();
    assert!(matches!(err, CheckpointError::Truncated { .. }));
}

#[test]
fn test_decode_rejects_short_prefix() {
    let err = Position::decode(&[9]).unwrap_err();
    assert!(matches!(err, CheckpointError::Truncated { needed: 2, have: 1 }));
}

#[test]
fn test_decode_rejects_undersized_declared_length() {
    // Declared length 5 cannot hold the 16 fixed bytes.
    let mut buf = vec![5u8, 0];
    buf.extend_from_slice(&[0u8; 16]);
    let err = Position::decode(&buf).unwrap_err();
    assert!(matches!(err, CheckpointError::ShortRecord(5)));
}

// ============================================================================
// Store
// ============================================================================

#[test]
fn test_save_then_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    let pos = Position::new("log.000003", 120, 15);
    store.save(&pos).unwrap();
    assert_eq!(store.load(), pos);
}

#[test]
fn test_fresh_store_loads_zero_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    assert_eq!(store.load(), Position::default());
}

#[test]
fn test_save_is_idempotent_through_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    let pos = Position::new("log.000009", 512, 3);
    store.save(&pos).unwrap();
    let loaded = store.load();
    store.save(&loaded).unwrap();
    assert_eq!(store.load(), pos);
}

#[test]
fn test_shorter_record_fully_replaces_longer_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    store
        .save(&Position::new("a-rather-long-binlog-file-name.000123", 9, 9))
        .unwrap();
    let short = Position::new("b.1", 1, 1);
    store.save(&short).unwrap();
    assert_eq!(store.load(), short);
}

#[test]
fn test_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("position.chk");
    let pos = Position::new("log.000007", 77, 5);
    CheckpointStore::open(&path).unwrap().save(&pos).unwrap();
    let reopened = CheckpointStore::open(&path).unwrap();
    assert_eq!(reopened.load(), pos);
}

#[test]
fn test_truncated_file_loads_zero_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("position.chk");
    std::fs::write(&path, [30u8, 0, 1, 2, 3]).unwrap();
    let store = CheckpointStore::open(&path).unwrap();
    assert_eq!(store.load(), Position::default());
}

#[test]
fn test_open_failure_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let err = CheckpointStore::open(dir.path().join("no-such-dir").join("p.chk")).unwrap_err();
    assert!(matches!(err, CheckpointError::Io(_)));
}

// ============================================================================
// Properties
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_record_roundtrip(
            file in "[a-zA-Z0-9._-]{0,64}",
            offset in any::<i64>(),
            event_index in any::<i64>(),
        ) {
            let pos = Position::new(file, offset, event_index);
            prop_assert_eq!(Position::decode(&pos.encode()).unwrap(), pos);
        }

        #[test]
        fn prop_store_load_returns_last_save(
            records in prop::collection::vec(
                ("[a-z0-9.]{1,32}", 0i64..=i64::MAX, 0i64..=i64::MAX),
                1..8,
            ),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = CheckpointStore::open(dir.path().join("p.chk")).unwrap();
            let mut last = Position::default();
            for (file, offset, event_index) in records {
                last = Position::new(file, offset, event_index);
                store.save(&last).unwrap();
            }
            prop_assert_eq!(store.load(), last);
        }
    }
}

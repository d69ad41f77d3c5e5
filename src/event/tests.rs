//! Event rendering tests
//!
//! Pins the EVENT payload envelope and every column rendering rule.

use pretty_assertions::assert_eq;
use serde_json::Value;

use crate::event::{ColumnKind, ColumnMeta, ColumnValue, EventEnvelope, EventKind, RowEvent};

fn simple_event(kind: EventKind, rows: Vec<Vec<ColumnValue>>) -> RowEvent {
    RowEvent {
        schema: "shop".to_string(),
        table: "users".to_string(),
        kind,
        columns: vec![
            ColumnMeta::new("id", ColumnKind::Int),
            ColumnMeta::new("name", ColumnKind::String),
        ],
        rows,
    }
}

fn render_one(event: &RowEvent) -> Value {
    let mut index = 0i64;
    let payloads = event.render(
        || {
            index += 1;
            index
        },
        1700000000,
    );
    assert_eq!(payloads.len(), 1);
    serde_json::from_slice(&payloads[0]).unwrap()
}

/// Render a single value through a one-column insert and pull it back out.
fn render_value(column: ColumnMeta, value: ColumnValue) -> Value {
    let event = RowEvent {
        schema: "db".to_string(),
        table: "t".to_string(),
        kind: EventKind::Insert,
        columns: vec![column],
        rows: vec![vec![value]],
    };
    let msg = render_one(&event);
    msg["event"]["data"]["c"].clone()
}

fn col(kind: ColumnKind) -> ColumnMeta {
    ColumnMeta::new("c", kind)
}

// ============================================================================
// Envelope
// ============================================================================

#[test]
fn test_insert_envelope_is_pinned() {
    let event = simple_event(
        EventKind::Insert,
        vec![vec![
            ColumnValue::Int(1),
            ColumnValue::String("bob".to_string()),
        ]],
    );
    let mut index = 6i64;
    let payloads = event.render(
        || {
            index += 1;
            index
        },
        1700000000,
    );
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        std::str::from_utf8(&payloads[0]).unwrap(),
        r#"{"database":"shop","event":{"data":{"id":1,"name":"bob"},"event_type":"insert","time":1700000000},"event_index":7,"table":"users"}"#
    );
}

#[test]
fn test_update_nests_old_and_new_data() {
    let event = simple_event(
        EventKind::Update,
        vec![
            vec![ColumnValue::Int(1), ColumnValue::String("old".to_string())],
            vec![ColumnValue::Int(1), ColumnValue::String("new".to_string())],
        ],
    );
    let msg = render_one(&event);
    assert_eq!(msg["event"]["event_type"], "update");
    assert_eq!(msg["event"]["data"]["old_data"]["name"], "old");
    assert_eq!(msg["event"]["data"]["new_data"]["name"], "new");
}

#[test]
fn test_delete_carries_single_data_object() {
    let event = simple_event(
        EventKind::Delete,
        vec![vec![
            ColumnValue::Int(3),
            ColumnValue::String("gone".to_string()),
        ]],
    );
    let msg = render_one(&event);
    assert_eq!(msg["event"]["event_type"], "delete");
    assert_eq!(msg["event"]["data"]["id"], 3);
    assert!(msg["event"]["data"].get("old_data").is_none());
}

#[test]
fn test_multi_row_insert_assigns_sequential_indexes() {
    let event = simple_event(
        EventKind::Insert,
        vec![
            vec![ColumnValue::Int(1), ColumnValue::Null],
            vec![ColumnValue::Int(2), ColumnValue::Null],
            vec![ColumnValue::Int(3), ColumnValue::Null],
        ],
    );
    let mut index = 0i64;
    let payloads = event.render(
        || {
            index += 1;
            index
        },
        0,
    );
    assert_eq!(payloads.len(), 3);
    for (i, payload) in payloads.iter().enumerate() {
        let msg: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(msg["event_index"], (i + 1) as i64);
    }
}

#[test]
fn test_update_rows_pair_up() {
    let event = simple_event(
        EventKind::Update,
        vec![
            vec![ColumnValue::Int(1), ColumnValue::Null],
            vec![ColumnValue::Int(2), ColumnValue::Null],
            vec![ColumnValue::Int(3), ColumnValue::Null],
            vec![ColumnValue::Int(4), ColumnValue::Null],
        ],
    );
    let mut index = 0i64;
    let payloads = event.render(
        || {
            index += 1;
            index
        },
        0,
    );
    assert_eq!(payloads.len(), 2);
}

#[test]
fn test_update_unpaired_trailing_row_is_ignored() {
    let event = simple_event(
        EventKind::Update,
        vec![
            vec![ColumnValue::Int(1), ColumnValue::Null],
            vec![ColumnValue::Int(2), ColumnValue::Null],
            vec![ColumnValue::Int(3), ColumnValue::Null],
        ],
    );
    let payloads = event.render(|| 1, 0);
    assert_eq!(payloads.len(), 1);
}

#[test]
fn test_table_key_joins_schema_and_table() {
    let event = simple_event(EventKind::Insert, vec![]);
    assert_eq!(event.table_key(), "shop.users");
}

#[test]
fn test_envelope_parses_back_for_relay_routing() {
    let event = simple_event(
        EventKind::Insert,
        vec![vec![ColumnValue::Int(1), ColumnValue::Null]],
    );
    let payloads = event.render(|| 1, 0);
    let envelope: EventEnvelope = serde_json::from_slice(&payloads[0]).unwrap();
    assert_eq!(envelope.database, "shop");
    assert_eq!(envelope.table, "users");
    assert_eq!(envelope.table_key(), "shop.users");
}

// ============================================================================
// Column value rendering
// ============================================================================

#[test]
fn test_null_renders_as_null() {
    assert_eq!(render_value(col(ColumnKind::Int), ColumnValue::Null), Value::Null);
}

#[test]
fn test_missing_trailing_value_renders_as_null() {
    let event = simple_event(EventKind::Insert, vec![vec![ColumnValue::Int(9)]]);
    let msg = render_one(&event);
    assert_eq!(msg["event"]["data"]["id"], 9);
    assert_eq!(msg["event"]["data"]["name"], Value::Null);
}

#[test]
fn test_bytes_render_as_lossy_string() {
    assert_eq!(
        render_value(col(ColumnKind::Bytes), ColumnValue::Bytes(b"blob".to_vec())),
        Value::from("blob")
    );
}

#[test]
fn test_unsigned_tinyint_overflow_correction() {
    // 255 stored unsigned decodes as -1 signed.
    assert_eq!(
        render_value(col(ColumnKind::TinyInt).unsigned(), ColumnValue::TinyInt(-1)),
        Value::from(255)
    );
    // Signed columns keep the negative value.
    assert_eq!(
        render_value(col(ColumnKind::TinyInt), ColumnValue::TinyInt(-1)),
        Value::from(-1)
    );
}

#[test]
fn test_unsigned_smallint_overflow_correction() {
    assert_eq!(
        render_value(col(ColumnKind::SmallInt).unsigned(), ColumnValue::SmallInt(-2)),
        Value::from(65534)
    );
}

#[test]
fn test_unsigned_mediumint_overflow_correction() {
    assert_eq!(
        render_value(col(ColumnKind::MediumInt).unsigned(), ColumnValue::Int(-1)),
        Value::from((1i64 << 24) - 1)
    );
}

#[test]
fn test_unsigned_int_overflow_correction() {
    assert_eq!(
        render_value(col(ColumnKind::Int).unsigned(), ColumnValue::Int(-1)),
        Value::from((1i64 << 32) - 1)
    );
}

#[test]
fn test_unsigned_bigint_reinterprets_bits() {
    assert_eq!(
        render_value(col(ColumnKind::BigInt).unsigned(), ColumnValue::BigInt(-1)),
        Value::from(u64::MAX)
    );
    assert_eq!(
        render_value(col(ColumnKind::BigInt), ColumnValue::BigInt(-1)),
        Value::from(-1)
    );
}

#[test]
fn test_enum_resolves_to_label() {
    let labels = ColumnKind::Enum(vec!["red".to_string(), "green".to_string()]);
    assert_eq!(
        render_value(col(labels.clone()), ColumnValue::BigInt(1)),
        Value::from("red")
    );
    assert_eq!(
        render_value(col(labels), ColumnValue::BigInt(2)),
        Value::from("green")
    );
}

#[test]
fn test_enum_out_of_range_renders_null() {
    let labels = ColumnKind::Enum(vec!["only".to_string()]);
    assert_eq!(render_value(col(labels.clone()), ColumnValue::BigInt(0)), Value::Null);
    assert_eq!(render_value(col(labels), ColumnValue::BigInt(5)), Value::Null);
}

#[test]
fn test_set_joins_flagged_labels() {
    let labels = ColumnKind::Set(vec![
        "a".to_string(),
        "b".to_string(),
        "c".to_string(),
    ]);
    assert_eq!(
        render_value(col(labels.clone()), ColumnValue::BigInt(0b101)),
        Value::from("a,c")
    );
    assert_eq!(render_value(col(labels), ColumnValue::BigInt(0)), Value::from(""));
}

#[test]
fn test_floats_render_with_full_precision() {
    assert_eq!(
        render_value(col(ColumnKind::Double), ColumnValue::Double(1.5)),
        Value::from(1.5)
    );
    let rendered = render_value(col(ColumnKind::Double), ColumnValue::Double(0.1));
    assert_eq!(rendered.as_f64().unwrap(), 0.1);
}

#[test]
fn test_nan_renders_as_null() {
    assert_eq!(
        render_value(col(ColumnKind::Double), ColumnValue::Double(f64::NAN)),
        Value::Null
    );
}

#[test]
fn test_uint_passes_through() {
    assert_eq!(
        render_value(col(ColumnKind::BigInt).unsigned(), ColumnValue::UInt(u64::MAX)),
        Value::from(u64::MAX)
    );
}

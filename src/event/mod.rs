//! Row-change event model and JSON rendering
//!
//! The replication source adapter hands the engine typed row changes; this
//! module renders them into the wire payload carried by `EVENT` frames:
//!
//! ```json
//! {"database":"mydb","event":{"data":{...},"event_type":"insert","time":1700000000},
//!  "event_index":42,"table":"users"}
//! ```
//!
//! Updates nest `{"old_data":{...},"new_data":{...}}` under `data`;
//! insert/delete carry the row object directly. Sink routing uses the
//! combined key `schema.table`; the `table` field stays bare.

#[cfg(test)]
mod tests;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tracing::warn;

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

/// Column type information needed for faithful rendering.
///
/// Only the distinctions that change rendering are modeled: sub-word signed
/// widths for unsigned correction, enum/set label resolution, and the
/// medium-vs-full 4-byte split.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    String,
    Bytes,
    Enum(Vec<String>),
    Set(Vec<String>),
    Other,
}

/// Per-column metadata from the source's table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub unsigned: bool,
    pub kind: ColumnKind,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            unsigned: false,
            kind,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }
}

/// A decoded column value as the source adapter produces it.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// One replication event: a table, an operation, and its rows.
///
/// For updates, `rows` holds (before, after) pairs in sequence; insert and
/// delete carry one row per change. Row values align positionally with
/// `columns`; missing trailing values render as null.
#[derive(Debug, Clone)]
pub struct RowEvent {
    pub schema: String,
    pub table: String,
    pub kind: EventKind,
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<ColumnValue>>,
}

impl RowEvent {
    /// Routing key used by group filters and sink dispatch.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Render every row change in this event, drawing one index per change
    /// from `next_index`, into `EVENT` payloads.
    pub fn render(&self, mut next_index: impl FnMut() -> i64, time: i64) -> Vec<Bytes> {
        let mut out = Vec::new();
        match self.kind {
            EventKind::Update => {
                if self.rows.len() % 2 != 0 {
                    warn!(
                        table = %self.table_key(),
                        rows = self.rows.len(),
                        "update event with unpaired row, ignoring the trailing row"
                    );
                }
                for pair in self.rows.chunks_exact(2) {
                    let data = json!({
                        "old_data": render_row(&self.columns, &pair[0]),
                        "new_data": render_row(&self.columns, &pair[1]),
                    });
                    out.push(self.envelope(data, next_index(), time));
                }
            }
            EventKind::Insert | EventKind::Delete => {
                for row in &self.rows {
                    let data = render_row(&self.columns, row);
                    out.push(self.envelope(data, next_index(), time));
                }
            }
        }
        out
    }

    fn envelope(&self, data: Value, event_index: i64, time: i64) -> Bytes {
        let mut event = Map::new();
        event.insert("data".into(), data);
        event.insert("event_type".into(), Value::from(self.kind.as_str()));
        event.insert("time".into(), Value::from(time));

        let mut root = Map::new();
        root.insert("database".into(), Value::from(self.schema.as_str()));
        root.insert("event".into(), Value::Object(event));
        root.insert("event_index".into(), Value::from(event_index));
        root.insert("table".into(), Value::from(self.table.as_str()));

        // Serializing a Value cannot fail.
        Bytes::from(serde_json::to_vec(&Value::Object(root)).unwrap_or_default())
    }
}

/// The fields of an `EVENT` payload a relay needs to re-route it.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub database: String,
    pub table: String,
}

impl EventEnvelope {
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

fn render_row(columns: &[ColumnMeta], row: &[ColumnValue]) -> Value {
    let mut obj = Map::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let value = match row.get(idx) {
            Some(v) => render_value(v, column),
            None => {
                warn!(column = %column.name, "row missing a value for column, rendering null");
                Value::Null
            }
        };
        obj.insert(column.name.clone(), value);
    }
    Value::Object(obj)
}

/// Render one column value per the source's type metadata.
///
/// Sub-word unsigned values arrive sign-corrupted from the two's-complement
/// decode and get shifted back into their unsigned range; enum and set
/// ordinals resolve to their declared labels.
fn render_value(value: &ColumnValue, column: &ColumnMeta) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::String(s) => Value::from(s.as_str()),
        ColumnValue::Bytes(b) => Value::from(String::from_utf8_lossy(b).into_owned()),
        ColumnValue::TinyInt(v) => {
            let mut r = *v as i64;
            if column.unsigned && r < 0 {
                r += 256;
            }
            Value::from(r)
        }
        ColumnValue::SmallInt(v) => {
            let mut r = *v as i64;
            if column.unsigned && r < 0 {
                r += 65536;
            }
            Value::from(r)
        }
        ColumnValue::Int(v) => {
            let mut r = *v as i64;
            if column.unsigned && r < 0 {
                r += match column.kind {
                    ColumnKind::MediumInt => 1 << 24,
                    _ => 1 << 32,
                };
            }
            Value::from(r)
        }
        ColumnValue::BigInt(v) => match &column.kind {
            ColumnKind::Enum(labels) => {
                let ordinal = *v - 1;
                match usize::try_from(ordinal).ok().and_then(|i| labels.get(i)) {
                    Some(label) => Value::from(label.as_str()),
                    None => {
                        warn!(column = %column.name, ordinal = *v, "enum ordinal out of range");
                        Value::Null
                    }
                }
            }
            ColumnKind::Set(labels) => {
                let bits = *v as u64;
                let joined = labels
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| bits & (1 << i) != 0)
                    .map(|(_, label)| label.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                Value::from(joined)
            }
            _ => {
                if column.unsigned {
                    Value::from(*v as u64)
                } else {
                    Value::from(*v)
                }
            }
        },
        ColumnValue::UInt(v) => Value::from(*v),
        ColumnValue::Float(v) => float_value(*v as f64),
        ColumnValue::Double(v) => float_value(*v),
    }
}

fn float_value(v: f64) -> Value {
    match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None => Value::Null,
    }
}

//! Durable table layout and upstream field mapping.
//!
//! Each stream maps to one table. Every column has a wire tag (or none, for
//! bookkeeping columns), a JSON kind and an optional default; values equal to
//! their default are left out of the encoded row to keep uploads small.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::record::{HISTORY_FLAG_META, HISTORY_FLAG_NOVALUE, PerStream, Stream};

/// JSON/SQL type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    UInt,
    Int,
    Text,
}

impl FieldKind {
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::UInt | Self::Int => "INTEGER",
            Self::Text => "TEXT",
        }
    }
}

/// Condition on the row's `flags` column for exporting a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGate {
    Always,
    /// Only when [`HISTORY_FLAG_META`] is set.
    Meta,
    /// Skipped when [`HISTORY_FLAG_NOVALUE`] is set.
    Value,
}

impl FieldGate {
    const fn passes(self, flags: u64) -> bool {
        match self {
            Self::Always => true,
            Self::Meta => flags & HISTORY_FLAG_META as u64 != 0,
            Self::Value => flags & HISTORY_FLAG_NOVALUE as u64 == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub column: &'static str,
    pub tag: Option<&'static str>,
    pub kind: FieldKind,
    pub default: Option<&'static str>,
    pub gate: FieldGate,
}

const fn field(
    column: &'static str,
    tag: &'static str,
    kind: FieldKind,
    default: Option<&'static str>,
) -> FieldSpec {
    FieldSpec {
        column,
        tag: Some(tag),
        kind,
        default,
        gate: FieldGate::Always,
    }
}

const fn gated(mut spec: FieldSpec, gate: FieldGate) -> FieldSpec {
    spec.gate = gate;
    spec
}

/// Table holding one stream's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub stream: Stream,
    pub table: &'static str,
    /// Key under which the sent watermark is stored in the `ids` table.
    pub lastid_field: &'static str,
    /// Upload document key for this stream.
    pub proto_tag: &'static str,
    pub fields: &'static [FieldSpec],
}

use FieldKind::{Int, Text, UInt};

const HISTORY_FIELDS: &[FieldSpec] = &[
    field("itemid", "itemid", UInt, None),
    field("clock", "clock", Int, None),
    field("ns", "ns", Int, None),
    field("timestamp", "timestamp", Int, Some("0")),
    field("source", "source", Text, Some("")),
    field("severity", "severity", Int, Some("0")),
    gated(field("value", "value", Text, Some("")), FieldGate::Value),
    field("logeventid", "logeventid", Int, Some("0")),
    field("state", "state", Int, Some("0")),
    gated(field("lastlogsize", "lastlogsize", UInt, None), FieldGate::Meta),
    gated(field("mtime", "mtime", Int, None), FieldGate::Meta),
    FieldSpec {
        column: "flags",
        tag: None,
        kind: Int,
        default: None,
        gate: FieldGate::Always,
    },
];

const DISCOVERY_FIELDS: &[FieldSpec] = &[
    field("clock", "clock", Int, None),
    field("druleid", "druleid", UInt, None),
    field("dcheckid", "dcheckid", UInt, None),
    field("ip", "ip", Text, None),
    field("dns", "dns", Text, None),
    field("port", "port", Int, Some("0")),
    field("value", "value", Text, Some("")),
    field("status", "status", Int, Some("0")),
];

const AUTOREG_FIELDS: &[FieldSpec] = &[
    field("clock", "clock", Int, None),
    field("host", "host", Text, None),
    field("listen_ip", "ip", Text, Some("")),
    field("listen_dns", "dns", Text, Some("")),
    field("listen_port", "port", Int, Some("0")),
    field("host_metadata", "host_metadata", Text, Some("")),
    field("flags", "flags", Int, Some("0")),
    field("tls_accepted", "tls_accepted", Int, Some("1")),
];

pub const HISTORY_TABLE: TableSpec = TableSpec {
    stream: Stream::History,
    table: "proxy_history",
    lastid_field: "history_lastid",
    proto_tag: "history data",
    fields: HISTORY_FIELDS,
};

pub const DISCOVERY_TABLE: TableSpec = TableSpec {
    stream: Stream::Discovery,
    table: "proxy_dhistory",
    lastid_field: "dhistory_lastid",
    proto_tag: "discovery data",
    fields: DISCOVERY_FIELDS,
};

pub const AUTOREG_TABLE: TableSpec = TableSpec {
    stream: Stream::Autoreg,
    table: "proxy_autoreg_host",
    lastid_field: "autoreg_host_lastid",
    proto_tag: "auto registration",
    fields: AUTOREG_FIELDS,
};

/// Table layout for all three streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSet {
    tables: PerStream<TableSpec>,
}

impl Default for TableSet {
    fn default() -> Self {
        Self::new(HISTORY_TABLE, DISCOVERY_TABLE, AUTOREG_TABLE)
    }
}

impl TableSet {
    /// Custom layout. Each spec must name the stream it is installed for.
    #[must_use]
    pub fn new(history: TableSpec, discovery: TableSpec, autoreg: TableSpec) -> Self {
        debug_assert_eq!(history.stream, Stream::History);
        debug_assert_eq!(discovery.stream, Stream::Discovery);
        debug_assert_eq!(autoreg.stream, Stream::Autoreg);
        Self {
            tables: PerStream {
                history,
                discovery,
                autoreg,
            },
        }
    }

    #[must_use]
    pub fn get(&self, stream: Stream) -> &TableSpec {
        &self.tables[stream]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter().map(|(_, spec)| spec)
    }
}

/// One record in upload form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedRow {
    #[serde(skip)]
    pub id: u64,
    #[serde(skip)]
    pub write_clock: u64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EncodedRow {
    /// Serialized size in the upload document.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        // Two bytes for the separator and the object braces slack.
        serde_json::to_vec(&self.fields).map_or(0, |bytes| bytes.len()) + 2
    }
}

fn default_matches(value: &Value, default: &str) -> bool {
    match value {
        Value::String(s) => s == default,
        Value::Number(n) => n.to_string() == default,
        Value::Null => true,
        _ => false,
    }
}

/// Encode column values into upload form per `spec`.
#[must_use]
pub fn encode_row(
    spec: &TableSpec,
    id: u64,
    write_clock: u64,
    columns: &[(&'static str, Value)],
) -> EncodedRow {
    let lookup = |name: &str| {
        columns
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, value)| value)
    };
    let flags = lookup("flags").and_then(Value::as_u64).unwrap_or(0);

    let mut fields = Map::new();
    fields.insert("id".to_string(), Value::from(id));
    for field in spec.fields {
        let Some(tag) = field.tag else { continue };
        if !field.gate.passes(flags) {
            continue;
        }
        let Some(value) = lookup(field.column) else {
            continue;
        };
        if field.default.is_some_and(|d| default_matches(value, d)) {
            continue;
        }
        fields.insert(tag.to_string(), value.clone());
    }

    EncodedRow {
        id,
        write_clock,
        fields,
    }
}

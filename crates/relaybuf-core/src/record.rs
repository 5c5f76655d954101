//! Buffered record types.
//!
//! Three independent streams flow through the buffer, each with its own id
//! sequence: item history values, network discovery results and active agent
//! autoregistration events. Ids are assigned by the buffer at admission and
//! are the only ordering key inside a stream.

use std::fmt;
use std::mem::size_of;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record stream identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    History,
    Discovery,
    Autoreg,
}

impl Stream {
    pub const ALL: [Self; 3] = [Self::History, Self::Discovery, Self::Autoreg];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::History => 0,
            Self::Discovery => 1,
            Self::Autoreg => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Discovery => "discovery",
            Self::Autoreg => "autoreg",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One value per stream, indexable by [`Stream`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerStream<T> {
    pub history: T,
    pub discovery: T,
    pub autoreg: T,
}

impl<T> PerStream<T> {
    pub fn from_fn(mut f: impl FnMut(Stream) -> T) -> Self {
        Self {
            history: f(Stream::History),
            discovery: f(Stream::Discovery),
            autoreg: f(Stream::Autoreg),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stream, &T)> {
        [
            (Stream::History, &self.history),
            (Stream::Discovery, &self.discovery),
            (Stream::Autoreg, &self.autoreg),
        ]
        .into_iter()
    }
}

impl<T> Index<Stream> for PerStream<T> {
    type Output = T;

    fn index(&self, stream: Stream) -> &T {
        match stream {
            Stream::History => &self.history,
            Stream::Discovery => &self.discovery,
            Stream::Autoreg => &self.autoreg,
        }
    }
}

impl<T> IndexMut<Stream> for PerStream<T> {
    fn index_mut(&mut self, stream: Stream) -> &mut T {
        match stream {
            Stream::History => &mut self.history,
            Stream::Discovery => &mut self.discovery,
            Stream::Autoreg => &mut self.autoreg,
        }
    }
}

/// Logical timestamp with sub-second ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub ns: i32,
}

impl Timespec {
    #[must_use]
    pub const fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }
}

/// History flag: export `lastlogsize` and `mtime`.
pub const HISTORY_FLAG_META: u32 = 0x01;
/// History flag: the record carries no value (meta-only update).
pub const HISTORY_FLAG_NOVALUE: u32 = 0x02;

/// Processing state of a history value.
pub const ITEM_STATE_NORMAL: i32 = 0;
pub const ITEM_STATE_NOTSUPPORTED: i32 = 1;

/// Collected item value awaiting upstream delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub itemid: u64,
    /// Cumulative log size; non-decreasing per item.
    pub lastlogsize: u64,
    pub ts: Timespec,
    pub value: String,
    pub source: Option<String>,
    pub timestamp: i64,
    pub severity: i32,
    pub logeventid: i32,
    pub state: i32,
    pub mtime: i32,
    pub flags: u32,
}

impl HistoryRecord {
    #[must_use]
    pub fn new(itemid: u64, ts: Timespec, value: impl Into<String>) -> Self {
        Self {
            itemid,
            ts,
            value: value.into(),
            ..Self::default()
        }
    }

    /// Log-item metadata.
    #[must_use]
    pub fn with_log_meta(
        mut self,
        source: impl Into<String>,
        timestamp: i64,
        severity: i32,
        logeventid: i32,
    ) -> Self {
        self.source = Some(source.into());
        self.timestamp = timestamp;
        self.severity = severity;
        self.logeventid = logeventid;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, lastlogsize: u64, mtime: i32) -> Self {
        self.lastlogsize = lastlogsize;
        self.mtime = mtime;
        self.flags |= HISTORY_FLAG_META;
        self
    }
}

/// Network discovery check result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub id: u64,
    pub druleid: u64,
    pub dcheckid: u64,
    pub ip: String,
    pub dns: String,
    pub port: i32,
    pub value: Option<String>,
    pub status: i32,
    pub clock: i64,
}

/// Active agent autoregistration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoregRecord {
    pub id: u64,
    pub host: String,
    pub listen_ip: String,
    pub listen_dns: String,
    pub host_metadata: String,
    pub listen_port: i32,
    pub tls_accepted: i32,
    pub flags: i32,
    pub clock: i64,
}

/// A record of any stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum Record {
    History(HistoryRecord),
    Discovery(DiscoveryRecord),
    Autoreg(AutoregRecord),
}

fn owned_str(s: &str) -> usize {
    s.len() + 1
}

impl Record {
    #[must_use]
    pub const fn stream(&self) -> Stream {
        match self {
            Self::History(_) => Stream::History,
            Self::Discovery(_) => Stream::Discovery,
            Self::Autoreg(_) => Stream::Autoreg,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::History(r) => r.id,
            Self::Discovery(r) => r.id,
            Self::Autoreg(r) => r.id,
        }
    }

    pub fn set_id(&mut self, id: u64) {
        match self {
            Self::History(r) => r.id = id,
            Self::Discovery(r) => r.id = id,
            Self::Autoreg(r) => r.id = id,
        }
    }

    /// Bytes charged against the memory quota when this record is held in
    /// memory: the fixed record body plus every owned string and its
    /// terminator.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        match self {
            Self::History(r) => {
                size_of::<HistoryRecord>()
                    + owned_str(&r.value)
                    + r.source.as_deref().map_or(0, owned_str)
            }
            Self::Discovery(r) => {
                size_of::<DiscoveryRecord>()
                    + owned_str(&r.ip)
                    + owned_str(&r.dns)
                    + r.value.as_deref().map_or(0, owned_str)
            }
            Self::Autoreg(r) => {
                size_of::<AutoregRecord>()
                    + owned_str(&r.host)
                    + owned_str(&r.listen_ip)
                    + owned_str(&r.listen_dns)
                    + owned_str(&r.host_metadata)
            }
        }
    }

    /// Column values keyed by durable column name. The same set is written
    /// to the database and encoded for upstream, so a record exports
    /// identically from either tier.
    #[must_use]
    pub fn columns(&self) -> Vec<(&'static str, Value)> {
        match self {
            Self::History(r) => vec![
                ("itemid", Value::from(r.itemid)),
                ("clock", Value::from(r.ts.sec)),
                ("ns", Value::from(r.ts.ns)),
                ("timestamp", Value::from(r.timestamp)),
                ("source", Value::from(r.source.clone().unwrap_or_default())),
                ("severity", Value::from(r.severity)),
                ("value", Value::from(r.value.clone())),
                ("logeventid", Value::from(r.logeventid)),
                ("state", Value::from(r.state)),
                ("lastlogsize", Value::from(r.lastlogsize)),
                ("mtime", Value::from(r.mtime)),
                ("flags", Value::from(r.flags)),
            ],
            Self::Discovery(r) => vec![
                ("clock", Value::from(r.clock)),
                ("druleid", Value::from(r.druleid)),
                ("dcheckid", Value::from(r.dcheckid)),
                ("ip", Value::from(r.ip.clone())),
                ("dns", Value::from(r.dns.clone())),
                ("port", Value::from(r.port)),
                ("value", Value::from(r.value.clone().unwrap_or_default())),
                ("status", Value::from(r.status)),
            ],
            Self::Autoreg(r) => vec![
                ("clock", Value::from(r.clock)),
                ("host", Value::from(r.host.clone())),
                ("listen_ip", Value::from(r.listen_ip.clone())),
                ("listen_dns", Value::from(r.listen_dns.clone())),
                ("listen_port", Value::from(r.listen_port)),
                ("host_metadata", Value::from(r.host_metadata.clone())),
                ("flags", Value::from(r.flags)),
                ("tls_accepted", Value::from(r.tls_accepted)),
            ],
        }
    }
}

impl From<HistoryRecord> for Record {
    fn from(r: HistoryRecord) -> Self {
        Self::History(r)
    }
}

impl From<DiscoveryRecord> for Record {
    fn from(r: DiscoveryRecord) -> Self {
        Self::Discovery(r)
    }
}

impl From<AutoregRecord> for Record {
    fn from(r: AutoregRecord) -> Self {
        Self::Autoreg(r)
    }
}

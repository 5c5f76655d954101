//! Upstream delivery.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::TransportError;
use crate::export::Batch;
use crate::record::Stream;
use crate::tables::{EncodedRow, TableSpec};

/// One batch as an upload document: `{"<proto tag>": [rows], "clock": n}`.
#[derive(Debug, Clone, Copy)]
pub struct UploadBatch<'a> {
    pub proto_tag: &'static str,
    pub stream: Stream,
    pub rows: &'a [EncodedRow],
    /// Send time, seconds since epoch.
    pub clock: u64,
}

impl<'a> UploadBatch<'a> {
    #[must_use]
    pub fn new(spec: &TableSpec, batch: &'a Batch, clock: u64) -> Self {
        Self {
            proto_tag: spec.proto_tag,
            stream: batch.stream,
            rows: &batch.rows,
            clock,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for UploadBatch<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(self.proto_tag, self.rows)?;
        map.serialize_entry("clock", &self.clock)?;
        map.end()
    }
}

/// Delivers upload documents. Success means the batch may be confirmed.
pub trait Transport: Send + Sync {
    fn send(&self, batch: &UploadBatch<'_>) -> Result<(), TransportError>;
}

/// Writes each upload document as one JSON line.
pub struct JsonLinesTransport<W: Write + Send> {
    writer: Mutex<W>,
    max_payload: usize,
}

impl<W: Write + Send> std::fmt::Debug for JsonLinesTransport<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesTransport")
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

impl JsonLinesTransport<BufWriter<File>> {
    /// Append to the file at `path`, creating it if needed.
    pub fn append_to(path: impl AsRef<Path>, max_payload: usize) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::new(BufWriter::new(file), max_payload))
    }
}

impl<W: Write + Send> JsonLinesTransport<W> {
    #[must_use]
    pub fn new(writer: W, max_payload: usize) -> Self {
        Self {
            writer: Mutex::new(writer),
            max_payload,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> Transport for JsonLinesTransport<W> {
    fn send(&self, batch: &UploadBatch<'_>) -> Result<(), TransportError> {
        let mut payload = batch.to_json_bytes()?;
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }
        payload.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HistoryRecord, Record, Timespec};
    use crate::state::BufferState;
    use crate::tables::{HISTORY_TABLE, encode_row};

    fn batch(values: &[&str]) -> Batch {
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let record = Record::from(HistoryRecord::new(3, Timespec::new(10, 0), *value));
                encode_row(&HISTORY_TABLE, i as u64 + 1, 0, &record.columns())
            })
            .collect();
        Batch {
            stream: Stream::History,
            rows,
            bytes: 0,
            degraded: false,
            data_loss: Vec::new(),
            more: false,
            state: BufferState::Memory,
            after_id: 0,
        }
    }

    #[test]
    fn document_is_keyed_by_protocol_tag() {
        let batch = batch(&["1", "2"]);
        let upload = UploadBatch::new(&HISTORY_TABLE, &batch, 1_700_000_000);
        let doc: serde_json::Value =
            serde_json::from_slice(&upload.to_json_bytes().unwrap()).unwrap();
        assert_eq!(doc["history data"][0]["id"], 1);
        assert_eq!(doc["history data"][1]["value"], "2");
        assert_eq!(doc["clock"], 1_700_000_000u64);
    }

    #[test]
    fn json_lines_writes_one_line_per_batch() {
        let transport = JsonLinesTransport::new(Vec::new(), 1 << 20);
        let first = batch(&["a"]);
        let second = batch(&["b", "c"]);
        transport
            .send(&UploadBatch::new(&HISTORY_TABLE, &first, 1))
            .unwrap();
        transport
            .send(&UploadBatch::new(&HISTORY_TABLE, &second, 2))
            .unwrap();
        let output = String::from_utf8(transport.into_inner()).unwrap();
        assert_eq!(output.lines().count(), 2);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let transport = JsonLinesTransport::new(Vec::new(), 64);
        let value = "x".repeat(100);
        let big = batch(&[value.as_str()]);
        let err = transport
            .send(&UploadBatch::new(&HISTORY_TABLE, &big, 1))
            .unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { limit: 64, .. }));
        assert!(transport.into_inner().is_empty());
    }
}

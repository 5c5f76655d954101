//! Export cycle and async worker against a recording transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::*;
use relaybuf_core::clock::ManualClock;
use relaybuf_core::{
    AutoregRecord, BufferMode, BufferState, DurableStore, ExportWorker, Exporter,
    JsonLinesTransport, ProxyBuffer, Stream,
};

fn exporter(buffer: Arc<ProxyBuffer>, transport: Arc<RecordingTransport>) -> Exporter {
    Exporter::new(buffer, transport).with_housekeep_period(0)
}

#[test]
fn cycle_exports_each_stream_once() {
    let clock = ManualClock::new(T0);
    let buffer = Arc::new(open(config(BufferMode::Hybrid, 1 << 20), memory_store(), &clock));
    for i in 0..3 {
        buffer.submit(history(&i.to_string())).unwrap();
    }
    buffer
        .submit(AutoregRecord {
            host: "agent-1".into(),
            ..AutoregRecord::default()
        })
        .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let exporter = exporter(Arc::clone(&buffer), Arc::clone(&transport));

    let report = exporter.run_cycle();
    assert_eq!(report.batches, 2);
    assert_eq!(report.records[Stream::History], 3);
    assert_eq!(report.records[Stream::Autoreg], 1);
    assert_eq!(transport.ids(Stream::History), vec![1, 2, 3]);
    assert_eq!(transport.ids(Stream::Autoreg), vec![1]);

    let report = exporter.run_cycle();
    assert_eq!(report.total_records(), 0);
}

#[test]
fn cycle_respects_total_record_cap() {
    let clock = ManualClock::new(T0);
    let mut cfg = config(BufferMode::Memory, 1 << 20);
    cfg.export.max_records = 4;
    cfg.export.max_records_total = 10;
    let buffer = Arc::new(open(cfg, memory_store(), &clock));
    for i in 0..14 {
        buffer.submit(history(&i.to_string())).unwrap();
    }
    for host in ["agent-1", "agent-2"] {
        buffer
            .submit(AutoregRecord {
                host: host.into(),
                ..AutoregRecord::default()
            })
            .unwrap();
    }

    let transport = Arc::new(RecordingTransport::default());
    let exporter = exporter(Arc::clone(&buffer), Arc::clone(&transport));

    // History fills the cycle with batches of 4, 4 and 2; autoreg waits.
    let report = exporter.run_cycle();
    assert_eq!(report.records[Stream::History], 10);
    assert_eq!(report.records[Stream::Autoreg], 0);
    assert_eq!(report.batches, 3);
    assert_eq!(transport.ids(Stream::History), (1..=10).collect::<Vec<u64>>());

    let report = exporter.run_cycle();
    assert_eq!(report.records[Stream::History], 4);
    assert_eq!(report.records[Stream::Autoreg], 2);
    assert_eq!(report.total_records(), 6);

    assert_eq!(exporter.drain(100).cycles, 1);
    assert_eq!(transport.ids(Stream::History), (1..=14).collect::<Vec<u64>>());
    assert_eq!(transport.ids(Stream::Autoreg), vec![1, 2]);
}

#[test]
fn failed_send_keeps_batch_for_next_cycle() {
    let clock = ManualClock::new(T0);
    let buffer = Arc::new(open(config(BufferMode::Hybrid, 1 << 20), memory_store(), &clock));
    buffer.submit(history("a")).unwrap();
    buffer.submit(history("b")).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let exporter = exporter(Arc::clone(&buffer), Arc::clone(&transport));

    transport.fail.store(true, Ordering::SeqCst);
    let report = exporter.run_cycle();
    assert_eq!(report.failed_sends, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(buffer.watermarks(Stream::History).sent, 0);

    transport.fail.store(false, Ordering::SeqCst);
    let drained = exporter.drain(10);
    assert_eq!(drained.failed_sends, 0);
    assert_eq!(transport.ids(Stream::History), vec![1, 2]);
}

#[test]
fn cycle_promotes_hybrid_buffer_back_to_memory() {
    let clock = ManualClock::new(T0);
    let buffer = Arc::new(open(config(BufferMode::Hybrid, 1 << 20), memory_store(), &clock));
    buffer.fallback_to_database("maintenance").unwrap();
    assert_eq!(buffer.current_state(), BufferState::Database);
    buffer.submit(history("durable")).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let exporter = exporter(Arc::clone(&buffer), Arc::clone(&transport));
    let report = exporter.run_cycle();
    assert!(report.promoted);
    assert_eq!(buffer.current_state(), BufferState::Memory);
    assert_eq!(transport.ids(Stream::History), vec![1]);
}

#[test]
fn cycle_runs_housekeeping_when_due() {
    let clock = ManualClock::new(T0);
    let store = memory_store();
    let buffer = Arc::new(open(config(BufferMode::Disk, 0), store.clone(), &clock));
    buffer.submit(history("a")).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let exporter = Exporter::new(Arc::clone(&buffer), transport).with_housekeep_period(3600);

    // Housekeeping runs after the batch is confirmed in the same cycle.
    let report = exporter.run_cycle();
    let housekeeping = report.housekeeping.expect("first cycle housekeeps");
    assert_eq!(housekeeping.deleted[Stream::History], 1);

    buffer.submit(history("b")).unwrap();
    assert!(exporter.run_cycle().housekeeping.is_none());
    clock.advance(3600);
    assert!(exporter.run_cycle().housekeeping.is_some());
    assert_eq!(store.count_after(Stream::History, 0).unwrap(), 0);
}

#[test]
fn json_lines_transport_writes_upload_documents() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("upload.jsonl");
    let clock = ManualClock::new(T0);
    let buffer = Arc::new(open(config(BufferMode::Memory, 1 << 20), memory_store(), &clock));
    buffer.submit(history("42.5")).unwrap();

    let transport = Arc::new(JsonLinesTransport::append_to(&out, 1 << 20).unwrap());
    let exporter = Exporter::new(Arc::clone(&buffer), transport).with_housekeep_period(0);
    assert_eq!(exporter.drain(5).records[Stream::History], 1);

    let text = std::fs::read_to_string(&out).unwrap();
    let doc: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(doc["history data"][0]["id"], 1);
    assert_eq!(doc["history data"][0]["value"], "42.5");
    assert_eq!(doc["clock"], T0);
}

#[tokio::test]
async fn worker_exports_until_shutdown() {
    let clock = ManualClock::new(T0);
    let buffer = Arc::new(open(config(BufferMode::Hybrid, 1 << 20), memory_store(), &clock));
    let transport = Arc::new(RecordingTransport::default());
    let exporter = Arc::new(exporter(Arc::clone(&buffer), Arc::clone(&transport)));
    let worker = ExportWorker::new(exporter).with_interval(Duration::from_millis(10));

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    for i in 0..5 {
        buffer.submit(history(&i.to_string())).unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..200 {
        delivered = transport.ids(Stream::History);
        if delivered.len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, vec![1, 2, 3, 4, 5]);

    shutdown.store(true, Ordering::Relaxed);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .expect("worker task");
}

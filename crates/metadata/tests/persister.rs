//! Result persister against an in-memory result queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use imgflow_bus::metrics::names;
use imgflow_bus::queues::{FETCHER_SOURCE, RESULT_QUEUE};
use imgflow_bus::{
    Envelope, MemoryQueue, MetricsCollector, ProcessedResult, ProcessingType, QueueMessage,
    QueueSender, ResultStatus, TraceContext,
};
use imgflow_metadata::{
    ImageRecord, MemoryRecordStore, NewImageRecord, PersistError, PersistOutcome, RecordStore,
    ResultPersister,
};

fn result(url: &str, kind: ProcessingType) -> ProcessedResult {
    ProcessedResult {
        source_url: url.into(),
        storage_path: format!("s3://images/20240101000000_000000000_{kind}.jpg"),
        status: ResultStatus::Success,
        error_msg: None,
        trace_id: "trace-7".into(),
        width: 320,
        height: 200,
        format: "png".into(),
        file_size: 4096,
        processing_type: kind,
    }
}

async fn publish(queue: &MemoryQueue, result: &ProcessedResult) {
    let body = Envelope::encode(&result.trace_id, FETCHER_SOURCE, result).unwrap();
    let ctx = TraceContext::root(result.trace_id.clone());
    queue
        .send(QueueMessage::with_headers(body, ctx.carrier()))
        .await
        .unwrap();
}

fn persister(queue: Arc<MemoryQueue>, store: Arc<dyn RecordStore>) -> ResultPersister {
    ResultPersister::new(queue, store, MetricsCollector::new("metadata-service"))
}

/// Rejects every insert.
struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn insert(&self, _: &NewImageRecord) -> Result<i64, PersistError> {
        Err(PersistError::Other("connection refused".into()))
    }

    async fn recent(&self, _: i64) -> Result<Vec<ImageRecord>, PersistError> {
        Ok(Vec::new())
    }

    async fn by_id(&self, _: i64) -> Result<Option<ImageRecord>, PersistError> {
        Ok(None)
    }
}

#[tokio::test]
async fn stores_one_row_per_result_with_envelope_time() {
    let queue = Arc::new(MemoryQueue::new(RESULT_QUEUE));
    let store = Arc::new(MemoryRecordStore::new());
    let before = Utc::now();
    publish(&queue, &result("http://img.test/a.png", ProcessingType::Original)).await;
    publish(&queue, &result("http://img.test/a.png", ProcessingType::Sharpen)).await;
    queue.close();

    let persister = persister(queue, store.clone());
    persister.run().await.unwrap();

    assert_eq!(store.len(), 2);
    let rows = store.recent(10).await.unwrap();
    for row in &rows {
        assert_eq!(row.source_url, "http://img.test/a.png");
        assert_eq!(row.status, "success");
        assert_eq!(row.trace_id, "trace-7");
        assert_eq!((row.width, row.height), (320, 200));
        assert_eq!(row.format, "png");
        assert_eq!(row.file_size, 4096);
        assert!(row.processed_at >= before && row.processed_at <= Utc::now());
    }
    let mut kinds: Vec<_> = rows.iter().map(|r| r.processing_type.as_str()).collect();
    kinds.sort();
    assert_eq!(kinds, ["original", "sharpen"]);

    let metrics = persister.metrics();
    assert_eq!(metrics.counter(names::RECORDS_STORED, "success"), 2);
    assert_eq!(metrics.timing_count(names::STORAGE_DURATION, "insert"), 2);
}

#[tokio::test]
async fn undecodable_result_is_counted_and_skipped() {
    let queue = Arc::new(MemoryQueue::with_manual_ack(RESULT_QUEUE));
    let store = Arc::new(MemoryRecordStore::new());
    queue.send(QueueMessage::new(b"not json".to_vec())).await.unwrap();
    let bad_payload = Envelope::encode("t", FETCHER_SOURCE, &serde_json::json!({ "url": 1 })).unwrap();
    queue.send(QueueMessage::new(bad_payload)).await.unwrap();
    publish(&queue, &result("http://img.test/ok.png", ProcessingType::Blur)).await;
    queue.close();

    let persister = persister(queue.clone(), store.clone());
    persister.run().await.unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(persister.metrics().counter(names::RECORDS_STORED, "decode_error"), 2);
    assert_eq!(persister.metrics().counter(names::RECORDS_STORED, "success"), 1);
    assert_eq!(queue.unacked_count(), 0, "bad messages are still consumed");
}

#[tokio::test]
async fn store_failure_is_counted_and_the_message_consumed() {
    let queue = Arc::new(MemoryQueue::with_manual_ack(RESULT_QUEUE));
    publish(&queue, &result("http://img.test/a.png", ProcessingType::Resize)).await;
    publish(&queue, &result("http://img.test/b.png", ProcessingType::Resize)).await;
    queue.close();

    let persister = persister(queue.clone(), Arc::new(BrokenStore));
    persister.run().await.unwrap();

    assert_eq!(persister.metrics().counter(names::RECORDS_STORED, "error"), 2);
    assert_eq!(queue.unacked_count(), 0);
}

#[tokio::test]
async fn handle_reports_the_outcome() {
    let queue = Arc::new(MemoryQueue::new(RESULT_QUEUE));
    let store = Arc::new(MemoryRecordStore::new());
    publish(&queue, &result("http://img.test/a.png", ProcessingType::Grayscale)).await;
    queue.send(QueueMessage::new(b"{}".to_vec())).await.unwrap();

    let persister = persister(queue.clone(), store.clone());
    let first = imgflow_bus::QueueReceiver::recv(queue.as_ref()).await.unwrap();
    assert_eq!(persister.handle(&first).await, PersistOutcome::Stored { id: 1 });
    let second = imgflow_bus::QueueReceiver::recv(queue.as_ref()).await.unwrap();
    assert_eq!(persister.handle(&second).await, PersistOutcome::DecodeFailed);
}

#[tokio::test]
async fn recent_orders_by_processing_time() {
    let store = MemoryRecordStore::new();
    let now = Utc::now();
    for (offset, url) in [(3, "oldest"), (1, "newest"), (2, "middle")] {
        let record = NewImageRecord::from_result(
            now - Duration::minutes(offset),
            &result(url, ProcessingType::Original),
        );
        store.insert(&record).await.unwrap();
    }

    let urls: Vec<_> = store
        .recent(10)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.source_url)
        .collect();
    assert_eq!(urls, ["newest", "middle", "oldest"]);
}

#[tokio::test]
async fn shutdown_stops_an_idle_persister() {
    let queue = Arc::new(MemoryQueue::new(RESULT_QUEUE));
    let persister = Arc::new(persister(queue, Arc::new(MemoryRecordStore::new())));

    let running = tokio::spawn({
        let persister = persister.clone();
        async move { persister.run().await }
    });
    persister.shutdown();
    tokio::time::timeout(std::time::Duration::from_secs(5), running)
        .await
        .expect("persister did not stop")
        .unwrap()
        .unwrap();
}

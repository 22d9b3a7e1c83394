use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use imgflow_bus::metrics::metrics_router;
use imgflow_bus::{MetricsCollector, ProcessedResult, ProcessingType, ResultStatus};
use imgflow_metadata::{records_router, MemoryRecordStore, NewImageRecord, RecordStore};
use serde_json::Value;
use tower::ServiceExt;

async fn seeded(count: i64) -> Arc<MemoryRecordStore> {
    let store = Arc::new(MemoryRecordStore::new());
    let now = Utc::now();
    for i in 0..count {
        let result = ProcessedResult {
            source_url: format!("http://img.test/{i}.png"),
            storage_path: format!("s3://images/{i}_original.jpg"),
            status: ResultStatus::Success,
            error_msg: None,
            trace_id: String::new(),
            width: 10,
            height: 10,
            format: "png".into(),
            file_size: 100,
            processing_type: ProcessingType::Original,
        };
        store
            .insert(&NewImageRecord::from_result(now + Duration::seconds(i), &result))
            .await
            .unwrap();
    }
    store
}

fn app(store: Arc<MemoryRecordStore>) -> Router {
    metrics_router(MetricsCollector::new("metadata-service"), "/metrics").merge(records_router(store))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn lists_newest_first_with_limit() {
    let app = app(seeded(5).await);

    let (status, body) = get(app.clone(), "/records?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["source_url"], "http://img.test/4.png");
    assert_eq!(rows[1]["source_url"], "http://img.test/3.png");
    assert_eq!(rows[0]["processing_type"], "original");

    let (_, body) = get(app, "/records").await;
    assert_eq!(body.as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn zero_limit_is_clamped_to_one() {
    let (_, body) = get(app(seeded(3).await), "/records?limit=0").await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn fetches_by_id_or_404() {
    let app = app(seeded(2).await);

    let (status, body) = get(app.clone(), "/records/2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 2);
    assert_eq!(body["source_url"], "http://img.test/1.png");

    let (status, body) = get(app, "/records/42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("42"));
}

#[tokio::test]
async fn metrics_and_health_share_the_port() {
    let app = app(seeded(0).await);
    let (status, _) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());
}

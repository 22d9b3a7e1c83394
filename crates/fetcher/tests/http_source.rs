//! HttpImageSource against a local axum server.

use std::io::Cursor;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use image::{DynamicImage, ImageFormat, RgbImage};
use imgflow_fetcher::{DownloadError, HttpImageSource, ImageSource};

fn encoded(format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::new(30, 20));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

async fn serve() -> String {
    let png = encoded(ImageFormat::Png);
    let jpeg = encoded(ImageFormat::Jpeg);
    let app = Router::new()
        .route("/cat.png", get(move || async move { png }))
        .route("/cat.jpg", get(move || async move { jpeg }))
        .route("/text", get(|| async { "hello" }))
        .route("/gone", get(|| async { StatusCode::NOT_FOUND }))
        .route("/slow", get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn downloads_and_reports_format() {
    let base = serve().await;
    let source = HttpImageSource::new(Duration::from_secs(5)).unwrap();

    let png = source.download(&format!("{base}/cat.png")).await.unwrap();
    assert_eq!(png.format, "png");
    assert_eq!((png.width(), png.height()), (30, 20));

    let jpeg = source.download(&format!("{base}/cat.jpg")).await.unwrap();
    assert_eq!(jpeg.format, "jpeg");
}

#[tokio::test]
async fn non_200_is_an_error() {
    let base = serve().await;
    let source = HttpImageSource::new(Duration::from_secs(5)).unwrap();
    let err = source.download(&format!("{base}/gone")).await.unwrap_err();
    assert!(matches!(err, DownloadError::Status(404)));
}

#[tokio::test]
async fn non_image_body_fails_to_decode() {
    let base = serve().await;
    let source = HttpImageSource::new(Duration::from_secs(5)).unwrap();
    let err = source.download(&format!("{base}/text")).await.unwrap_err();
    assert!(matches!(err, DownloadError::Decode(_)));
}

#[tokio::test]
async fn slow_server_hits_the_timeout() {
    let base = serve().await;
    let source = HttpImageSource::new(Duration::from_millis(200)).unwrap();
    let err = source.download(&format!("{base}/slow")).await.unwrap_err();
    assert!(matches!(err, DownloadError::Request(_)));
}

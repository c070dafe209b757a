// Exercises ClassifierClient against an in-process HTTP server that plays
// both the media host and the classifier service.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use classifier_client::{
    ClassifierClient, ClassifierError, ClassifierOptions, Decision, VerdictSource, TEMP_PREFIX,
};
use serde_json::{json, Value};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

async fn moderate(State(captured): State<Captured>, mut multipart: Multipart) -> Json<Value> {
    let mut fields = HashMap::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let content_type = field.content_type().unwrap_or_default().to_string();
            let bytes = field.bytes().await.unwrap();
            fields.insert("file_len".to_string(), bytes.len().to_string());
            fields.insert("file_type".to_string(), content_type);
        } else {
            fields.insert(name, field.text().await.unwrap());
        }
    }
    captured.lock().unwrap().push(fields);

    Json(json!({
        "content_level": 4,
        "decision": "BLOCK",
        "confidence": 0.97,
        "explanation": "explicit content",
        "processing_time": 0.4,
        "is_video": false,
        "model_version": "ignored",
    }))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start() -> (String, Captured) {
    let captured: Captured = Arc::default();
    let router = Router::new()
        .route(
            "/media/ok.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG.to_vec()) }),
        )
        .route(
            "/media/mislabeled.mp4",
            get(|| async { ([(header::CONTENT_TYPE, "video/mp4")], PNG.to_vec()) }),
        )
        .route(
            "/media/empty.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], Vec::<u8>::new()) }),
        )
        .route(
            "/media/broken.png",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .route("/moderate", post(moderate))
        .route("/moderate_dispute", post(moderate))
        .with_state(captured.clone());
    (serve(router).await, captured)
}

fn client(base: &str, temp_dir: &Path) -> ClassifierClient {
    ClassifierClient::new(ClassifierOptions::new(base, temp_dir)).unwrap()
}

fn leftover_temp_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn url_is_downloaded_and_classified() {
    let (base, captured) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let client = client(&base, temp.path());

    let verdict = client
        .moderate_url(&format!("{base}/media/ok.png"))
        .await
        .unwrap();

    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(verdict.content_level, 4);
    assert_eq!(verdict.explanation, "explicit content");
    assert_eq!(verdict.source, VerdictSource::Classifier);

    let calls = captured.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["threshold"], "0.50");
    assert_eq!(calls[0]["moderation_mode"], "full");
    assert_eq!(calls[0]["file_type"], "image/png");
    assert_eq!(calls[0]["file_len"], PNG.len().to_string());
    assert!(!calls[0].contains_key("dispute_reason"));

    assert_eq!(leftover_temp_files(temp.path()), 0);
}

#[tokio::test]
async fn dispute_sends_reason_and_lower_threshold() {
    let (base, captured) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let client = client(&base, temp.path());

    client
        .moderate_dispute_url(&format!("{base}/media/ok.png"), "this is a painting")
        .await
        .unwrap();

    let calls = captured.lock().unwrap().clone();
    assert_eq!(calls[0]["threshold"], "0.35");
    assert_eq!(calls[0]["dispute_reason"], "this is a painting");
}

#[tokio::test]
async fn failed_download_fails_open() {
    let (base, captured) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let client = client(&base, temp.path());

    let verdict = client
        .moderate_url(&format!("{base}/media/broken.png"))
        .await
        .unwrap();

    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.source, VerdictSource::FailOpen);
    assert!(verdict.explanation.contains("Failed to download"));
    assert!(captured.lock().unwrap().is_empty());
    assert_eq!(leftover_temp_files(temp.path()), 0);
}

#[tokio::test]
async fn mismatched_media_type_is_rejected_and_cleaned_up() {
    let (base, captured) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let client = client(&base, temp.path());

    let err = client
        .moderate_url(&format!("{base}/media/mislabeled.mp4"))
        .await
        .unwrap_err();

    assert!(matches!(err, ClassifierError::InvalidMedia(_)));
    assert!(captured.lock().unwrap().is_empty());
    assert_eq!(leftover_temp_files(temp.path()), 0);
}

#[tokio::test]
async fn empty_download_is_rejected() {
    let (base, _) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let client = client(&base, temp.path());

    let err = client
        .moderate_url(&format!("{base}/media/empty.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClassifierError::InvalidMedia(_)));
}

#[tokio::test]
async fn local_file_is_classified() {
    let (base, captured) = start().await;
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("local.png");
    std::fs::write(&path, PNG).unwrap();

    let verdict = client(&base, temp.path()).moderate_file(&path).await.unwrap();

    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(captured.lock().unwrap().len(), 1);
    assert!(path.exists());
}

#[tokio::test]
async fn disabled_service_allows_without_network() {
    let temp = tempfile::tempdir().unwrap();
    let mut options = ClassifierOptions::new("http://127.0.0.1:9", temp.path());
    options.enabled = false;
    let client = ClassifierClient::new(options).unwrap();

    let verdict = client
        .moderate_url("http://127.0.0.1:9/never-fetched.png")
        .await
        .unwrap();

    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.source, VerdictSource::Disabled);
}

#[tokio::test]
async fn classifier_error_status_is_an_api_error() {
    let media = Router::new().route(
        "/ok.png",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG.to_vec()) }),
    );
    let media_base = serve(media).await;
    let classifier = Router::new().route(
        "/moderate",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
    );
    let classifier_base = serve(classifier).await;

    let temp = tempfile::tempdir().unwrap();
    let err = client(&classifier_base, temp.path())
        .moderate_url(&format!("{media_base}/ok.png"))
        .await
        .unwrap_err();

    match err {
        ClassifierError::Api { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "model loading");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

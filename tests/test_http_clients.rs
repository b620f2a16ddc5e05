use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use scenegen::classify::{ErrorKind, ErrorVocabulary};
use scenegen::client::{
    HttpEndpoint, HttpImageClient, HttpRewriteClient, ImageGenerator, ImageRequest,
    RewriteBackend, RewriteRequest,
};
use serde_json::{Value, json};

/// Stand-in for the hosted image and rewrite functions.
async fn start_stub() -> SocketAddr {
    let app = Router::new()
        .route("/generate-image", post(generate_image))
        .route("/rewrite-prompt", post(rewrite_prompt))
        .route("/rewrite-plain", post(|| async { "  a quiet harbour at dusk \n" }))
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    addr
}

async fn generate_image(headers: HeaderMap, Json(body): Json<Value>) -> axum::response::Response {
    if headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        != Some("Bearer test-key")
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Cookie expired, please log in again"})),
        )
            .into_response();
    }
    let prompt = body["prompt"].as_str().unwrap_or_default();
    if prompt.contains("gore") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "Prompt blocked by safety filters"}})),
        )
            .into_response();
    }
    if prompt.contains("busy") {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }
    if prompt.contains("empty") {
        return Json(json!({"images": []})).into_response();
    }
    let url = format!(
        "https://img.test/{}-{}-{}.png",
        body["sceneIndex"],
        body["aspectRatio"].as_str().unwrap_or_default(),
        body["seed"]
    );
    Json(json!({"images": [{"url": url}]})).into_response()
}

async fn rewrite_prompt(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "text": format!(
            "\"calm {} ({} chars of context)\"",
            body["prompt"].as_str().unwrap_or_default(),
            body["sourceText"].as_str().unwrap_or_default().len()
        )
    }))
}

fn image_client(addr: SocketAddr, api_key: Option<&str>) -> HttpImageClient {
    HttpImageClient::new(
        HttpEndpoint::new(
            &format!("http://{addr}/generate-image"),
            api_key.map(str::to_string),
            Duration::from_secs(5),
        )
        .expect("endpoint"),
    )
}

fn request(prompt: &str) -> ImageRequest {
    ImageRequest {
        prompt: prompt.to_string(),
        aspect_ratio: "16:9".to_string(),
        number_of_images: 1,
        seed: Some(42),
        scene_index: Some(8),
    }
}

#[tokio::test]
async fn image_success_returns_first_url() {
    let addr = start_stub().await;
    let url = image_client(addr, Some("test-key"))
        .generate(&request("a lighthouse"))
        .await
        .expect("generate");
    assert_eq!(url, "https://img.test/8-16:9-42.png");
}

#[tokio::test]
async fn image_errors_classify_as_expected() {
    let addr = start_stub().await;
    let vocabulary = ErrorVocabulary::default();

    let client = image_client(addr, None);
    let err = client.generate(&request("a lighthouse")).await.expect_err("auth");
    assert_eq!(err.status, Some(401));
    assert_eq!(err.message, "Cookie expired, please log in again");
    assert_eq!(vocabulary.classify(err.status, &err.message), ErrorKind::Auth);

    let client = image_client(addr, Some("test-key"));
    let err = client.generate(&request("gore")).await.expect_err("blocked");
    assert_eq!(err.message, "Prompt blocked by safety filters");
    assert_eq!(
        vocabulary.classify(err.status, &err.message),
        ErrorKind::ContentBlocked
    );

    let err = client.generate(&request("busy")).await.expect_err("busy");
    assert_eq!(
        vocabulary.classify(err.status, &err.message),
        ErrorKind::RateLimited
    );

    let err = client.generate(&request("empty")).await.expect_err("empty");
    assert_eq!(err.message, "no image returned");
    assert_eq!(
        vocabulary.classify(err.status, &err.message),
        ErrorKind::Transient
    );
}

#[tokio::test]
async fn rewrite_client_reads_json_and_plain_text() {
    let addr = start_stub().await;
    let json_client = HttpRewriteClient::new(
        HttpEndpoint::new(
            &format!("http://{addr}/rewrite-prompt"),
            None,
            Duration::from_secs(5),
        )
        .expect("endpoint"),
    );
    let request = RewriteRequest {
        system: "be gentle".to_string(),
        prompt: "gore".to_string(),
        source_text: "0123456789".to_string(),
    };
    let text = json_client.complete(&request).await.expect("rewrite");
    assert_eq!(text, "\"calm gore (10 chars of context)\"");

    let plain_client = HttpRewriteClient::new(
        HttpEndpoint::new(
            &format!("http://{addr}/rewrite-plain"),
            None,
            Duration::from_secs(5),
        )
        .expect("endpoint"),
    );
    let text = plain_client.complete(&request).await.expect("rewrite");
    assert_eq!(text.trim(), "a quiet harbour at dusk");
}

#[tokio::test]
async fn slow_upstream_times_out_as_transient() {
    let addr = start_stub().await;
    let client = HttpImageClient::new(
        HttpEndpoint::new(
            &format!("http://{addr}/slow"),
            None,
            Duration::from_millis(200),
        )
        .expect("endpoint"),
    );
    let err = client
        .generate(&request("a lighthouse"))
        .await
        .expect_err("timeout");
    assert!(err.message.contains("timed out"), "{}", err.message);
    assert_eq!(
        ErrorVocabulary::default().classify(err.status, &err.message),
        ErrorKind::Transient
    );
}

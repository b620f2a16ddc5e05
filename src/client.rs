//! Clients for the remote image and prompt-rewrite function endpoints

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::ScenegenError;

/// Body for the image generation endpoint.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    /// Prompt, possibly rewritten
    pub prompt: String,
    /// Fixed target aspect ratio, eg `16:9`
    pub aspect_ratio: String,
    /// Always one for scene generation
    pub number_of_images: u8,
    /// Character seed, when the scene has a known character
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Scene number, for upstream logging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<u32>,
}

/// Body for the prompt-rewrite endpoint.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRequest {
    /// Strategy instruction
    pub system: String,
    /// The prompt that was blocked
    pub prompt: String,
    /// Scene narration the image should still illustrate
    pub source_text: String,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<ImageRef>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RewriteResponse {
    #[serde(alias = "prompt", alias = "content")]
    text: String,
}

/// A failed upstream call: the HTTP status if one came back, and the message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpstreamError {
    /// HTTP status, if the request got that far
    pub status: Option<u16>,
    /// Upstream message or transport error text
    pub message: String,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream error {status}: {}", self.message),
            None => write!(f, "upstream error: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    /// An error with no HTTP status.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// An error carrying an HTTP status.
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// The call didn't finish within the configured timeout.
    pub fn timeout(after: Duration) -> Self {
        Self::new(format!("request timed out after {}s", after.as_secs_f64()))
    }

    fn from_transport(err: &reqwest::Error) -> Self {
        Self {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }

    /// Pulls a message out of an error body, preferring JSON `error`/`message`.
    pub fn from_body(status: Option<u16>, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|value| message_from_json(&value))
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
        let message = if message.is_empty() {
            match status {
                Some(status) => format!("HTTP {status} with empty body"),
                None => "empty response".to_string(),
            }
        } else {
            message
        };
        Self { status, message }
    }
}

fn message_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(|inner| match inner {
                Value::String(text) => Some(text.clone()),
                Value::Object(_) => message_from_json(inner).or_else(|| Some(inner.to_string())),
                _ => None,
            }),
        _ => None,
    }
}

/// Produces one image for a request, returning its URL.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generates the image.
    async fn generate(&self, request: &ImageRequest) -> Result<String, UpstreamError>;
}

/// Text-generation backend used to rewrite blocked prompts.
#[async_trait]
pub trait RewriteBackend: Send + Sync {
    /// Returns the replacement prompt text, unprocessed.
    async fn complete(&self, request: &RewriteRequest) -> Result<String, UpstreamError>;
}

/// A JSON-over-POST function endpoint with an optional bearer credential.
#[derive(Clone, Debug)]
pub struct HttpEndpoint {
    client: Client,
    url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpEndpoint {
    /// Builds the endpoint, validating the URL.
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ScenegenError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ScenegenError::Config(format!(
                "endpoint {url} must be http or https"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            api_key: api_key.filter(|key| !key.is_empty()),
            timeout,
        })
    }

    /// The endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn post_json<T: Serialize + Sync>(&self, body: &T) -> Result<Vec<u8>, UpstreamError> {
        let call = async {
            let mut request = self.client.post(self.url.clone()).json(body);
            if let Some(api_key) = &self.api_key {
                request = request.bearer_auth(api_key);
            }
            let response = request.send().await.map_err(|err| {
                if err.is_timeout() {
                    UpstreamError::timeout(self.timeout)
                } else {
                    UpstreamError::from_transport(&err)
                }
            })?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::from_transport(&err))?;
            debug!("POST {} -> {} ({} bytes)", self.url, status, bytes.len());
            if !status.is_success() {
                return Err(UpstreamError::from_body(Some(status.as_u16()), &bytes));
            }
            Ok(bytes.to_vec())
        };

        // The client timeout covers the transfer; this also covers body reads stalling.
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::timeout(self.timeout)),
        }
    }
}

/// reqwest client for the image generation endpoint.
#[derive(Clone, Debug)]
pub struct HttpImageClient {
    endpoint: HttpEndpoint,
}

impl HttpImageClient {
    /// Wraps an endpoint.
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageClient {
    async fn generate(&self, request: &ImageRequest) -> Result<String, UpstreamError> {
        let bytes = self.endpoint.post_json(request).await?;
        let parsed: ImagesResponse = serde_json::from_slice(&bytes).map_err(|err| {
            UpstreamError::with_status(200, format!("unreadable image response: {err}"))
        })?;
        if let Some(error) = parsed.error.filter(|error| !error.is_null()) {
            let message = message_from_json(&serde_json::json!({ "error": error }))
                .unwrap_or_else(|| error.to_string());
            return Err(UpstreamError::with_status(200, message));
        }
        parsed
            .images
            .into_iter()
            .map(|image| image.url)
            .find(|url| !url.is_empty())
            .ok_or_else(|| UpstreamError::with_status(200, "no image returned"))
    }
}

/// reqwest client for the prompt-rewrite endpoint.
#[derive(Clone, Debug)]
pub struct HttpRewriteClient {
    endpoint: HttpEndpoint,
}

impl HttpRewriteClient {
    /// Wraps an endpoint.
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl RewriteBackend for HttpRewriteClient {
    async fn complete(&self, request: &RewriteRequest) -> Result<String, UpstreamError> {
        let bytes = self.endpoint.post_json(request).await?;
        match serde_json::from_slice::<RewriteResponse>(&bytes) {
            Ok(parsed) => Ok(parsed.text),
            Err(_) => Ok(String::from_utf8_lossy(&bytes).to_string()),
        }
    }
}

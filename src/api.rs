use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// A plain HTTP request, decoupled from any specific HTTP library.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET" or "POST"
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            ..Default::default()
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

/// Abstraction over the HTTP transport so callers can plug in their own
/// client (or a mock in tests).
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: ureq::Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        // Status handling lives in `RevoltApi`, not the transport.
        let config = ureq::config::Config::builder()
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.new_agent(),
        }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        // Since ureq is blocking, we must use spawn_blocking
        tokio::task::spawn_blocking(move || {
            let response = match request.method.as_str() {
                "GET" => {
                    let mut req = agent.get(&request.url);
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    req.call()?
                }
                "POST" => {
                    let mut req = agent.post(&request.url);
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    if let Some(body) = request.body {
                        req.send(&body[..])?
                    } else {
                        req.send(&[])?
                    }
                }
                method => {
                    return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
                }
            };

            let status_code = response.status().as_u16();
            let body = response.into_body().read_to_vec()?;

            Ok(HttpResponse { status_code, body })
        })
        .await?
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },
    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// User record as returned by `GET /users/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub badges: u32,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub online: bool,
}

/// Channel record as returned by `GET /channels/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiChannel {
    #[serde(rename = "_id")]
    pub id: String,
    pub channel_type: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinCallResponse {
    token: String,
}

/// Thin client for the Revolt REST API, authenticated with a bot token.
#[derive(Clone)]
pub struct RevoltApi {
    base_url: String,
    token: String,
    http: Arc<dyn HttpClient>,
}

impl RevoltApi {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = HttpRequest::get(format!("{}{}", self.base_url, path))
            .with_header("x-bot-token", self.token.as_str());
        self.dispatch(path, request).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = HttpRequest::post(format!("{}{}", self.base_url, path))
            .with_header("x-bot-token", self.token.as_str());
        self.dispatch(path, request).await
    }

    async fn dispatch<T: DeserializeOwned>(
        &self,
        path: &str,
        request: HttpRequest,
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .execute(request)
            .await
            .map_err(ApiError::Transport)?;
        if !(200..300).contains(&response.status_code) {
            return Err(ApiError::Status {
                status: response.status_code,
                path: path.to_string(),
            });
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    pub async fn fetch_user(&self, user_id: &str) -> Result<ApiUser, ApiError> {
        self.get_json(&format!("/users/{user_id}")).await
    }

    pub async fn fetch_channel(&self, channel_id: &str) -> Result<ApiChannel, ApiError> {
        self.get_json(&format!("/channels/{channel_id}")).await
    }

    /// Requests a voice token for the channel. The token is what the
    /// signaling server authenticates with.
    pub async fn join_call(&self, channel_id: &str) -> Result<String, ApiError> {
        let response: JoinCallResponse = self
            .post_json(&format!("/channels/{channel_id}/join_call"))
            .await?;
        Ok(response.token)
    }
}

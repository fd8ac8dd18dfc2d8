//! HTTP storage client.
//!
//! One remote call per operation, all async. A single shared response rule
//! applies everywhere: 200/201 resolve with the body, 204 resolves with an
//! absent value, anything else is an error carrying the status and text.

use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};
use crate::session::SessionState;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const API_KEY_HEADER: &str = "API_KEY";
const SESSION_ID_HEADER: &str = "SESSION_ID";

/// Tagged request payload.
///
/// The wire content type is derived from the variant once, at the boundary:
/// `Text` is sent as `text/plain`, `Json` as `application/json`.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Plain string payload.
    Text(String),
    /// Any JSON value: object, sequence, number, boolean, or null.
    Json(Value),
}

impl Payload {
    fn content_type(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text/plain",
            Payload::Json(_) => "application/json",
        }
    }

    fn into_body(self) -> Result<String, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(text),
            Payload::Json(value) => serde_json::to_string(&value),
        }
    }

    /// Wraps the payload into a one-element sequence unless it already is
    /// one. The append operation always transmits a sequence body.
    fn into_sequence(self) -> Payload {
        let element = match self {
            Payload::Json(Value::Array(items)) => return Payload::Json(Value::Array(items)),
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
        };
        Payload::Json(Value::Array(vec![element]))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Json(Value::from(value))
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Json(Value::from(value))
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Payload::Json(Value::from(value))
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Json(Value::from(value))
    }
}

/// Connection and retry settings for [`StorageClient`].
#[derive(Clone, Debug)]
pub struct StorageClientOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-attempt request timeout. `None` leaves requests unbounded, which
    /// matches the default behavior of the service contract.
    pub attempt_timeout: Option<Duration>,
    /// Retry policy for retryable failures. Defaults to a single attempt;
    /// enabling retries is an explicit opt-in.
    pub retry_policy: RetryPolicy,
}

impl Default for StorageClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            attempt_timeout: None,
            retry_policy: RetryPolicy::no_retry(),
        }
    }
}

/// REST client for CRUD-style operations on named key/value records.
///
/// Every request carries the configured api key; once the shared
/// [`SessionState`] holds an identity, requests also carry the session id,
/// tying them to the live realtime connection.
#[derive(Clone)]
pub struct StorageClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    session: SessionState,
    attempt_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
}

#[derive(Clone)]
struct PendingRequest {
    method: Method,
    url: String,
    query: Vec<(&'static str, String)>,
    payload: Option<Payload>,
}

impl StorageClient {
    /// Creates a client with default options.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        session: SessionState,
    ) -> Result<Self, StorageError> {
        Self::with_options(base_url, api_key, session, StorageClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: SecretString,
        session: SessionState,
        options: StorageClientOptions,
    ) -> Result<Self, StorageError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(StorageError::Transport)?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            api_key,
            session,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Replaces the whole record stored under `key` (PUT).
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Payload>,
    ) -> Result<Option<Value>, StorageError> {
        self.dispatch(PendingRequest {
            method: Method::PUT,
            url: self.endpoint(key),
            query: Vec::new(),
            payload: Some(value.into()),
        })
        .await
    }

    /// Appends to the record under `key`, creating it when absent (POST).
    ///
    /// The server always receives a sequence body: a scalar payload is
    /// wrapped into a one-element sequence before sending.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Payload>,
    ) -> Result<Option<Value>, StorageError> {
        self.dispatch(PendingRequest {
            method: Method::POST,
            url: self.endpoint(key),
            query: Vec::new(),
            payload: Some(value.into().into_sequence()),
        })
        .await
    }

    /// Reads the whole record stored under `key`.
    ///
    /// Resolves to `None` when the server reports no such record (204).
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.get_range(key, 0, -1, None).await
    }

    /// Range read with optional field projection (GET).
    ///
    /// `first_result` is the index of the first collection element to
    /// return, `max_results` limits the count (`-1` means unbounded), and
    /// `fields` narrows returned objects to the named fields.
    pub async fn get_range(
        &self,
        key: &str,
        first_result: u64,
        max_results: i64,
        fields: Option<&[&str]>,
    ) -> Result<Option<Value>, StorageError> {
        let mut query = vec![
            ("firstResult", first_result.to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if let Some(fields) = fields {
            query.push(("fields", fields.join(",")));
        }
        self.dispatch(PendingRequest {
            method: Method::GET,
            url: self.endpoint(key),
            query,
            payload: None,
        })
        .await
    }

    /// Number of elements stored under `key` (HEAD).
    ///
    /// The server encodes the count in the `Content-Length` response header
    /// instead of a body: 1 for scalar records, the collection length
    /// otherwise. Resolves to `None` when there is no such record.
    pub async fn count(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let url = self.endpoint(key);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let url = url.clone();
                async move { self.count_attempt(&url).await }
            },
            StorageError::is_retryable,
        )
        .await
    }

    /// Deletes the record under `key`, or a single matching element of its
    /// collection when `value` is provided (DELETE).
    pub async fn delete(
        &self,
        key: &str,
        value: Option<Payload>,
    ) -> Result<Option<Value>, StorageError> {
        self.dispatch(PendingRequest {
            method: Method::DELETE,
            url: self.endpoint(key),
            query: Vec::new(),
            payload: value,
        })
        .await
    }

    /// Replaces the element at `index` in the record's collection (PATCH).
    ///
    /// A `Payload::Json(Value::Null)` body asks the server to remove the
    /// element rather than store a null.
    pub async fn update(
        &self,
        key: &str,
        index: u64,
        value: impl Into<Payload>,
    ) -> Result<Option<Value>, StorageError> {
        self.dispatch(PendingRequest {
            method: Method::PATCH,
            url: self.endpoint(key),
            query: vec![("index", index.to_string())],
            payload: Some(value.into()),
        })
        .await
    }

    fn endpoint(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    async fn dispatch(&self, request: PendingRequest) -> Result<Option<Value>, StorageError> {
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let request = request.clone();
                async move { self.send_attempt(request).await }
            },
            StorageError::is_retryable,
        )
        .await
    }

    async fn send_attempt(&self, request: PendingRequest) -> Result<Option<Value>, StorageError> {
        let mut builder = self.http.request(request.method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(payload) = request.payload {
            builder = builder
                .header(CONTENT_TYPE, payload.content_type())
                .body(payload.into_body()?);
        }
        builder = self.apply_common_headers(builder);

        let response = builder.send().await.map_err(StorageError::Transport)?;
        validate_response(response).await
    }

    async fn count_attempt(&self, url: &str) -> Result<Option<u64>, StorageError> {
        let builder = self.apply_common_headers(self.http.head(url));
        let response = builder.send().await.map_err(StorageError::Transport)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let raw = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        StorageError::Parse("missing Content-Length header".to_string())
                    })?;
                let count = raw.parse::<u64>().map_err(|err| {
                    StorageError::Parse(format!("bad Content-Length header: {err}"))
                })?;
                Ok(Some(count))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(error_from_status(status, response).await),
        }
    }

    fn apply_common_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder.header(API_KEY_HEADER, self.api_key.expose_secret());
        if let Some(session_id) = self.session.get() {
            builder = builder.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(timeout) = self.attempt_timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

async fn validate_response(response: Response) -> Result<Option<Value>, StorageError> {
    match response.status() {
        StatusCode::OK | StatusCode::CREATED => {
            let is_json = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("application/json"));
            let body = response.text().await.map_err(StorageError::Transport)?;
            if is_json {
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|err| StorageError::Parse(format!("invalid json body: {err}")))
            } else {
                Ok(Some(Value::String(body)))
            }
        }
        StatusCode::NO_CONTENT => Ok(None),
        status => Err(error_from_status(status, response).await),
    }
}

async fn error_from_status(status: StatusCode, response: Response) -> StorageError {
    // The status alone is enough to reject; a lost error body is not fatal.
    let body = response.text().await.unwrap_or_default();
    StorageError::HttpStatus {
        status,
        text: summarize_error_body(&body),
    }
}

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport failure with no server response at all.
    #[error("no response: {0}")]
    Transport(reqwest::Error),

    /// Non-success status reported by the server.
    #[error("http status {status}: {text}")]
    HttpStatus { status: StatusCode, text: String },

    /// Request payload could not be serialized.
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Response body or headers could not be interpreted.
    #[error("parse response: {0}")]
    Parse(String),
}

impl StorageError {
    /// Whether a failure is worth retrying when retries are enabled.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Encode(_) | Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        exception: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.exception) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::{json, Value};

    use super::{summarize_error_body, Payload, StorageClient};
    use crate::session::SessionState;

    #[test]
    fn text_payload_selects_plain_text_content_type() {
        let payload = Payload::from("hello");
        assert_eq!(payload.content_type(), "text/plain");
        assert_eq!(payload.into_body().expect("body"), "hello");
    }

    #[test]
    fn json_payloads_select_json_content_type() {
        for payload in [
            Payload::from(json!({"name": "Mike G."})),
            Payload::from(42i64),
            Payload::from(true),
            Payload::from(json!([1, 2, 3])),
            Payload::from(Value::Null),
        ] {
            assert_eq!(payload.content_type(), "application/json");
        }
    }

    #[test]
    fn scalar_wraps_into_one_element_sequence() {
        let wrapped = Payload::from(5i64).into_sequence();
        assert_eq!(wrapped, Payload::Json(json!([5])));
    }

    #[test]
    fn text_wraps_into_one_element_string_sequence() {
        let wrapped = Payload::from("solo").into_sequence();
        assert_eq!(wrapped, Payload::Json(json!(["solo"])));
    }

    #[test]
    fn sequence_payload_is_not_double_wrapped() {
        let wrapped = Payload::from(json!([1, 2])).into_sequence();
        assert_eq!(wrapped, Payload::Json(json!([1, 2])));
    }

    #[test]
    fn endpoint_joins_base_and_key_without_double_slash() {
        let client = StorageClient::new(
            "http://localhost:8080/api/demoDb/",
            SecretString::new("k".to_string()),
            SessionState::new(),
        )
        .expect("build client");
        assert_eq!(
            client.endpoint("demo-key-7"),
            "http://localhost:8080/api/demoDb/demo-key-7"
        );
    }

    #[test]
    fn error_body_prefers_structured_message() {
        assert_eq!(summarize_error_body(r#"{"message":"boom"}"#), "boom");
        assert_eq!(summarize_error_body(r#"{"error":"nope"}"#), "nope");
        assert_eq!(
            summarize_error_body(r#"{"exception":"IllegalArgumentException"}"#),
            "IllegalArgumentException"
        );
    }

    #[test]
    fn error_body_falls_back_to_snippet() {
        assert_eq!(summarize_error_body("plain failure"), "plain failure");
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }
}

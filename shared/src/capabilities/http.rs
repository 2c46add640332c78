use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

pub const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedUrl {
    url: Url,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();

        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url,
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(&url),
            reason: e.to_string(),
        })?;

        Self::from_parsed(parsed)
    }

    fn from_parsed(parsed: Url) -> Result<Self, HttpError> {
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(parsed.as_str()),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(parsed.as_str()),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(parsed.as_str()),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self { url: parsed })
    }

    /// Resolves `path` against this URL. Absolute paths replace the whole path.
    pub fn join(&self, path: &str) -> Result<Self, HttpError> {
        let joined = self.url.join(path).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(path),
            reason: e.to_string(),
        })?;
        Self::from_parsed(joined)
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    fn append_query(&mut self, pairs: &[(&str, &str)]) {
        let mut query = self.url.query_pairs_mut();
        for (name, value) in pairs {
            query.append_pair(name, value);
        }
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let mut end = 100;
            while !url.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &url[..end])
        }
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        self.remove(&name);
        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::TooManyHeaders {
                count: self.headers.len(),
                max: MAX_HEADERS_COUNT,
            });
        }
        self.headers.push((name, value));

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes every header called `name`, returning whether one was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {} bytes",
                    MAX_HEADER_NAME_LENGTH
                ),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{}' in header name", c),
            });
        }

        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed automatically".to_string(),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {} bytes",
                    MAX_HEADER_VALUE_LENGTH
                ),
            });
        }

        if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn has_request_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Json,
    Text,
    Custom(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
            ContentType::Custom(s) => s.as_str(),
        }
    }

    pub fn from_header(value: &str) -> Self {
        let lower = value.to_ascii_lowercase();
        if lower.starts_with("application/json") {
            ContentType::Json
        } else if lower.starts_with("text/plain") {
            ContentType::Text
        } else {
            ContentType::Custom(value.to_string())
        }
    }
}

/// One outgoing call. `retried` is set by the request pipeline once the call
/// has been re-issued after a token refresh.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
    timeout_ms: u64,
    request_id: String,
    retried: bool,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: ValidatedUrl) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_id: uuid::Uuid::new_v4().to_string(),
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Get, ValidatedUrl::new(url)?))
    }

    pub fn post(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Post, ValidatedUrl::new(url)?))
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.url.append_query(pairs);
        self
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;

        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::BodyTooLarge {
                size: body.len(),
                max: MAX_REQUEST_BODY_SIZE,
            });
        }

        self.headers.insert("Content-Type", ContentType::Json.as_str())?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, HttpError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.with_timeout_ms(ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, HttpError> {
        if timeout_ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "timeout cannot be zero".to_string(),
            });
        }
        if timeout_ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout exceeds maximum of {}ms", MAX_TIMEOUT_MS),
            });
        }
        self.timeout_ms = timeout_ms;
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HttpHeaders {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("too many headers: {count} exceeds maximum of {max}")]
    TooManyHeaders { count: usize, max: usize },

    #[error("request body too large: {size} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. }
            | HttpError::HttpStatus { request_id, .. }
            | HttpError::InvalidResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>, request_id: String) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
        }
    }

    pub fn json_body<T: Serialize>(status: u16, value: &T) -> Self {
        let mut headers = HttpHeaders::new();
        headers
            .insert("Content-Type", ContentType::Json.as_str())
            .ok();
        Self {
            status,
            headers,
            body: serde_json::to_vec(value).unwrap_or_default(),
            request_id: String::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.headers.get("content-type").map(ContentType::from_header)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {}", e),
            request_id: self.request_id.clone(),
        })
    }

    /// Turns a non-2xx response into `HttpError::HttpStatus`, lifting the
    /// backend's `message` field when the body carries one.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.is_success() {
            return Ok(self);
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            message: Option<String>,
        }

        let message = serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| format!("request failed with status {}", self.status));

        Err(HttpError::HttpStatus {
            status: self.status,
            message,
            request_id: self.request_id,
        })
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Executes requests on behalf of the core. Every status code is returned as
/// `Ok`; only transport failures are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResult;
}

#[cfg(feature = "native-http")]
pub use self::native::ReqwestTransport;

#[cfg(feature = "native-http")]
mod native {
    use super::*;

    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: e.to_string(),
                })?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }

        fn method(method: HttpMethod) -> reqwest::Method {
            match method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let request_id = request.request_id().to_string();
            let host = request.url().host().to_string();
            let timeout_ms = request.timeout_ms();

            let mut builder = self
                .client
                .request(Self::method(request.method()), request.url().as_str())
                .timeout(Duration::from_millis(timeout_ms));
            for (name, value) in request.headers().iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body() {
                builder = builder.body(body.to_vec());
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout {
                        timeout_ms,
                        request_id: request_id.clone(),
                    }
                } else {
                    HttpError::ConnectionError {
                        host: host.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            let status = response.status().as_u16();
            let mut headers = HttpHeaders::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    // Managed headers like content-length are not re-exposed.
                    let _ = headers.insert(name.as_str(), value);
                }
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| HttpError::InvalidResponse {
                    reason: e.to_string(),
                    request_id: request_id.clone(),
                })?
                .to_vec();

            Ok(HttpResponse::new(status, headers, body, request_id))
        }
    }
}

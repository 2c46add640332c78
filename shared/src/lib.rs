#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod capabilities;
pub mod client;
pub mod location;
pub mod refresh;
pub mod registration;
pub mod session;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::capabilities::{GeolocationError, HttpError, KvError, MapError};
use crate::validation::ValidationError;

pub use capabilities::Capabilities;
pub use client::{ApiClient, ClientConfig};
pub use location::{LocationController, SearchConfig};
pub use registration::RegistrationForm;

pub const DEFAULT_BASE_URL: &str = "https://gonggumoa.o-r.kr";
pub const LOGIN_PATH: &str = "/api/users/login";
pub const LOGIN_REDIRECT_PATH: &str = "/login";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// `code` value the backend uses for an accepted request.
pub const SUCCESS_CODE: i64 = 20000;

pub const SEARCH_PAGE_SIZE: u32 = 15;
pub const GEOLOCATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Konkuk University, the map's resting position.
pub const DEFAULT_CENTER: (f64, f64) = (37.540_762_6, 127.079_342_3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Info,
    Error,
}

/// A message the shell shows the user (an alert on the web).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    SessionExpired,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    MapProvider,
    Location,
    LocationPermissionDenied,
    FeatureUnavailable,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::MapProvider => "MAP_PROVIDER_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Storage
            | Self::MapProvider
            | Self::Location => ErrorSeverity::Transient,

            Self::SessionExpired | Self::Serialization | Self::Internal | Self::InvalidState => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::LocationPermissionDenied
            | Self::FeatureUnavailable
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::MapProvider
        )
    }

    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    /// Text suitable for an alert or inline field error.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => "네트워크 오류".into(),
            ErrorKind::Timeout => "요청 시간이 초과되었습니다. 다시 시도해주세요.".into(),
            ErrorKind::Authentication | ErrorKind::SessionExpired => {
                "로그인이 만료되었습니다. 다시 로그인해주세요.".into()
            }
            ErrorKind::Authorization => "권한이 없습니다.".into(),
            ErrorKind::Validation
            | ErrorKind::Conflict
            | ErrorKind::NotFound
            | ErrorKind::FeatureUnavailable => self.message.clone(),
            ErrorKind::RateLimited => "요청이 너무 많습니다. 잠시 후 다시 시도해주세요.".into(),
            ErrorKind::Storage => "데이터를 저장하지 못했습니다.".into(),
            ErrorKind::MapProvider => "지도 서비스를 사용할 수 없습니다.".into(),
            ErrorKind::Location => "현재 위치를 가져올 수 없습니다.".into(),
            ErrorKind::LocationPermissionDenied => "위치 권한을 허용해주세요.".into(),
            ErrorKind::Serialization
            | ErrorKind::InvalidState
            | ErrorKind::Internal
            | ErrorKind::Unknown => "알 수 없는 오류가 발생했습니다.".into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        match &e {
            HttpError::HttpStatus {
                status,
                message,
                request_id,
            } => AppError::new(ErrorKind::from_http_status(*status), message.clone())
                .with_context("http_status", status.to_string())
                .with_context("request_id", request_id.clone()),
            HttpError::Timeout { .. } => {
                AppError::new(ErrorKind::Timeout, "request timed out").with_internal(e.to_string())
            }
            HttpError::ConnectionError { .. } => {
                AppError::new(ErrorKind::Network, "connection failed").with_internal(e.to_string())
            }
            HttpError::InvalidResponse { .. } | HttpError::SerializationError { .. } => {
                AppError::new(ErrorKind::Serialization, "unexpected response")
                    .with_internal(e.to_string())
            }
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::InvalidRequest { .. } => {
                AppError::new(ErrorKind::Internal, "invalid request").with_internal(e.to_string())
            }
        }
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        AppError::new(ErrorKind::Storage, "storage unavailable").with_internal(e.to_string())
    }
}

impl From<MapError> for AppError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::NoResults => AppError::new(ErrorKind::NotFound, "검색 결과가 없습니다."),
            MapError::InvalidCoordinate { .. } => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            MapError::NotLoaded | MapError::LoadFailed(_) | MapError::Provider { .. } => {
                AppError::new(ErrorKind::MapProvider, "map provider failure")
                    .with_internal(e.to_string())
            }
        }
    }
}

impl From<GeolocationError> for AppError {
    fn from(e: GeolocationError) -> Self {
        match e {
            GeolocationError::Unsupported => AppError::new(
                ErrorKind::FeatureUnavailable,
                "이 브라우저에서는 위치 정보를 지원하지 않습니다.",
            ),
            GeolocationError::PermissionDenied => {
                AppError::new(ErrorKind::LocationPermissionDenied, e.to_string())
            }
            GeolocationError::Unavailable(_) | GeolocationError::Timeout { .. } => {
                AppError::new(ErrorKind::Location, e.to_string())
            }
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
            .with_context("field", e.field().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_maps_to_kind() {
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_http_status(409), ErrorKind::Conflict);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::Internal);
        assert_eq!(ErrorKind::from_http_status(418), ErrorKind::Unknown);
    }

    #[test]
    fn http_status_error_keeps_backend_message() {
        let err: AppError = HttpError::HttpStatus {
            status: 409,
            message: "이미 가입된 이메일입니다.".into(),
            request_id: "req-1".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.user_facing_message(), "이미 가입된 이메일입니다.");
        assert_eq!(err.context.get("http_status").map(String::as_str), Some("409"));
    }

    #[test]
    fn connection_error_is_retryable_network_failure() {
        let err: AppError = HttpError::ConnectionError {
            host: "gonggumoa.o-r.kr".into(),
            message: "refused".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.is_retryable());
        assert_eq!(err.user_facing_message(), "네트워크 오류");
    }

    #[test]
    fn fatal_severity_is_never_retryable() {
        let err = AppError::new(ErrorKind::Network, "x").with_severity(ErrorSeverity::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn geolocation_unsupported_is_feature_unavailable() {
        let err: AppError = GeolocationError::Unsupported.into();
        assert_eq!(err.kind, ErrorKind::FeatureUnavailable);
        assert!(err.user_facing_message().contains("위치 정보"));
    }

    #[test]
    fn display_includes_code_and_internal() {
        let err = AppError::new(ErrorKind::Storage, "disk").with_internal("locked");
        assert_eq!(err.to_string(), "[STORAGE_ERROR] disk (internal: locked)");
    }
}

//! Application errors and their JSON/HTTP rendering

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced while resolving, booting or supervising an application.
///
/// The type is `Clone` because a single termination error is handed to every
/// caller waiting on the same application.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// No directory, proxy file or dash-expanded path matches the name
    #[error("unknown app: {0}")]
    UnknownApp(String),

    /// The process closed its output before anyone asked it to stop
    #[error("unexpected exit:\n\t{last_line}")]
    UnexpectedExit { last_line: String },

    /// Project directory has no docker-compose.yml
    #[error("no docker-compose.yml in {}", .0.display())]
    MissingDescriptor(PathBuf),

    /// Proxy descriptor file is neither a port nor a URL
    #[error("invalid proxy descriptor {}: {reason}", .path.display())]
    InvalidProxy { path: PathBuf, reason: String },

    /// The container-status provider failed
    #[error("container status unavailable: {0}")]
    Container(String),

    /// The web container reported itself unhealthy
    #[error("the {0} container is unhealthy, check your logs for more details")]
    Unhealthy(String),

    #[error("app died before booting")]
    DiedBeforeBooting,

    #[error("app did not become healthy within {0:?}")]
    BootTimeout(Duration),

    /// The supervision group was cancelled explicitly
    #[error("app killed: {reason}")]
    Killed { reason: String },

    /// The application is gone and recorded no error of its own
    #[error("app shut down")]
    Shutdown,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl AppError {
    /// Wrap an I/O error with a human-readable context string
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        AppError::Io {
            context,
            source: Arc::new(source),
        }
    }

    /// Error code used when this error reaches an HTTP client
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            AppError::UnknownApp(_) => ProxyErrorCode::UnknownApp,
            AppError::MissingDescriptor(_) | AppError::InvalidProxy { .. } => {
                ProxyErrorCode::AppConfigError
            }
            AppError::Unhealthy(_) => ProxyErrorCode::AppUnhealthy,
            AppError::BootTimeout(_) => ProxyErrorCode::BootTimeout,
            AppError::Killed { .. } | AppError::Shutdown => ProxyErrorCode::AppShuttingDown,
            AppError::UnexpectedExit { .. }
            | AppError::DiedBeforeBooting
            | AppError::Container(_)
            | AppError::Io { .. } => ProxyErrorCode::AppStartFailed,
        }
    }
}

/// Error codes for failed lookups and boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No application by that name
    UnknownApp,
    /// Application is being torn down
    AppShuttingDown,
    /// Application container reported unhealthy
    AppUnhealthy,
    /// Application failed to start
    AppStartFailed,
    /// Application directory or proxy file is malformed
    AppConfigError,
    /// Application did not become ready in time
    BootTimeout,
    /// Missing or wrong admin token
    Unauthorized,
    /// Unknown route
    NotFound,
    /// Internal error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ProxyErrorCode::AppShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::AppUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::AppStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::AppConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BootTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::AppShuttingDown => "APP_SHUTTING_DOWN",
            ProxyErrorCode::AppUnhealthy => "APP_UNHEALTHY",
            ProxyErrorCode::AppStartFailed => "APP_START_FAILED",
            ProxyErrorCode::AppConfigError => "APP_CONFIG_ERROR",
            ProxyErrorCode::BootTimeout => "BOOT_TIMEOUT",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Render an application error as an HTTP response
pub fn app_error_response(err: &AppError) -> Response<Full<Bytes>> {
    json_error_response(err.code(), err.to_string())
}

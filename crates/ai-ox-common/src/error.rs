use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Coarse error categories used by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rate limiting - retry after backoff
    RateLimit,
    /// Authentication/authorization issues - do not retry
    Auth,
    /// Malformed or rejected request - do not retry
    InvalidRequest,
    /// Resource does not exist - do not retry
    NotFound,
    /// Server side failure (5xx, 408, 409, 425) - may retry
    Server,
    /// Connection or timeout problems - may retry
    Network,
    /// Response body could not be decoded - do not retry
    Decode,
    /// Anything else
    Other,
}

/// Common errors that can occur in AI provider HTTP requests
#[derive(Error, Debug)]
pub enum CommonRequestError {
    /// HTTP request failed before a status was received
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid event data in streaming response
    #[error("Invalid event data: {0}")]
    InvalidEventData(String),

    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Success status but the body did not match the expected shape
    #[error("Unexpected response from API: {0}")]
    UnexpectedResponse(String),

    /// Structured API error with a non-success status
    #[error("API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
        error_type: Option<String>,
        code: Option<String>,
    },

    /// HTTP 429
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 401 / 403
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// HTTP 404
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Error originating from the request builder
    #[error("Request builder error: {0}")]
    RequestBuilder(String),
}

impl CommonRequestError {
    /// Returns the error kind for categorizing errors in retry logic
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Authentication(_) => ErrorKind::Auth,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Api { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorKind::Server
                } else {
                    ErrorKind::InvalidRequest
                }
            }
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorKind::Network
                } else if e.is_decode() {
                    ErrorKind::Decode
                } else {
                    ErrorKind::Other
                }
            }
            Self::Json(_) | Self::Utf8(_) | Self::UnexpectedResponse(_) => ErrorKind::Decode,
            Self::RequestBuilder(_) => ErrorKind::InvalidRequest,
            Self::InvalidEventData(_) => ErrorKind::Other,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimit | ErrorKind::Server | ErrorKind::Network
        )
    }

    /// Server supplied `Retry-After` hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status code when the error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimit { .. } => Some(429),
            Self::NotFound(_) => Some(404),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || (500..600).contains(&status)
}

/// Parse `Retry-After` given in delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Parse error response from HTTP status and body
pub fn parse_error_response(
    status: StatusCode,
    body: &[u8],
    retry_after: Option<Duration>,
) -> CommonRequestError {
    let json = serde_json::from_slice::<serde_json::Value>(body).ok();
    let message = json
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("no response body")
                    .to_string()
            } else {
                text
            }
        });

    match status.as_u16() {
        429 => CommonRequestError::RateLimit {
            message,
            retry_after,
        },
        401 | 403 => CommonRequestError::Authentication(message),
        404 => CommonRequestError::NotFound(message),
        code => {
            let field = |name: &str| {
                json.as_ref()
                    .and_then(|v| v.get("error").unwrap_or(v).get(name))
                    .and_then(|v| match v {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
            };
            CommonRequestError::Api {
                status: code,
                message,
                error_type: field("type"),
                code: field("code"),
            }
        }
    }
}

/// Extract error message from the JSON error shapes returned by providers:
/// `{"error": {"message": ..}}`, `{"message": ..}` and `{"detail": ..}`
/// (validation errors, either a string or a list of objects).
fn extract_error_message(json: &serde_json::Value) -> Option<String> {
    if let Some(msg) = json
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Some(msg.to_string());
    }

    if let Some(msg) = json.get("message") {
        return match msg {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        };
    }

    match json.get("detail")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let parts = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect::<Vec<_>>();
            if parts.is_empty() {
                Some(serde_json::Value::Array(items.clone()).to_string())
            } else {
                Some(parts.join("; "))
            }
        }
        other => Some(other.to_string()),
    }
}

//! Error types for the FluentFM client
//!
//! Maps FileMaker Data API message codes onto a typed error enum, using
//! thiserror for the definitions and anyhow for opaque source chains.

use serde_json::Value;
use thiserror::Error;

/// Main error type for FluentFM operations
#[derive(Error, Debug)]
pub enum Error {
    /// Login rejected by the server (HTTP 401 while minting a token)
    #[error("FileMaker access unauthorized - please check your credentials")]
    Unauthorized,

    /// The server reported an invalid bearer token (message code 952)
    #[error("invalid FileMaker Data API token - please refresh token")]
    TokenInvalid,

    /// A session request completed without returning a token
    #[error("no token returned when opening a FileMaker session")]
    TokenCreation,

    /// Token acquisition kept failing through the backoff loop
    #[error("token acquisition failed after {retries} retries")]
    TokenRetryExhausted { retries: u32 },

    /// HTTP 503 from the Data API host
    #[error("FileMaker service unavailable (HTTP 503)")]
    ServiceUnavailable,

    /// Message code 3: the Data API could not reach the database
    #[error("FileMaker connection refused (code 3)")]
    ConnectionRefused,

    /// Message code 102: a referenced field does not exist on the layout
    #[error("FileMaker returned error 102 - {message}; payload sent: {query}")]
    FieldMissing { message: String, query: Value },

    /// Message code 509: a field value failed validation
    #[error("FileMaker returned error 509 - {message}; payload sent: {query}")]
    FieldInvalid { message: String, query: Value },

    /// Any other non-zero message code from the server
    #[error("FileMaker returned error {code} - {message}; payload sent: {query}")]
    Api {
        code: i64,
        message: String,
        query: Value,
    },

    /// A terminal expecting records found none
    #[error("no results for query: {query}")]
    NoResult { query: Value },

    /// A terminal was invoked with nothing queued
    #[error("no action queued - call records(), find(), update() or similar before get()/exec()")]
    NoPendingOperation,

    /// Transport-level failures and request building errors
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// JSON parsing and serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// IO errors (container downloads, upload streaming)
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status associated with this error, if any.
    ///
    /// The dispatcher keys its one-shot token-replace-and-retry off a 401
    /// here, so an invalid-token report (code 952) surfaces as 401 just like
    /// a bare unauthorized response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Unauthorized | Error::TokenInvalid => Some(401),
            Error::ServiceUnavailable => Some(503),
            Error::Http { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the token backoff loop should retry after this error.
    ///
    /// Only token-kind and Data-API-kind failures are retried; transport
    /// errors and login rejections propagate immediately.
    pub fn is_token_retryable(&self) -> bool {
        matches!(
            self,
            Error::TokenInvalid
                | Error::TokenCreation
                | Error::ServiceUnavailable
                | Error::ConnectionRefused
                | Error::Api { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
            source: Some(anyhow::anyhow!(err)),
        }
    }
}

//! # Error Handling Module
//!
//! One error type serves two roles in this crate:
//!
//! - **Per-item data**: encryption and signing failures are stored inside a
//!   [`MessageResult`](crate::types::MessageResult) and never abort a batch.
//! - **Propagated errors**: configuration, key setup, and HTTP failures flow
//!   through [`Result`] with `?`.
//!
//! ## Security Considerations
//!
//! Responses to clients only ever carry [`EncrypterError::client_message`].
//! Internal messages may include key sizes, file paths, or library errors and
//! are meant for logs only.

use thiserror::Error;

/// Result type alias for the batch encrypter library
pub type Result<T> = std::result::Result<T, EncrypterError>;

/// Boxed source error carried by most variants
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Error types for the batch encrypter
///
/// ## Error Categories
///
/// - **Cryptographic Errors**: RSA, AES-GCM, and envelope parsing failures
/// - **Pipeline Errors**: per-task timeouts and aborted tasks
/// - **Network Errors**: HTTP server and connection issues
/// - **Configuration Errors**: invalid settings or key setup
/// - **Request Errors**: malformed client requests
#[derive(Error, Debug)]
pub enum EncrypterError {
    /// RSA operation failed
    ///
    /// Covers key generation and loading, OAEP key wrapping, and PSS
    /// signing or verification.
    #[error("RSA operation failed: {message}")]
    RsaError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },

    /// Symmetric (AES-GCM) encryption or decryption failed
    #[error("Cipher operation failed: {message}")]
    CipherError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },

    /// A JWE or JWS envelope could not be built or parsed
    #[error("Envelope error: {message}")]
    EnvelopeError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },

    /// A capability call exceeded the per-task timeout
    #[error("Task timed out after {timeout_ms}ms")]
    TimeoutError {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// A dispatched task ended without delivering a result
    #[error("Task aborted: {message}")]
    TaskError {
        /// Internal error message for logging
        message: String,
    },

    /// HTTP server operation failed
    #[error("Server error: {message}")]
    ServerError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },

    /// Invalid client request
    ///
    /// The message is built by the decoder from the request shape only and
    /// is safe to return to the client.
    #[error("Invalid request: {message}")]
    RequestError {
        /// Client-safe description of the problem
        message: String,
    },

    /// Request body exceeded the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Request carried a content type other than JSON
    #[error("Unsupported content type: {content_type}")]
    UnsupportedMediaType {
        /// The content type that was received
        content_type: String,
    },

    /// Server configuration is invalid
    ///
    /// Also used for fatal capability setup failures at start-up.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },

    /// Unexpected internal system error
    #[error("Internal error: {message}")]
    InternalError {
        /// Internal error message for logging
        message: String,
        /// Optional source error for error chain analysis
        #[source]
        source: Option<BoxedSource>,
    },
}

impl EncrypterError {
    /// Create a new RSA error with message and optional source
    #[inline]
    pub fn rsa_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::RsaError {
            message: message.into(),
            source,
        }
    }

    /// Create a new cipher error with message and optional source
    #[inline]
    pub fn cipher_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::CipherError {
            message: message.into(),
            source,
        }
    }

    /// Create a new envelope error with message and optional source
    #[inline]
    pub fn envelope_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::EnvelopeError {
            message: message.into(),
            source,
        }
    }

    /// Create a timeout error for a capability call
    #[inline]
    pub fn timeout_error(timeout_ms: u64) -> Self {
        Self::TimeoutError { timeout_ms }
    }

    /// Create an error for a task that never delivered its result
    #[inline]
    pub fn task_error<T>(message: T) -> Self
    where
        T: Into<String>,
    {
        Self::TaskError {
            message: message.into(),
        }
    }

    /// Create a new server error with message and optional source
    #[inline]
    pub fn server_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::ServerError {
            message: message.into(),
            source,
        }
    }

    /// Create a new request error with a client-safe message
    #[inline]
    pub fn request_error<T>(message: T) -> Self
    where
        T: Into<String>,
    {
        Self::RequestError {
            message: message.into(),
        }
    }

    /// Create a new configuration error with message and optional source
    #[inline]
    pub fn config_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a new internal error with message and optional source
    #[inline]
    pub fn internal_error<T>(message: T, source: Option<BoxedSource>) -> Self
    where
        T: Into<String>,
    {
        Self::InternalError {
            message: message.into(),
            source,
        }
    }

    /// Get the HTTP status code for this error
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RequestError { .. } | Self::EnvelopeError { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::UnsupportedMediaType { .. } => 415,
            Self::TimeoutError { .. } => 504,
            Self::RsaError { .. }
            | Self::CipherError { .. }
            | Self::TaskError { .. }
            | Self::ServerError { .. }
            | Self::ConfigError { .. }
            | Self::InternalError { .. } => 500,
        }
    }

    /// Get the sanitized error message for client responses
    ///
    /// Decode errors keep their descriptive text since it only describes the
    /// shape of the request body. Everything else maps to a fixed phrase.
    #[inline]
    #[must_use]
    pub fn client_message(&self) -> &str {
        match self {
            Self::RequestError { message } => message,
            Self::PayloadTooLarge { .. } => "Request body too large",
            Self::UnsupportedMediaType { .. } => "Content-Type header is not application/json",
            Self::EnvelopeError { .. } => "Malformed envelope",
            Self::TimeoutError { .. } => "Operation timed out",
            Self::RsaError { .. } | Self::CipherError { .. } => "Cryptographic operation failed",
            Self::ConfigError { .. } => "Service unavailable",
            Self::TaskError { .. } | Self::ServerError { .. } | Self::InternalError { .. } => {
                "Internal server error"
            }
        }
    }

    /// Get the internal error message for logging
    ///
    /// May contain sensitive detail; never send this to clients.
    #[must_use]
    pub fn internal_message(&self) -> String {
        match self {
            Self::RsaError { message, .. }
            | Self::CipherError { message, .. }
            | Self::EnvelopeError { message, .. }
            | Self::TaskError { message }
            | Self::ServerError { message, .. }
            | Self::RequestError { message }
            | Self::ConfigError { message, .. }
            | Self::InternalError { message, .. } => message.clone(),
            Self::TimeoutError { .. }
            | Self::PayloadTooLarge { .. }
            | Self::UnsupportedMediaType { .. } => self.to_string(),
        }
    }

    /// Check if this error should be logged at ERROR level
    ///
    /// Client mistakes and per-task timeouts are expected and log at WARN.
    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Self::RequestError { .. }
                | Self::PayloadTooLarge { .. }
                | Self::UnsupportedMediaType { .. }
                | Self::EnvelopeError { .. }
                | Self::TimeoutError { .. }
        )
    }
}

impl From<std::io::Error> for EncrypterError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::server_error(format!("I/O error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_json::Error> for EncrypterError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::request_error(format!("JSON parsing error: {err}"))
    }
}

impl From<hyper::Error> for EncrypterError {
    #[inline]
    fn from(err: hyper::Error) -> Self {
        Self::server_error(format!("Hyper error: {err}"), Some(Box::new(err)))
    }
}

impl From<hyper::http::Error> for EncrypterError {
    #[inline]
    fn from(err: hyper::http::Error) -> Self {
        Self::server_error(format!("HTTP error: {err}"), Some(Box::new(err)))
    }
}

impl From<rsa::Error> for EncrypterError {
    #[inline]
    fn from(err: rsa::Error) -> Self {
        Self::rsa_error(err.to_string(), Some(Box::new(err)))
    }
}

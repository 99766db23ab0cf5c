//! # Request Handlers Module
//!
//! HTTP handlers for the batch encrypter. Each handler owns the state it
//! needs and returns `Result<Response<_>>`; the router in the parent module
//! turns errors into JSON error responses.
//!
//! Request bodies are decoded strictly: a single JSON value, no unknown
//! fields, no trailing data, and a bounded size.

use super::config::FileConfig;
use crate::error::{BoxedSource, EncrypterError, Result};
use crate::pipeline::Dispatcher;
use crate::types::{IncomingMessage, LogRequest};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn, Level};

/// Handler for `POST /encrypt`
///
/// Decodes a JSON array of `{"content": "..."}` messages, runs the whole batch
/// through the [`Dispatcher`], logs every per-message failure and answers
/// `201 Created` with an empty body. The results themselves are not returned
/// to the caller.
#[derive(Debug, Clone)]
pub struct EncryptHandler {
    dispatcher: Dispatcher,
    max_payload_size: usize,
}

impl EncryptHandler {
    /// Create a new encrypt handler
    #[must_use]
    pub fn new(dispatcher: Dispatcher, max_payload_size: usize) -> Self {
        Self {
            dispatcher,
            max_payload_size,
        }
    }

    /// The dispatcher batches are sent to.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handle `POST /encrypt`
    ///
    /// ## Request Format
    /// ```text
    /// POST /encrypt
    /// Content-Type: application/json
    ///
    /// [{"content": "a"}, {"content": "b"}]
    /// ```
    ///
    /// ## Errors
    /// - `EncrypterError::UnsupportedMediaType`: Content-Type present but not JSON
    /// - `EncrypterError::PayloadTooLarge`: body exceeds the configured limit
    /// - `EncrypterError::RequestError`: body is not a single well-formed batch
    #[instrument(level = "debug", name = "encrypt_handler", skip(self, request))]
    pub async fn handle<B>(&self, request: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let batch: Vec<IncomingMessage> =
            decode_json_body(request, self.max_payload_size).await?;
        debug!("Decoded batch of {} messages", batch.len());

        let results = self.dispatcher.process(batch).await;
        for result in &results {
            if let Some(e) = &result.encrypt_error {
                warn!(index = result.index, "encrypted value: {}", e.internal_message());
            }
            if let Some(e) = &result.sign_error {
                warn!(index = result.index, "signed value: {}", e.internal_message());
            }
        }
        info!(
            "Results returned with {} messages encrypted and signed.",
            results.len()
        );

        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("cache-control", "no-cache")
            .body(Full::new(Bytes::new()))?)
    }
}

/// What `POST /log` resolved for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDecision {
    /// Level in effect for this user's request
    pub level: Level,
    /// Whether a per-user override replaced the base level
    pub overridden: bool,
    /// Whether the unredacted user id was written to the log
    pub user_logged: bool,
}

/// Handler for `POST /log`
///
/// Re-reads `config.json` on every request so that edits to `logLevel` and to
/// the per-user override take effect immediately. A level pinned on the
/// command line or in the environment always wins over the file.
#[derive(Debug, Clone)]
pub struct LogHandler {
    config_dir: PathBuf,
    startup_level: Level,
    pinned_level: Option<Level>,
    max_payload_size: usize,
}

impl LogHandler {
    /// Create a log handler reading overrides from `config_dir`.
    ///
    /// `startup_level` is used whenever the file cannot be read.
    #[must_use]
    pub fn new(
        config_dir: impl Into<PathBuf>,
        startup_level: Level,
        max_payload_size: usize,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            startup_level,
            pinned_level: None,
            max_payload_size,
        }
    }

    /// Ignore `logLevel` in the file and always use `level` as the base.
    #[must_use]
    pub fn with_pinned_level(mut self, level: Option<Level>) -> Self {
        self.pinned_level = level;
        self
    }

    /// Handle `POST /log` with body `{"user": "..."}`
    ///
    /// ## Errors
    /// Same decoding errors as [`EncryptHandler::handle`].
    #[instrument(level = "debug", name = "log_handler", skip(self, request))]
    pub async fn handle<B>(&self, request: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let log_request: LogRequest = decode_json_body(request, self.max_payload_size).await?;
        self.resolve(&log_request.user);

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("cache-control", "no-cache")
            .body(Full::new(Bytes::new()))?)
    }

    /// Work out the effective level for `user` and log accordingly.
    ///
    /// The user id itself is only written when the effective level is DEBUG
    /// or more verbose; a redacted line is always written.
    pub fn resolve(&self, user: &str) -> LogDecision {
        let (base_level, file) = match FileConfig::load(&self.config_dir) {
            Ok(file) => {
                let base = self
                    .pinned_level
                    .or_else(|| file.log_level.map(|level| level.inner()))
                    .unwrap_or(Level::INFO);
                (base, file)
            }
            Err(e) => {
                warn!("Ignoring log overrides: {}", e.internal_message());
                (
                    self.pinned_level.unwrap_or(self.startup_level),
                    FileConfig::default(),
                )
            }
        };

        let override_level = file
            .overrides
            .as_ref()
            .and_then(|o| o.level_for(base_level, user));
        let level = override_level.unwrap_or(base_level);
        let user_logged = level >= Level::DEBUG;

        if user_logged {
            info!(effective_level = %level, "user id is {}", user);
        }
        info!("user id is XXXXXXX redacted");

        LogDecision {
            level,
            overridden: override_level.is_some(),
            user_logged,
        }
    }
}

/// Reject a request whose Content-Type is present and not `application/json`.
///
/// Parameters such as `; charset=utf-8` are ignored.
pub fn check_content_type(headers: &HeaderMap) -> Result<()> {
    let Some(value) = headers.get(CONTENT_TYPE) else {
        return Ok(());
    };

    let raw = value.to_str().unwrap_or_default();
    let media_type = raw.split(';').next().unwrap_or_default().trim();
    if media_type.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else {
        Err(EncrypterError::UnsupportedMediaType {
            content_type: raw.to_string(),
        })
    }
}

/// Read at most `limit` bytes of `request`'s body and decode it strictly.
///
/// ## Errors
/// - `EncrypterError::UnsupportedMediaType`: wrong Content-Type
/// - `EncrypterError::PayloadTooLarge`: body longer than `limit`
/// - `EncrypterError::RequestError`: see [`decode_json`]
pub async fn decode_json_body<T, B>(request: Request<B>, limit: usize) -> Result<T>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<BoxedSource>,
{
    check_content_type(request.headers())?;

    let body = Limited::new(request.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                EncrypterError::PayloadTooLarge { limit }
            } else {
                EncrypterError::request_error(format!("Failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    decode_json(&body)
}

/// Decode exactly one JSON value of type `T` from `bytes`.
///
/// Every failure becomes a `RequestError` whose message is safe to return
/// to the client.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(EncrypterError::request_error(
            "Request body must not be empty",
        ));
    }

    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let value: T =
        serde::Deserialize::deserialize(&mut deserializer).map_err(describe_json_error)?;
    deserializer.end().map_err(|_| {
        EncrypterError::request_error("Request body must only contain a single JSON object")
    })?;

    Ok(value)
}

fn describe_json_error(e: serde_json::Error) -> EncrypterError {
    let message = match e.classify() {
        Category::Eof => "Request body contains badly-formed JSON".to_string(),
        Category::Syntax => format!(
            "Request body contains badly-formed JSON (at line {} column {})",
            e.line(),
            e.column()
        ),
        Category::Data => {
            let detail = e.to_string();
            match unknown_field_name(&detail) {
                Some(field) => format!("Request body contains unknown field \"{field}\""),
                None => format!(
                    "Request body contains an invalid value (at line {} column {})",
                    e.line(),
                    e.column()
                ),
            }
        }
        Category::Io => format!("Failed to read request body: {e}"),
    };
    EncrypterError::request_error(message)
}

// serde reports unknown fields as "unknown field `name`, expected ...".
fn unknown_field_name(detail: &str) -> Option<&str> {
    let rest = detail.strip_prefix("unknown field `")?;
    rest.split('`').next()
}

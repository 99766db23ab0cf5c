//! # HTTP Server Module
//!
//! Hyper-based HTTP/1.1 front-end for the batch pipeline.
//!
//! ## Routes
//!
//! | Method | Path          | Handler                                   |
//! |--------|---------------|-------------------------------------------|
//! | POST   | `/encrypt`    | [`EncryptHandler`], 201 on success         |
//! | POST   | `/log`        | [`LogHandler`], per-user log override      |
//! | GET    | `/health`     | JSON status (when enabled)                 |
//! | GET    | `/metrics`    | Prometheus counters (when enabled)         |
//! | GET    | `/public-key` | PEM verification key (real capability only) |
//!
//! Every error is rendered as `{"error": ..., "status": ...}`.
//!
//! ## Shutdown
//!
//! [`EncrypterServer::serve`] stops accepting once its shutdown future
//! resolves, asks every open connection to finish its in-flight request and
//! waits at most the configured grace period for them.

pub mod config;
pub mod handlers;
pub mod middleware;

// Re-export commonly used types
pub use config::{FileConfig, LogLevel, LogOverride, ServerConfig};
pub use handlers::{EncryptHandler, LogHandler};

use crate::crypto::{Encrypter, JoseEncrypter, MockEncrypter, RsaKeyPair};
use crate::error::{BoxedSource, EncrypterError, Result};
use crate::pipeline::{Dispatcher, PipelineMetrics};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use middleware::RequestMiddleware;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Main server instance managing HTTP connections and request routing
///
/// Owns the capability, the dispatcher built around it and the pipeline
/// metrics shared with `/health` and `/metrics`.
#[derive(Debug)]
pub struct EncrypterServer {
    /// Server configuration
    config: ServerConfig,
    /// Capability every batch is sealed with
    encrypter: Arc<dyn Encrypter>,
    /// Counters updated by the dispatcher
    metrics: Arc<PipelineMetrics>,
    /// `POST /encrypt`
    encrypt_handler: EncryptHandler,
    /// `POST /log`
    log_handler: LogHandler,
    /// Start time for uptime reporting
    started: Instant,
}

impl EncrypterServer {
    /// Create a server, building the capability described by `config`.
    ///
    /// RSA key generation runs on the blocking pool.
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if configuration is invalid or the
    ///   capability cannot be set up
    #[instrument(level = "info", name = "server_new", skip(config))]
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let setup = config.clone();
        let encrypter = tokio::task::spawn_blocking(move || build_encrypter(&setup))
            .await
            .map_err(|e| {
                EncrypterError::internal_error(
                    format!("Capability setup task failed: {e}"),
                    Some(Box::new(e)),
                )
            })??;

        Self::with_encrypter(config, encrypter)
    }

    /// Create a server around an already-built capability.
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if configuration is invalid
    pub fn with_encrypter(config: ServerConfig, encrypter: Arc<dyn Encrypter>) -> Result<Self> {
        config.validate()?;

        let config_file = config.config_path.join(config::CONFIG_FILE_NAME);
        if !config_file.exists() {
            warn!(
                "Config file {} not found; using defaults",
                config_file.display()
            );
        }
        let file_config = config.load_file_config()?;
        let base_level = config.resolved_log_level(&file_config);

        let metrics = Arc::new(PipelineMetrics::default());
        let dispatcher = Dispatcher::new(Arc::clone(&encrypter), config.concurrency_limit)?
            .with_task_timeout(config.task_timeout())
            .with_metrics(Arc::clone(&metrics));

        let encrypt_handler = EncryptHandler::new(dispatcher, config.max_payload_size);
        let log_handler = LogHandler::new(
            config.config_path.clone(),
            base_level,
            config.max_payload_size,
        )
        .with_pinned_level(config.log_level.map(|level| level.inner()));

        info!(
            capability = encrypter.name(),
            concurrency_limit = config.concurrency_limit,
            "Batch encrypter server initialized"
        );

        Ok(Self {
            config,
            encrypter,
            metrics,
            encrypt_handler,
            log_handler,
            started: Instant::now(),
        })
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Pipeline counters shared with the dispatcher
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    ///
    /// ## Errors
    /// - `EncrypterError::ServerError`: if the address cannot be bound
    #[instrument(level = "info", name = "server_run", skip(self, shutdown))]
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind to address {}: {}", bind_addr, e);
            EncrypterError::server_error(
                format!("Failed to bind to address {bind_addr}: {e}"),
                Some(Box::new(e)),
            )
        })?;

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// drain open connections for at most the configured grace period.
    ///
    /// ## Errors
    /// - `EncrypterError::ServerError`: if the listener address is unavailable
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        let grace = self.config.graceful_timeout();
        info!("Server listening on {}", local_addr);

        let server = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let server = Arc::clone(&server);
                    let mut shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request| {
                            let server = Arc::clone(&server);
                            async move { server.handle_request(request, remote_addr).await }
                        });
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = shutdown_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = result {
                            debug!("Connection error from {}: {}", remote_addr, e);
                        }
                        // shutdown_rx drops here, which is what the drain waits on
                    });
                }
                () = &mut shutdown => {
                    info!("Shutdown requested; no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        drop(shutdown_rx);
        // Receivers only exist in live connection tasks now.
        let _ = shutdown_tx.send(true);

        if tokio::time::timeout(grace, shutdown_tx.closed()).await.is_err() {
            warn!(
                open_connections = shutdown_tx.receiver_count(),
                "Graceful timeout of {:?} elapsed with connections still open", grace
            );
        } else {
            info!("All connections closed");
        }

        Ok(())
    }

    /// Route one request and turn any handler error into a JSON response.
    #[instrument(level = "debug", name = "handle_request", skip(self, request))]
    pub async fn handle_request<B>(
        &self,
        request: Request<B>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxedSource>,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let timer = RequestMiddleware::start(&method, &path);

        let response = match (&method, path.as_str()) {
            (&Method::POST, "/encrypt") => self.encrypt_handler.handle(request).await,
            (&Method::POST, "/log") => self.log_handler.handle(request).await,
            (&Method::GET, "/health") if self.config.enable_health_check => {
                self.handle_health_check()
            }
            (&Method::GET, "/metrics") if self.config.enable_metrics => self.handle_metrics(),
            (&Method::GET, "/public-key") => Ok(self.handle_public_key()),
            _ => {
                warn!("Unknown endpoint: {} {}", method, path);
                Ok(create_error_response(StatusCode::NOT_FOUND, "Not found"))
            }
        };

        let final_response = match response {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_critical() {
                    error!("Critical error handling request from {}: {}", remote_addr, e);
                } else {
                    warn!(
                        "Request error from {}: {}",
                        remote_addr,
                        e.internal_message()
                    );
                }

                create_error_response(
                    StatusCode::from_u16(e.status_code())
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    e.client_message(),
                )
            }
        };

        timer.log_completion(final_response.status());
        Ok(final_response)
    }

    /// JSON status including the pipeline counters
    fn handle_health_check(&self) -> Result<Response<Full<Bytes>>> {
        let metrics = self.metrics.snapshot();

        let health_status = serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION,
            "uptime_secs": self.started.elapsed().as_secs(),
            "capability": self.encrypter.name(),
            "concurrency_limit": self.config.concurrency_limit,
            "pipeline": {
                "batches": metrics.batches,
                "messages": metrics.messages,
                "encrypt_errors": metrics.encrypt_errors,
                "sign_errors": metrics.sign_errors,
                "timeouts": metrics.timeouts,
                "error_rate": metrics.error_rate_percent(),
                "avg_batch_latency_ms": metrics.average_batch_latency_ms(),
            }
        });

        let response_body = serde_json::to_string(&health_status).map_err(|e| {
            EncrypterError::internal_error(
                format!("Failed to serialize health status: {e}"),
                Some(Box::new(e)),
            )
        })?;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .body(Full::new(Bytes::from(response_body)))?)
    }

    /// Pipeline counters in Prometheus text format
    fn handle_metrics(&self) -> Result<Response<Full<Bytes>>> {
        let metrics = self.metrics.snapshot();

        let prometheus_metrics = format!(
            "# HELP batch_encrypter_batches_total Batches processed\n\
             # TYPE batch_encrypter_batches_total counter\n\
             batch_encrypter_batches_total {}\n\
             # HELP batch_encrypter_messages_total Messages processed\n\
             # TYPE batch_encrypter_messages_total counter\n\
             batch_encrypter_messages_total {}\n\
             # HELP batch_encrypter_encrypt_errors_total Messages that failed to encrypt\n\
             # TYPE batch_encrypter_encrypt_errors_total counter\n\
             batch_encrypter_encrypt_errors_total {}\n\
             # HELP batch_encrypter_sign_errors_total Messages that failed to sign\n\
             # TYPE batch_encrypter_sign_errors_total counter\n\
             batch_encrypter_sign_errors_total {}\n\
             # HELP batch_encrypter_timeouts_total Capability calls cut off by the task timeout\n\
             # TYPE batch_encrypter_timeouts_total counter\n\
             batch_encrypter_timeouts_total {}\n\
             # HELP batch_encrypter_batch_latency_ms_total Total batch wall-clock time in milliseconds\n\
             # TYPE batch_encrypter_batch_latency_ms_total counter\n\
             batch_encrypter_batch_latency_ms_total {}\n",
            metrics.batches,
            metrics.messages,
            metrics.encrypt_errors,
            metrics.sign_errors,
            metrics.timeouts,
            metrics.total_latency_ms,
        );

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .header(CACHE_CONTROL, "no-cache")
            .body(Full::new(Bytes::from(prometheus_metrics)))?)
    }

    /// PEM public key for verifying signatures; 404 for the mock
    fn handle_public_key(&self) -> Response<Full<Bytes>> {
        let Some(pem) = self.encrypter.public_key_pem() else {
            return create_error_response(StatusCode::NOT_FOUND, "Not found");
        };

        let mut response = Response::new(Full::new(Bytes::from(pem.to_string())));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-pem-file"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
        response
    }
}

/// Build the capability selected by `config`.
///
/// - `mock`: [`MockEncrypter`] with the configured delay
/// - key path given: [`JoseEncrypter`] over the loaded PEM key
/// - otherwise: [`JoseEncrypter`] over a freshly generated key pair
///
/// Any failure is reported as a `ConfigError`, since the service cannot run
/// without its capability.
pub fn build_encrypter(config: &ServerConfig) -> Result<Arc<dyn Encrypter>> {
    if config.mock {
        info!(delay_ms = config.mock_delay_ms, "Using mock capability");
        return Ok(Arc::new(MockEncrypter::new(config.mock_delay())));
    }

    let keys = match &config.rsa_private_key_path {
        Some(path) => {
            info!("Loading RSA private key from {}", path.display());
            RsaKeyPair::from_pem_file(path)
        }
        None => {
            info!(bits = config.rsa_key_bits, "Generating RSA key pair");
            RsaKeyPair::generate(config.rsa_key_bits)
        }
    }
    .map_err(|e| {
        EncrypterError::config_error(
            format!("Capability setup failed: {}", e.internal_message()),
            Some(Box::new(e)),
        )
    })?;

    Ok(Arc::new(JoseEncrypter::new(Arc::new(keys))))
}

/// JSON error response `{"error": message, "status": code}`
#[must_use]
pub fn create_error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let error_body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
    });

    let body_string = serde_json::to_string(&error_body)
        .unwrap_or_else(|_| r#"{"error":"Internal server error","status":500}"#.to_string());

    let mut response = Response::new(Full::new(Bytes::from(body_string)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Build a server from `config` and serve until `shutdown` resolves.
///
/// ## Example
/// ```rust,no_run
/// use batch_encrypter::{start_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig {
///         bind_addr: "127.0.0.1:9090".parse()?,
///         mock: true,
///         ..ServerConfig::default()
///     };
///
///     start_server(config, async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await?;
///     Ok(())
/// }
/// ```
///
/// ## Errors
/// - `EncrypterError::ConfigError`: invalid configuration or capability setup failure
/// - `EncrypterError::ServerError`: the address cannot be bound
#[instrument(level = "info", name = "start_server", skip(config, shutdown))]
pub async fn start_server<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let server = EncrypterServer::new(config).await?;
    server.run(shutdown).await
}

//! # Batch Encrypter Binary
//!
//! HTTP service that encrypts and signs batches of messages with bounded
//! concurrency.
//!
//! ## Usage
//!
//! ```bash
//! # Real cryptography with a key generated at start-up
//! batch-encrypter
//!
//! # Load a key, allow 16 concurrent operations
//! batch-encrypter --rsa-key /path/to/private_key.pem --concurrency-limit 16
//!
//! # Fixed-delay mock for load testing the dispatcher
//! batch-encrypter --mock --mock-delay 250
//!
//! # With environment variables
//! export ENCRYPTER_BIND_ADDR=0.0.0.0:9090
//! export CONFIG_PATH=/etc/batch-encrypter
//! export LOG_LEVEL=debug
//! batch-encrypter
//! ```
//!
//! ## Exit Codes
//! - 0: Clean shutdown
//! - 1: Configuration or logging error
//! - 2: Capability setup failed (key generation or loading)
//! - 3: Runtime error (bind failure, runtime construction)

use batch_encrypter::server::{EncrypterServer, FileConfig, ServerConfig};
use batch_encrypter::EncrypterError;
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let config = ServerConfig::from_args();

    // Logging is not up yet, so a bad file is reported after init.
    let file_config = config.load_file_config();
    let base_level = match &file_config {
        Ok(file) => config.resolved_log_level(file),
        Err(_) => config.resolved_log_level(&FileConfig::default()),
    };

    if let Err(e) = setup_logging(base_level) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    if let Err(e) = file_config {
        error!("{}", e.internal_message());
        process::exit(1);
    }

    info!("Starting Batch Encrypter v{}", batch_encrypter::VERSION);
    display_startup_info(&config, base_level);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e.internal_message());
        process::exit(1);
    }

    let worker_threads = config.get_worker_threads();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("batch-encrypter-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build Tokio runtime: {}", e);
            process::exit(3);
        }
    };
    info!("Using {} worker threads", worker_threads);

    let code = runtime.block_on(run(config));
    process::exit(code);
}

/// Build the server and serve until a shutdown signal arrives.
///
/// Returns the process exit code.
async fn run(config: ServerConfig) -> i32 {
    let server = match EncrypterServer::new(config).await {
        Ok(server) => server,
        Err(e @ EncrypterError::ConfigError { .. }) => {
            error!("Capability setup failed: {}", e.internal_message());
            return 2;
        }
        Err(e) => {
            error!("Server initialization failed: {}", e.internal_message());
            return 3;
        }
    };

    match server.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Server shut down cleanly");
            0
        }
        Err(e) => {
            error!("Server error: {}", e.internal_message());
            3
        }
    }
}

/// Setup structured logging at `level`
///
/// `RUST_LOG` directives, when set, take precedence over the default.
///
/// ## Log Format
/// - **Development**: Pretty-printed with colors
/// - **Production** (`ENVIRONMENT=production`): JSON
fn setup_logging(level: Level) -> Result<(), Box<dyn std::error::Error>> {
    let is_production = std::env::var("ENVIRONMENT")
        .map(|env| env.eq_ignore_ascii_case("production"))
        .unwrap_or(false);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?
        .add_directive("hyper=info".parse()?)
        .add_directive("tokio=info".parse()?)
        .add_directive("mio=warn".parse()?);

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();

        info!("Initialized structured JSON logging");
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .init();

        info!("Initialized pretty-printed logging");
    }

    Ok(())
}

/// Completes on SIGINT or SIGTERM
///
/// If a handler cannot be installed the corresponding branch never fires;
/// the other one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        () = terminate => {
            info!("Received SIGTERM");
        },
    }
}

fn display_startup_info(config: &ServerConfig, level: Level) {
    info!("Bind Address: {}", config.bind_addr);
    if config.mock {
        info!("Capability: mock ({}ms delay)", config.mock_delay_ms);
    } else if let Some(path) = &config.rsa_private_key_path {
        info!("Capability: JOSE, key from {}", path.display());
    } else {
        info!("Capability: JOSE, generated {}-bit key", config.rsa_key_bits);
    }
    info!("Log Level: {}", level);
    info!("Concurrency Limit: {}", config.concurrency_limit);
    match config.task_timeout_ms {
        Some(ms) => info!("Task Timeout: {}ms", ms),
        None => info!("Task Timeout: none"),
    }
    info!("Max Payload Size: {} bytes", config.max_payload_size);
    info!("Graceful Timeout: {}s", config.graceful_timeout_secs);
    info!(
        "Health Check: {}",
        if config.enable_health_check {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!(
        "Metrics: {}",
        if config.enable_metrics {
            "enabled"
        } else {
            "disabled"
        }
    );
}

//! # Batch Encrypter Library
//!
//! Encrypts and signs batches of messages with bounded concurrency. Every
//! message in a batch gets exactly one result, in input order, whether the
//! operation succeeded or not.
//!
//! ## Architecture
//!
//! - [`types`] - Incoming messages and per-message results
//! - [`crypto`] - The [`Encrypter`] capability: real JWE/JWS sealing and a fixed-delay mock
//! - [`pipeline`] - [`Dispatcher`] fan-out with a concurrency gate, [`Collector`](pipeline::Collector) fan-in
//! - [`server`] - Hyper-based HTTP front-end and configuration
//! - [`error`] - Error type shared across all of the above
//!
//! ## Processing Model
//!
//! 1. **Fan-out**: one task per message; at most `concurrency_limit` run the capability at once
//! 2. **Seal**: each task encrypts its plaintext, then signs the resulting envelope
//! 3. **Fan-in**: results are placed by the index stamped on them, not by arrival order
//! 4. **Per-item failure**: errors live in the result, so a failed message never shortens the batch
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use batch_encrypter::{Dispatcher, Encrypter, IncomingMessage, JoseEncrypter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let encrypter: Arc<dyn Encrypter> = Arc::new(JoseEncrypter::generate(2048)?);
//!     let dispatcher = Dispatcher::new(encrypter, 75)?;
//!
//!     let batch = vec![IncomingMessage::new("a"), IncomingMessage::new("b")];
//!     for result in dispatcher.process(batch).await {
//!         println!("{} -> {}", result.index, result.signed_message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Thread Safety
//!
//! The capability is shared across tasks behind an `Arc` and must be
//! `Send + Sync`. Batches are independent: each call to
//! [`Dispatcher::process`] gets its own gate and completion channel.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod types;

// Re-export commonly used types for convenience
pub use crypto::{Encrypter, JoseEncrypter, MockEncrypter};
pub use error::{EncrypterError, Result};
pub use pipeline::{process, Dispatcher};
pub use server::{start_server, ServerConfig};
pub use types::{IncomingMessage, MessageResult};

use std::net::{IpAddr, Ipv4Addr};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port
pub const DEFAULT_PORT: u16 = 9090;

/// Default bind address for the server
pub const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Maximum request payload size in bytes (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// RSA key minimum size in bits
///
/// Smaller keys are rejected when loading or generating.
pub const MIN_RSA_KEY_SIZE: usize = 2048;

/// Modulus size used when the key pair is generated at start-up
pub const DEFAULT_RSA_KEY_BITS: usize = 2048;

/// Default number of simultaneous capability calls per batch
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 75;

/// Seconds shutdown waits for in-flight requests
pub const GRACEFUL_TIMEOUT_SECS: u64 = 90;

//! # Middleware Module
//!
//! Request timing and completion logging for the HTTP front-end.

use hyper::{Method, StatusCode};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Request timing and logging middleware
///
/// Created when a request is routed and consumed once its response status
/// is known. Client and server errors log at WARN, everything else at INFO.
#[derive(Debug, Clone)]
pub struct RequestMiddleware {
    method: Method,
    path: String,
    start_time: Instant,
}

impl RequestMiddleware {
    /// Start timing a request
    #[must_use]
    pub fn start(method: &Method, path: &str) -> Self {
        Self {
            method: method.clone(),
            path: path.to_string(),
            start_time: Instant::now(),
        }
    }

    /// Time elapsed since the request was routed
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Log request completion with timing and return the elapsed time
    pub fn log_completion(self, status: StatusCode) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        if status.is_client_error() || status.is_server_error() {
            warn!(
                "Request completed: {} {} - {} ({:.2}ms)",
                self.method,
                self.path,
                status.as_u16(),
                elapsed_ms
            );
        } else {
            info!(
                "Request completed: {} {} - {} ({:.2}ms)",
                self.method,
                self.path,
                status.as_u16(),
                elapsed_ms
            );
        }
        elapsed
    }
}

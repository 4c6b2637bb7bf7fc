//! Network configuration for the request server.

use std::path::PathBuf;
use std::time::Duration;

/// Listener configuration for the HTTP request server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Upper bound for one HTTP exchange. Longer than any function timeout
    /// so the invoker, not the transport, reports timeouts.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(15 * 60),
            max_body_bytes: 6 * 1024 * 1024,
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

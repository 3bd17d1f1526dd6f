//! MCP Auth Bridge Library
//!
//! Connects a local stdio MCP client to a remote MCP server that requires
//! OAuth 2.0 authorization.
//!
//! # Features
//!
//! - **Discovery**: protected-resource and authorization-server metadata with SSRF guards
//! - **Authorization**: PKCE code flow, dynamic client registration, resource indicators
//! - **Coordination**: one browser login per server across concurrent processes
//! - **Refresh**: background token refresh with per-server backoff and disk locks
//! - **Transports**: Streamable HTTP and HTTP+SSE with automatic fallback
//!
//! # Protocol Version
//!
//! Speaks MCP protocol version 2025-11-25.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod protocol;
pub mod security;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Logs always go to stderr; stdout carries the JSON-RPC stream.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))
}

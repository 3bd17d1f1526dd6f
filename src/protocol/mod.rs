//! MCP JSON-RPC envelope types (version 2025-11-25)

mod messages;

pub use messages::*;

/// MCP Protocol version
pub const PROTOCOL_VERSION: &str = "2025-11-25";

//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::config::{Config, json_arg};
use crate::oauth::{ClientRegistration, Invalidation};
use crate::transport::TransportStrategy;
use crate::{Error, Result};

/// Bridge a local stdio MCP client to a remote OAuth-protected MCP server
#[derive(Parser, Debug)]
#[command(name = "mcp-auth-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Credential directory (default ~/.mcp-auth)
    #[arg(long, env = "MCP_BRIDGE_CONFIG_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Keep credentials in a directory pinned to this version
    #[arg(long, env = "MCP_BRIDGE_VERSIONED_STORAGE", global = true)]
    pub versioned_storage: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_BRIDGE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Proxy stdin/stdout to the remote server
    Proxy(ConnectArgs),

    /// Connect, list tools and resources, print them as JSON
    Client(ConnectArgs),

    /// Keep stored tokens fresh until interrupted
    Refresh,

    /// Delete stored credentials for a server
    Reset {
        /// Remote MCP server URL
        server_url: Url,

        /// Which records to delete (all, client, tokens, verifier)
        #[arg(long, default_value = "all")]
        scope: Invalidation,

        /// Resource indicator the credentials were stored under
        #[arg(long)]
        resource: Option<String>,

        /// Custom headers the credentials were stored under ("Name: value")
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
    },
}

/// Options shared by commands that connect to a server
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Remote MCP server URL
    pub server_url: Url,

    /// Extra request header ("Name: value"); `${VAR}` is expanded
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Transport preference
    #[arg(long, value_enum)]
    pub strategy: Option<TransportStrategy>,

    /// Port for the OAuth callback listener
    #[arg(long)]
    pub callback_port: Option<u16>,

    /// Host placed in the OAuth redirect URI
    #[arg(long)]
    pub callback_host: Option<String>,

    /// OAuth scope to request
    #[arg(long)]
    pub scope: Option<String>,

    /// Resource indicator (RFC 8707)
    #[arg(long)]
    pub resource: Option<String>,

    /// Extra client metadata for dynamic registration (JSON or @file)
    #[arg(long)]
    pub static_client_metadata: Option<String>,

    /// Pre-registered client information (JSON or @file)
    #[arg(long)]
    pub static_client_info: Option<String>,

    /// Allow plain HTTP to non-local servers
    #[arg(long)]
    pub allow_http: bool,

    /// Skip TLS certificate verification for the remote server
    #[arg(long, env = "MCP_BRIDGE_INSECURE")]
    pub insecure: bool,

    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    pub no_browser: bool,
}

impl ConnectArgs {
    /// Overlay command-line options onto `config`
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            config.transport.headers.insert(name, value);
        }
        if let Some(strategy) = self.strategy {
            config.transport.strategy = strategy;
        }
        config.transport.allow_http |= self.allow_http;
        config.transport.insecure |= self.insecure;

        let auth = &mut config.auth;
        if self.callback_port.is_some() {
            auth.callback_port = self.callback_port;
        }
        if let Some(host) = &self.callback_host {
            auth.callback_host.clone_from(host);
        }
        if self.scope.is_some() {
            auth.scope.clone_from(&self.scope);
        }
        if self.resource.is_some() {
            auth.resource.clone_from(&self.resource);
        }
        if let Some(raw) = &self.static_client_metadata {
            auth.static_client_metadata = Some(json_arg(raw)?);
        }
        if let Some(raw) = &self.static_client_info {
            let info: ClientRegistration = serde_json::from_value(json_arg(raw)?)
                .map_err(|e| Error::Config(format!("Invalid static client info: {e}")))?;
            auth.static_client_info = Some(info);
        }
        auth.no_browser |= self.no_browser;

        config.expand_env_vars();
        Ok(())
    }
}

/// Split a `Name: value` header argument
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("Header must look like \"Name: value\": {raw}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Config(format!("Header name is empty: {raw}")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

//! MCP Auth Bridge - stdio to remote MCP with OAuth
//!
//! Lets a local stdio MCP client talk to a remote OAuth-protected server.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use mcp_auth_bridge::{
    Error, Result,
    bridge::{ProxyBridge, run_client},
    cli::{Cli, Command, ConnectArgs, parse_header},
    config::Config,
    oauth::{
        AuthCoordinator, CredentialStore, Invalidation, MetadataResolver, OAuthProvider, ServerKey,
        TokenRefreshManager,
    },
    setup_tracing,
    transport::{StdioTransport, TlsPolicy, TransportNegotiator},
};

/// Timeout for token endpoint and registration requests
const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(failure_status(&e));
        }
    };
    if cli.config_dir.is_some() {
        config.storage.config_dir.clone_from(&cli.config_dir);
    }
    config.storage.versioned |= cli.versioned_storage;

    let result = match cli.command {
        Command::Proxy(args) => run_connected(args, config, false).await,
        Command::Client(args) => run_connected(args, config, true).await,
        Command::Refresh => run_refresh(config).await,
        Command::Reset {
            server_url,
            scope,
            resource,
            headers,
        } => run_reset(config, &server_url, scope, resource, &headers).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_fatal() {
                error!("Fatal: {e}");
            } else {
                error!("{e}");
            }
            ExitCode::from(failure_status(&e))
        }
    }
}

/// Process exit status for a failed run: 2 for fatal misconfiguration, 1 otherwise
fn failure_status(e: &Error) -> u8 {
    if e.is_fatal() { 2 } else { 1 }
}

fn open_store(config: &Config) -> Result<Arc<CredentialStore>> {
    CredentialStore::default_location(config.storage.config_dir.clone(), config.storage.versioned).map(Arc::new)
}

fn oauth_client(config: &Config) -> Result<reqwest::Client> {
    TlsPolicy::from_env(config.transport.insecure)?
        .client_builder()
        .timeout(OAUTH_HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::Auth(format!("Failed to build HTTP client: {e}")))
}

fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            trigger.cancel();
        }
    });
    token
}

/// Proxy or one-shot client against a remote server
async fn run_connected(args: ConnectArgs, mut config: Config, client_mode: bool) -> Result<()> {
    args.apply(&mut config)?;

    let server_url = args.server_url.to_string();
    let store = open_store(&config)?;
    let key = ServerKey::derive(&server_url, config.auth.resource.as_deref(), &config.transport.headers);
    let tls = TlsPolicy::from_env(config.transport.insecure)?;
    let resolver = MetadataResolver::with_tls(&config.discovery, &tls)?;
    let http = oauth_client(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %server_url,
        key = %key,
        "Starting MCP Auth Bridge"
    );

    let provider = Arc::new(OAuthProvider::from_config(
        http.clone(),
        store.clone(),
        resolver.clone(),
        key.clone(),
        &server_url,
        &config.auth,
    ));
    let coordinator = Arc::new(AuthCoordinator::new(store.clone(), key, config.auth.clone())?);
    let negotiator = Arc::new(TransportNegotiator::new(
        args.server_url.clone(),
        provider,
        coordinator.clone(),
        &config.transport,
    )?);

    let refresher = Arc::new(TokenRefreshManager::new(store, resolver, http, config.refresh.clone()));
    if config.refresh.enabled {
        refresher.start();
    }

    let shutdown = interrupt_token();
    let connection = tokio::select! {
        connection = negotiator.connect() => connection,
        () = shutdown.cancelled() => Err(Error::Transport("interrupted while connecting".to_string())),
    };

    let result = match connection {
        Ok(connection) if client_mode => {
            let timeout = Duration::from_secs(config.transport.request_timeout_secs);
            tokio::select! {
                summary = run_client(connection, timeout) => summary.and_then(|summary| {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    Ok(())
                }),
                () = shutdown.cancelled() => Ok(()),
            }
        }
        Ok(connection) => {
            let local = Arc::new(StdioTransport::process());
            ProxyBridge::new(local, connection)
                .with_reauthorization(negotiator)
                .run(shutdown.clone())
                .await
        }
        Err(e) if shutdown.is_cancelled() => {
            info!("{e}");
            Ok(())
        }
        Err(e) => Err(e),
    };

    refresher.stop();
    coordinator.shutdown().await;
    info!("Shutdown complete");
    result
}

/// Background refresh only
async fn run_refresh(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let tls = TlsPolicy::from_env(config.transport.insecure)?;
    let resolver = MetadataResolver::with_tls(&config.discovery, &tls)?;
    let http = oauth_client(&config)?;
    let refresher = Arc::new(TokenRefreshManager::new(store, resolver, http, config.refresh.clone()));

    refresher.start();
    info!(
        interval_secs = config.refresh.scan_interval_secs,
        "Refreshing stored tokens; press Ctrl-C to stop"
    );
    interrupt_token().cancelled().await;
    refresher.stop();
    Ok(())
}

/// Delete stored credentials for one server
async fn run_reset(
    mut config: Config,
    server_url: &Url,
    scope: Invalidation,
    resource: Option<String>,
    headers: &[String],
) -> Result<()> {
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        config.transport.headers.insert(name, value);
    }
    config.expand_env_vars();
    let resource = resource.or(config.auth.resource.clone());
    let headers: &BTreeMap<String, String> = &config.transport.headers;

    let store = open_store(&config)?;
    let key = ServerKey::derive(server_url.as_str(), resource.as_deref(), headers);
    store.invalidate(&key, scope).await?;

    println!("Removed {scope:?} credentials for {server_url} ({key}) from {}", store.dir().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_load_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.yaml"))).unwrap_err();
        assert_eq!(failure_status(&err), 2);
        assert_eq!(failure_status(&Error::Auth("denied".into())), 1);
    }
}

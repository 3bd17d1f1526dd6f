//! Cross-process authorization coordination
//!
//! Only one process per server drives the browser flow. The owner holds the
//! `{key}_lock.json` lockfile, which records its pid and callback port; other
//! processes probe that port to decide whether the owner is alive and then
//! wait for the tokens it writes instead of opening a second browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::callback::{CallbackServer, WAIT_FOR_AUTH_PATH};
use super::records::{AuthLock, ServerKey, TokenRecord};
use super::storage::CredentialStore;
use crate::config::AuthConfig;
use crate::{Error, Result};

/// How long a liveness probe of another process may take
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Ownership attempts before giving up on a contended lock
const MAX_ACQUIRE_ATTEMPTS: usize = 5;

/// Outcome of [`AuthInitializer::initialize_auth`]
#[derive(Debug, Clone)]
pub struct AuthState {
    /// Another process completed authorization; use the tokens on disk
    pub skip_browser_auth: bool,
    /// Listener for the redirect, present when this process owns the flow
    pub callback: Option<Arc<CallbackServer>>,
    /// Bound on the wait for the redirect
    pub auth_timeout: Duration,
}

impl AuthState {
    /// Wait for the redirect to deliver an authorization code
    pub async fn wait_for_auth_code(&self) -> Result<String> {
        let callback = self
            .callback
            .as_ref()
            .ok_or_else(|| Error::Auth("This process does not own the authorization flow".to_string()))?;
        callback.wait_for_code(self.auth_timeout).await
    }
}

/// Entry point the transport negotiator uses when a server demands authorization
#[async_trait]
pub trait AuthInitializer: Send + Sync {
    /// Become the flow owner, or wait for the process that already is
    async fn initialize_auth(&self) -> Result<AuthState>;

    /// Release ownership after the flow ended, successfully or not
    async fn auth_finished(&self, succeeded: bool);
}

/// What a probe of the lock owner's callback port returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerStatus {
    Completed,
    Pending,
    Unreachable,
}

/// Serializes interactive authorization for one server across processes
pub struct AuthCoordinator {
    store: Arc<CredentialStore>,
    key: ServerKey,
    config: AuthConfig,
    instance_id: String,
    probe: Client,
    callback: Mutex<Option<Arc<CallbackServer>>>,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl AuthCoordinator {
    /// Create a coordinator for `key`
    pub fn new(store: Arc<CredentialStore>, key: ServerKey, config: AuthConfig) -> Result<Self> {
        let probe = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| Error::Auth(format!("Failed to build probe client: {e}")))?;
        Ok(Self {
            store,
            key,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            probe,
            callback: Mutex::new(None),
        })
    }

    /// Unique id of this coordinator, recorded in the lockfile
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Port to bind: configured, else the one a stored registration was made
    /// for, else ephemeral.
    async fn preferred_port(&self) -> u16 {
        if let Some(port) = self.config.callback_port {
            return port;
        }
        if let Some(port) = self
            .store
            .client_registration(&self.key)
            .await
            .and_then(|c| c.loopback_redirect_port())
        {
            return port;
        }
        self.store
            .server_registration(&self.key)
            .await
            .and_then(|s| s.callback_port)
            .unwrap_or(0)
    }

    async fn bind_listener(&self) -> Result<CallbackServer> {
        let port = self.preferred_port().await;
        let host = &self.config.callback_host;
        let path = &self.config.callback_path;
        match CallbackServer::bind(host, port, path).await {
            Ok(server) => Ok(server),
            Err(e) if port != 0 => {
                warn!(port, error = %e, "Preferred callback port unavailable, using an ephemeral port");
                CallbackServer::bind(host, 0, path).await
            }
            Err(e) => Err(e),
        }
    }

    /// Bind a listener and try to create the lockfile for it
    async fn try_become_owner(&self) -> Result<Option<Arc<CallbackServer>>> {
        let server = self.bind_listener().await?;
        let lock = AuthLock {
            pid: std::process::id(),
            instance_id: self.instance_id.clone(),
            port: server.port(),
            timestamp: Utc::now(),
        };

        if self.store.create_exclusive(&self.key, &lock).await? {
            info!(server = %self.key, port = lock.port, "Acquired authorization lock");
            let server = Arc::new(server);
            *self.callback.lock().await = Some(Arc::clone(&server));
            Ok(Some(server))
        } else {
            server.shutdown().await;
            Ok(None)
        }
    }

    fn owner_state(&self, callback: Arc<CallbackServer>) -> AuthState {
        AuthState {
            skip_browser_auth: false,
            callback: Some(callback),
            auth_timeout: self.config.auth_timeout(),
        }
    }

    fn waiter_state(&self) -> AuthState {
        AuthState {
            skip_browser_auth: true,
            callback: None,
            auth_timeout: self.config.auth_timeout(),
        }
    }

    async fn probe_owner(&self, port: u16) -> OwnerStatus {
        let url = format!("http://127.0.0.1:{port}{WAIT_FOR_AUTH_PATH}?poll=false");
        match self.probe.get(&url).send().await {
            Ok(r) if r.status() == StatusCode::OK => OwnerStatus::Completed,
            Ok(r) if r.status() == StatusCode::ACCEPTED => OwnerStatus::Pending,
            Ok(r) => {
                debug!(port, status = %r.status(), "Lock port answered with an unexpected status");
                OwnerStatus::Unreachable
            }
            Err(_) => OwnerStatus::Unreachable,
        }
    }

    fn lock_expired(&self, lock: &AuthLock) -> bool {
        let max_age = TimeDelta::from_std(self.config.lock_max_age()).unwrap_or(TimeDelta::weeks(52));
        Utc::now() - lock.timestamp > max_age
    }

    /// Remove a stale lock unless it changed since it was observed
    async fn remove_stale_lock(&self, observed: &AuthLock) -> Result<()> {
        let _guard = self.store.guard::<AuthLock>(&self.key).await?;
        if self.store.read::<AuthLock>(&self.key).await.as_ref() == Some(observed) {
            info!(server = %self.key, pid = observed.pid, port = observed.port, "Removing stale authorization lock");
            self.store.delete::<AuthLock>(&self.key).await?;
        }
        Ok(())
    }

    /// Wait for the owner of `lock` to finish.
    ///
    /// Returns `true` when tokens became available and `false` when the
    /// owner went away without producing any.
    async fn wait_for_owner(&self, lock: &AuthLock, before: Option<&TokenRecord>) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout();
        info!(
            server = %self.key,
            pid = lock.pid,
            port = lock.port,
            "Another process is authorizing this server, waiting for it"
        );

        loop {
            if self.tokens_changed(before).await {
                break;
            }
            match self.probe_owner(lock.port).await {
                OwnerStatus::Completed => break,
                OwnerStatus::Pending => {}
                OwnerStatus::Unreachable => {
                    if self.tokens_changed(before).await {
                        break;
                    }
                    warn!(server = %self.key, pid = lock.pid, "Authorization owner went away");
                    return Ok(false);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "Waited {}s for another process to finish authorization",
                    self.config.wait_timeout_secs
                )));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }

        // the owner may still be flushing the token file
        tokio::time::sleep(self.config.settle_delay()).await;
        info!(server = %self.key, "Authorization completed by another process");
        Ok(true)
    }

    async fn tokens_changed(&self, before: Option<&TokenRecord>) -> bool {
        match self.store.tokens(&self.key).await {
            Some(now) => before != Some(&now),
            None => false,
        }
    }

    /// Close the listener and remove the lockfile if this instance owns it
    pub async fn shutdown(&self) {
        let callback = self.callback.lock().await.take();
        if let Some(callback) = callback {
            callback.shutdown().await;
        }

        let _guard = match self.store.guard::<AuthLock>(&self.key).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(server = %self.key, error = %e, "Failed to remove authorization lock");
                return;
            }
        };
        if let Some(lock) = self.store.read::<AuthLock>(&self.key).await {
            if lock.instance_id == self.instance_id {
                if let Err(e) = self.store.delete::<AuthLock>(&self.key).await {
                    warn!(server = %self.key, error = %e, "Failed to remove authorization lock");
                } else {
                    debug!(server = %self.key, "Released authorization lock");
                }
            }
        }
    }
}

#[async_trait]
impl AuthInitializer for AuthCoordinator {
    async fn initialize_auth(&self) -> Result<AuthState> {
        if let Some(callback) = self.callback.lock().await.clone() {
            debug!(server = %self.key, "Reusing callback listener of the running flow");
            return Ok(self.owner_state(callback));
        }

        let tokens_before = self.store.tokens(&self.key).await;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if self.tokens_changed(tokens_before.as_ref()).await {
                debug!(server = %self.key, "Tokens were stored while acquiring the lock");
                return Ok(self.waiter_state());
            }

            let Some(lock) = self.store.read::<AuthLock>(&self.key).await else {
                if let Some(callback) = self.try_become_owner().await? {
                    return Ok(self.owner_state(callback));
                }
                continue;
            };

            if lock.instance_id == self.instance_id {
                // ours, but the listener is gone
                self.remove_stale_lock(&lock).await?;
                continue;
            }

            if self.lock_expired(&lock) || self.probe_owner(lock.port).await == OwnerStatus::Unreachable {
                self.remove_stale_lock(&lock).await?;
                continue;
            }

            if self.wait_for_owner(&lock, tokens_before.as_ref()).await? {
                return Ok(self.waiter_state());
            }
            self.remove_stale_lock(&lock).await?;
        }

        Err(Error::Auth(format!(
            "Could not acquire the authorization lock for {}",
            self.key
        )))
    }

    async fn auth_finished(&self, succeeded: bool) {
        let callback = self.callback.lock().await.clone();
        if succeeded {
            if let Some(callback) = &callback {
                callback.mark_completed();
            }
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> AuthConfig {
        AuthConfig {
            wait_timeout_secs: 10,
            settle_delay_ms: 10,
            poll_interval_ms: 20,
            ..AuthConfig::default()
        }
    }

    fn coordinator(store: &Arc<CredentialStore>, key: &ServerKey) -> AuthCoordinator {
        AuthCoordinator::new(Arc::clone(store), key.clone(), fast_config()).unwrap()
    }

    #[tokio::test]
    async fn first_caller_becomes_owner_and_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        let c = coordinator(&store, &key);

        let first = c.initialize_auth().await.unwrap();
        assert!(!first.skip_browser_auth);
        let port = first.callback.as_ref().unwrap().port();

        let lock: AuthLock = store.read(&key).await.unwrap();
        assert_eq!(lock.port, port);
        assert_eq!(lock.pid, std::process::id());
        assert_eq!(lock.instance_id, c.instance_id());

        let again = c.initialize_auth().await.unwrap();
        assert_eq!(again.callback.unwrap().port(), port);

        c.shutdown().await;
        assert!(store.read::<AuthLock>(&key).await.is_none());
    }

    #[tokio::test]
    async fn second_process_waits_for_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        let owner = coordinator(&store, &key);
        let waiter = Arc::new(coordinator(&store, &key));

        let owned = owner.initialize_auth().await.unwrap();
        assert!(owned.callback.is_some());

        let w = Arc::clone(&waiter);
        let waiting = tokio::spawn(async move { w.initialize_auth().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        store
            .save_tokens(&key, &TokenRecord::bearer("shared"), Utc::now())
            .await
            .unwrap();
        owner.auth_finished(true).await;

        let state = waiting.await.unwrap().unwrap();
        assert!(state.skip_browser_auth);
        assert!(state.callback.is_none());
        assert!(state.wait_for_auth_code().await.is_err());
    }

    #[tokio::test]
    async fn dead_owner_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");

        // a port nothing listens on
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let stale = AuthLock {
            pid: 999_999,
            instance_id: "gone".into(),
            port: closed,
            timestamp: Utc::now(),
        };
        assert!(store.create_exclusive(&key, &stale).await.unwrap());

        let c = coordinator(&store, &key);
        let state = c.initialize_auth().await.unwrap();
        assert!(!state.skip_browser_auth);
        let lock: AuthLock = store.read(&key).await.unwrap();
        assert_eq!(lock.instance_id, c.instance_id());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed_even_if_port_answers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");

        let other = CallbackServer::bind("localhost", 0, "/oauth/callback").await.unwrap();
        let old = AuthLock {
            pid: 1,
            instance_id: "old".into(),
            port: other.port(),
            timestamp: Utc::now() - TimeDelta::hours(2),
        };
        assert!(store.create_exclusive(&key, &old).await.unwrap());

        let c = coordinator(&store, &key);
        let state = c.initialize_auth().await.unwrap();
        assert!(state.callback.is_some());
        c.shutdown().await;
        other.shutdown().await;
    }

    #[tokio::test]
    async fn waiter_takes_over_when_owner_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        let owner = coordinator(&store, &key);
        let waiter = Arc::new(coordinator(&store, &key));

        owner.initialize_auth().await.unwrap();
        let w = Arc::clone(&waiter);
        let waiting = tokio::spawn(async move { w.initialize_auth().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        owner.auth_finished(false).await;

        let state = waiting.await.unwrap().unwrap();
        assert!(!state.skip_browser_auth);
        assert!(state.callback.is_some());
        waiter.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        let foreign = AuthLock {
            pid: 1,
            instance_id: "someone-else".into(),
            port: 1,
            timestamp: Utc::now(),
        };
        store.create_exclusive(&key, &foreign).await.unwrap();

        coordinator(&store, &key).shutdown().await;
        assert_eq!(store.read::<AuthLock>(&key).await, Some(foreign));
    }
}

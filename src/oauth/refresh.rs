//! Background token refresh
//!
//! Scans every server with stored tokens and refreshes the ones about to
//! expire, using the `{key}_refresh_lock.json` file so that only one process
//! refreshes a given server at a time. Failures are recorded in the token
//! state and back off exponentially per server.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::OAuthProvider;
use super::metadata::MetadataResolver;
use super::records::{RefreshLock, ServerKey, ServerRegistration, TokenState, is_expiring_soon};
use super::storage::CredentialStore;
use crate::Result;
use crate::config::RefreshConfig;

/// Why a server was left alone in a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A recent failure's backoff window is still open
    BackingOff,
    /// No server snapshot to rebuild the provider from
    NoServerRegistration,
    /// Tokens carry no refresh token
    NoRefreshToken,
    /// Expiry is unknown or outside the lead time
    NotExpiring,
    /// Another process holds the refresh lock
    Locked,
}

/// Result of one server in a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were written
    Refreshed,
    /// The attempt failed with this message
    Failed(String),
    /// Nothing was attempted
    Skipped(SkipReason),
}

struct Backoff {
    delays: ExponentialBackoff,
    until: DateTime<Utc>,
}

/// Periodically refreshes tokens that are about to expire
pub struct TokenRefreshManager {
    store: Arc<CredentialStore>,
    resolver: MetadataResolver,
    http: Client,
    config: RefreshConfig,
    instance_id: String,
    backoff: DashMap<ServerKey, Backoff>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for TokenRefreshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefreshManager")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenRefreshManager {
    /// Create a manager; nothing runs until [`start`](Self::start)
    #[must_use]
    pub fn new(store: Arc<CredentialStore>, resolver: MetadataResolver, http: Client, config: RefreshConfig) -> Self {
        Self {
            store,
            resolver,
            http,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            backoff: DashMap::new(),
            running: Mutex::new(None),
        }
    }

    /// Start the scan loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.scan_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Token refresh loop started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.scan_once().await;
                    }
                }
            }
            info!("Token refresh loop stopped");
        });
    }

    /// Stop the scan loop. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }

    /// Whether the loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// One pass over every server with stored tokens
    pub async fn scan_once(&self) -> Vec<(ServerKey, RefreshOutcome)> {
        self.scan_at(Utc::now()).await
    }

    /// One pass evaluated at `now`
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Vec<(ServerKey, RefreshOutcome)> {
        let keys = match self.store.list_keys_with_tokens().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Cannot list stored tokens");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let outcome = self.refresh_key(&key, now).await;
            debug!(server = %key, outcome = ?outcome, "Refresh scan");
            outcomes.push((key, outcome));
        }
        outcomes
    }

    async fn refresh_key(&self, key: &ServerKey, now: DateTime<Utc>) -> RefreshOutcome {
        if self.backoff.get(key).is_some_and(|b| b.until > now) {
            return RefreshOutcome::Skipped(SkipReason::BackingOff);
        }

        let Some(server) = self.store.server_registration(key).await else {
            return RefreshOutcome::Skipped(SkipReason::NoServerRegistration);
        };
        if !self.store.tokens(key).await.is_some_and(|t| t.refresh_token.is_some()) {
            return RefreshOutcome::Skipped(SkipReason::NoRefreshToken);
        }

        let state = self.store.read::<TokenState>(key).await;
        let lead_time = TimeDelta::try_seconds(i64::try_from(self.config.lead_time_secs).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::weeks(52));
        if !is_expiring_soon(state.as_ref(), now, lead_time) {
            return RefreshOutcome::Skipped(SkipReason::NotExpiring);
        }

        match self.try_acquire_lock(key, now).await {
            Ok(true) => {}
            Ok(false) => return RefreshOutcome::Skipped(SkipReason::Locked),
            Err(e) => {
                warn!(server = %key, error = %e, "Cannot take refresh lock");
                return RefreshOutcome::Skipped(SkipReason::Locked);
            }
        }

        let result = self.refresh_with(key, server).await;
        self.release_lock(key).await;

        match result {
            Ok(()) => {
                self.backoff.remove(key);
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                let message = e.to_string();
                warn!(server = %key, error = %message, "Token refresh failed");
                if let Err(e) = self.store.record_refresh_failure(key, &message, now).await {
                    warn!(server = %key, error = %e, "Failed to record refresh failure");
                }
                self.schedule_backoff(key, now);
                RefreshOutcome::Failed(message)
            }
        }
    }

    async fn refresh_with(&self, key: &ServerKey, server: ServerRegistration) -> Result<()> {
        let provider = OAuthProvider::new(
            self.http.clone(),
            Arc::clone(&self.store),
            self.resolver.clone(),
            key.clone(),
            server,
        );
        let bundle = provider.discover(None).await;
        provider.refresh(&bundle).await?;
        Ok(())
    }

    fn schedule_backoff(&self, key: &ServerKey, now: DateTime<Utc>) {
        let mut entry = self.backoff.entry(key.clone()).or_insert_with(|| Backoff {
            delays: ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(self.config.failure_backoff_secs))
                .with_max_delay(Duration::from_secs(
                    self.config.max_failure_backoff_secs.max(self.config.failure_backoff_secs),
                ))
                .with_factor(2.0)
                .without_max_times()
                .build(),
            until: now,
        });
        let delay = entry
            .delays
            .next()
            .unwrap_or(Duration::from_secs(self.config.max_failure_backoff_secs));
        entry.until = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::weeks(52));
        debug!(server = %key, delay_secs = delay.as_secs(), "Refresh backing off");
    }

    /// Take the refresh lock for `key`.
    ///
    /// An expired, unreadable or self-owned lock is replaced; a live lock of
    /// another owner means `false`.
    pub async fn try_acquire_lock(&self, key: &ServerKey, now: DateTime<Utc>) -> Result<bool> {
        let ttl = TimeDelta::try_seconds(i64::try_from(self.config.lock_ttl_secs).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::weeks(52));
        let lock = RefreshLock {
            pid: std::process::id(),
            instance_id: self.instance_id.clone(),
            expires_at: now + ttl,
        };

        let _guard = self.store.guard::<RefreshLock>(key).await?;
        if self.store.create_exclusive(key, &lock).await? {
            return Ok(true);
        }

        match self.store.read::<RefreshLock>(key).await {
            Some(existing) if existing.expires_at > now && existing.instance_id != self.instance_id => {
                debug!(server = %key, pid = existing.pid, "Refresh lock held by another process");
                Ok(false)
            }
            _ => {
                self.store.delete::<RefreshLock>(key).await?;
                self.store.create_exclusive(key, &lock).await
            }
        }
    }

    /// Release the refresh lock if this manager holds it
    pub async fn release_lock(&self, key: &ServerKey) {
        let _guard = match self.store.guard::<RefreshLock>(key).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(server = %key, error = %e, "Failed to release refresh lock");
                return;
            }
        };
        if self
            .store
            .read::<RefreshLock>(key)
            .await
            .is_some_and(|l| l.instance_id == self.instance_id)
        {
            if let Err(e) = self.store.delete::<RefreshLock>(key).await {
                warn!(server = %key, error = %e, "Failed to release refresh lock");
            }
        }
    }
}

impl Drop for TokenRefreshManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::oauth::records::TokenRecord;

    fn manager(store: &Arc<CredentialStore>) -> TokenRefreshManager {
        let resolver = MetadataResolver::new(&DiscoveryConfig {
            timeout_ms: 1_000,
            ssrf_protection: false,
        })
        .unwrap();
        TokenRefreshManager::new(Arc::clone(store), resolver, Client::new(), RefreshConfig::default())
    }

    #[tokio::test]
    async fn lock_excludes_other_owner_until_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        let a = manager(&store);
        let b = manager(&store);
        let now = Utc::now();

        assert!(a.try_acquire_lock(&key, now).await.unwrap());
        assert!(!b.try_acquire_lock(&key, now + TimeDelta::seconds(60)).await.unwrap());
        // re-entrant for the holder
        assert!(a.try_acquire_lock(&key, now).await.unwrap());
        // after the 120s TTL another owner wins
        assert!(b.try_acquire_lock(&key, now + TimeDelta::seconds(121)).await.unwrap());

        let held: RefreshLock = store.read(&key).await.unwrap();
        assert_eq!(held.instance_id, b.instance_id);

        a.release_lock(&key).await;
        assert!(store.read::<RefreshLock>(&key).await.is_some());
        b.release_lock(&key).await;
        assert!(store.read::<RefreshLock>(&key).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let key = ServerKey::from_url("https://mcp.example.com/mcp");
        tokio::fs::create_dir_all(store.dir()).await.unwrap();
        tokio::fs::write(store.dir().join(format!("{key}_refresh_lock.json")), "{oops")
            .await
            .unwrap();

        assert!(manager(&store).try_acquire_lock(&key, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn skip_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let m = manager(&store);
        let now = Utc::now();

        let key = ServerKey::from_url("https://a.example.com/mcp");
        store.save_tokens(&key, &TokenRecord::bearer("at"), now).await.unwrap();
        assert_eq!(
            m.scan_at(now).await,
            vec![(key.clone(), RefreshOutcome::Skipped(SkipReason::NoServerRegistration))]
        );

        store
            .write(
                &key,
                &ServerRegistration {
                    server_url: "https://a.example.com/mcp".into(),
                    callback_host: "localhost".into(),
                    callback_port: None,
                    static_client_metadata: None,
                    static_client_info: None,
                    resource: None,
                    scope: None,
                    updated_at: now,
                },
            )
            .await
            .unwrap();
        assert_eq!(m.scan_at(now).await[0].1, RefreshOutcome::Skipped(SkipReason::NoRefreshToken));

        let mut token = TokenRecord::bearer("at");
        token.refresh_token = Some("rt".into());
        token.expires_in = Some(3600);
        store.save_tokens(&key, &token, now).await.unwrap();
        assert_eq!(m.scan_at(now).await[0].1, RefreshOutcome::Skipped(SkipReason::NotExpiring));

        let other = manager(&store);
        let later = now + TimeDelta::seconds(3500);
        assert!(other.try_acquire_lock(&key, later).await.unwrap());
        assert_eq!(m.scan_at(later).await[0].1, RefreshOutcome::Skipped(SkipReason::Locked));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), false));
        let m = Arc::new(manager(&store));

        m.start();
        m.start();
        assert!(m.is_running());
        m.stop();
        m.stop();
        assert!(!m.is_running());
        m.start();
        assert!(m.is_running());
        m.stop();
    }
}

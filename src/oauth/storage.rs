//! OAuth credential storage
//!
//! Persists per-server client registrations, tokens, token timing, PKCE
//! verifiers, server snapshots and lock files as `{serverKey}_{kind}` files in
//! one directory. Reads never fail: a missing, unreadable or malformed file is
//! reported as absent. Writes replace whole files atomically and narrow
//! permissions to the owner.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::records::{
    ClientRegistration, FileKind, PkceVerifier, ServerKey, ServerRegistration, StoredRecord,
    TokenRecord, TokenState,
};
use crate::{Error, Result};

/// Directory name (and legacy versioned prefix) under the base directory
pub const STORAGE_NAMESPACE: &str = "mcp-auth-bridge";

/// Which records `invalidate` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Every record for the server (locks excluded)
    All,
    /// Client registration only
    Client,
    /// Tokens and their timing state
    Tokens,
    /// PKCE verifier only
    Verifier,
}

impl std::str::FromStr for Invalidation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "client" => Ok(Self::Client),
            "tokens" => Ok(Self::Tokens),
            "verifier" => Ok(Self::Verifier),
            other => Err(Error::Config(format!("Unknown invalidation scope: {other}"))),
        }
    }
}

impl Invalidation {
    fn kinds(self) -> &'static [FileKind] {
        match self {
            Self::All => &[
                FileKind::ClientInfo,
                FileKind::Tokens,
                FileKind::TokenState,
                FileKind::CodeVerifier,
                FileKind::Server,
            ],
            Self::Client => &[FileKind::ClientInfo],
            Self::Tokens => &[FileKind::Tokens, FileKind::TokenState],
            Self::Verifier => &[FileKind::CodeVerifier],
        }
    }
}

/// Exclusive advisory lock on a record's guard file, held until dropped
pub struct RecordGuard {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<std::fs::File>,
}

impl std::fmt::Debug for RecordGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordGuard").finish_non_exhaustive()
    }
}

impl RecordGuard {
    #[cfg(unix)]
    fn acquire(path: &Path) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to open {}: {e}", path.display())))?;
        let lock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_file, errno)| Error::Storage(format!("Failed to lock {}: {errno}", path.display())))?;
        Ok(Self { _lock: lock })
    }

    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps)]
    fn acquire(_path: &Path) -> Result<Self> {
        Ok(Self {})
    }
}

/// File-backed credential store
#[derive(Debug)]
pub struct CredentialStore {
    /// Base directory holding current and legacy storage directories
    base_dir: PathBuf,
    /// Directory this store reads and writes
    dir: PathBuf,
    /// Version-pinned layout (no migration)
    versioned: bool,
    /// Legacy migration guard, runs at most once per store
    migrated: OnceCell<()>,
}

impl CredentialStore {
    /// Create a store rooted at `base_dir`.
    ///
    /// The directory itself is created lazily on first write.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, versioned: bool) -> Self {
        let base_dir = base_dir.into();
        let dir = if versioned {
            base_dir.join(format!("{STORAGE_NAMESPACE}-{}", env!("CARGO_PKG_VERSION")))
        } else {
            base_dir.join(STORAGE_NAMESPACE)
        };
        Self {
            base_dir,
            dir,
            versioned,
            migrated: OnceCell::new(),
        }
    }

    /// Create a store in the default location (`~/.mcp-auth`) unless overridden
    pub fn default_location(config_dir: Option<PathBuf>, versioned: bool) -> Result<Self> {
        let base = match config_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| Error::Storage("Cannot determine home directory".to_string()))?
                .join(".mcp-auth"),
        };
        Ok(Self::new(base, versioned))
    }

    /// Directory holding the record files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &ServerKey, kind: FileKind) -> PathBuf {
        self.dir.join(kind.file_name(key))
    }

    /// Read a record; absent, unreadable and malformed files all yield `None`
    pub async fn read<T: StoredRecord>(&self, key: &ServerKey) -> Option<T> {
        self.ensure_migrated().await;
        let path = self.path(key, T::KIND);

        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(server = %key, file = %path.display(), error = %e, "Failed to read credential file");
                return None;
            }
        };

        let record = T::decode(&raw);
        if record.is_none() {
            warn!(server = %key, file = %path.display(), "Ignoring malformed credential file");
        }
        record
    }

    /// Write a record, replacing any previous file atomically
    pub async fn write<T: StoredRecord>(&self, key: &ServerKey, record: &T) -> Result<()> {
        self.ensure_migrated().await;
        let path = self.path(key, T::KIND);
        let tmp = self.stage(&path, &record.encode()?).await?;

        if let Err(e) = fs::rename(&tmp, &path).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                warn!(file = %tmp.display(), error = %cleanup, "Failed to remove temp file");
            }
            return Err(Error::Storage(format!("Failed to replace {}: {e}", path.display())));
        }

        debug!(server = %key, file = %path.display(), "Wrote credential file");
        Ok(())
    }

    /// Create a record only if no file exists yet.
    ///
    /// Returns `false` when another writer got there first. The destination
    /// only ever appears with complete content.
    pub async fn create_exclusive<T: StoredRecord>(&self, key: &ServerKey, record: &T) -> Result<bool> {
        self.ensure_migrated().await;
        let path = self.path(key, T::KIND);
        let tmp = self.stage(&path, &record.encode()?).await?;

        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "Failed to create {}: {e}",
                path.display()
            ))),
        }
    }

    /// Take the exclusive guard for one record kind of one server.
    ///
    /// Serializes read-compare-replace sequences on lock records across
    /// processes. The guard is released when dropped.
    pub async fn guard<T: StoredRecord>(&self, key: &ServerKey) -> Result<RecordGuard> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Storage(format!("Failed to create storage dir {}: {e}", self.dir.display()))
        })?;
        let path = self.dir.join(format!(".{}.guard", T::KIND.file_name(key)));

        tokio::task::spawn_blocking(move || RecordGuard::acquire(&path))
            .await
            .map_err(|e| Error::Storage(format!("Guard task failed: {e}")))?
    }

    /// Delete a record; deleting an absent record is not an error
    pub async fn delete<T: StoredRecord>(&self, key: &ServerKey) -> Result<()> {
        self.remove(key, T::KIND).await
    }

    async fn remove(&self, key: &ServerKey, kind: FileKind) -> Result<()> {
        let path = self.path(key, kind);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(server = %key, file = %path.display(), "Deleted credential file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Write content to a uniquely named sibling temp file with owner-only permissions
    async fn stage(&self, path: &Path, content: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Storage(format!("Failed to create storage dir {}: {e}", self.dir.display()))
        })?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp = self
            .dir
            .join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

        fs::write(&tmp, content)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {e}", tmp.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&tmp, perms).await {
                warn!(file = %tmp.display(), error = %e, "Failed to restrict credential file permissions");
            }
        }

        Ok(tmp)
    }

    /// Remove the selected records for a server
    pub async fn invalidate(&self, key: &ServerKey, scope: Invalidation) -> Result<()> {
        for kind in scope.kinds() {
            self.remove(key, *kind).await?;
        }
        info!(server = %key, ?scope, "Invalidated credentials");
        Ok(())
    }

    /// Every server key that currently has a token file
    pub async fn list_keys_with_tokens(&self) -> Result<Vec<ServerKey>> {
        self.ensure_migrated().await;
        let suffix = format!("_{}", FileKind::Tokens.suffix());

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("Failed to list storage dir: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(&suffix).and_then(ServerKey::parse) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Current tokens
    pub async fn tokens(&self, key: &ServerKey) -> Option<TokenRecord> {
        self.read(key).await
    }

    /// Persist tokens and recompute their timing state
    pub async fn save_tokens(&self, key: &ServerKey, token: &TokenRecord, now: DateTime<Utc>) -> Result<()> {
        self.write(key, token).await?;
        self.write(key, &TokenState::for_token(token, now)).await?;
        info!(server = %key, expires_in = ?token.expires_in, "Saved OAuth tokens");
        Ok(())
    }

    /// Record a failed refresh in the token state
    pub async fn record_refresh_failure(&self, key: &ServerKey, message: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = match self.read::<TokenState>(key).await {
            Some(state) => state,
            None => match self.tokens(key).await {
                Some(token) => TokenState::for_token(&token, now),
                None => return Ok(()),
            },
        };
        state.record_failure(message, now);
        self.write(key, &state).await
    }

    /// Stored client registration
    pub async fn client_registration(&self, key: &ServerKey) -> Option<ClientRegistration> {
        self.read(key).await
    }

    /// Stored server snapshot
    pub async fn server_registration(&self, key: &ServerKey) -> Option<ServerRegistration> {
        self.read(key).await
    }

    /// Take the PKCE verifier, if any
    pub async fn code_verifier(&self, key: &ServerKey) -> Option<PkceVerifier> {
        self.read(key).await
    }

    async fn ensure_migrated(&self) {
        if self.versioned {
            return;
        }
        self.migrated
            .get_or_init(|| async {
                match migrate_legacy(&self.base_dir, &self.dir).await {
                    Ok(0) => {}
                    Ok(copied) => info!(copied, dir = %self.dir.display(), "Migrated legacy credential files"),
                    Err(e) => warn!(error = %e, "Legacy credential migration failed"),
                }
            })
            .await;
    }
}

/// Parse `mcp-auth-bridge-1.2.3` into numeric components for ordering
fn legacy_version(dir_name: &str) -> Option<Vec<u64>> {
    let version = dir_name.strip_prefix(STORAGE_NAMESPACE)?.strip_prefix('-')?;
    version
        .split(['.', '-'])
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Copy files from versioned legacy directories into `dest`, newest version
/// first, never overwriting an existing destination file.
async fn migrate_legacy(base_dir: &Path, dest: &Path) -> Result<usize> {
    let mut entries = match fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut legacy = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(version) = entry.file_name().to_str().and_then(legacy_version) {
            legacy.push((version, entry.path()));
        }
    }
    if legacy.is_empty() {
        return Ok(0);
    }
    legacy.sort_by(|a, b| b.0.cmp(&a.0));

    fs::create_dir_all(dest).await?;
    let mut copied = 0;
    for (_, dir) in legacy {
        let mut files = fs::read_dir(&dir).await?;
        while let Some(file) = files.next_entry().await? {
            if !file.file_type().await?.is_file() {
                continue;
            }
            let target = dest.join(file.file_name());
            if fs::try_exists(&target).await? {
                continue;
            }
            fs::copy(file.path(), &target).await?;
            copied += 1;
        }
        debug!(from = %dir.display(), "Scanned legacy credential directory");
    }
    Ok(copied)
}

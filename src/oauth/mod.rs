//! OAuth 2.0 for remote MCP servers
//!
//! Implements the authorization side of the bridge:
//! - Persisted credentials keyed by server (tokens, client registration, PKCE verifier)
//! - Protected-resource (RFC 9728) and authorization-server (RFC 8414) discovery
//! - Authorization code flow with PKCE and dynamic client registration
//! - Cross-process coordination of browser logins
//! - Background token refresh

mod callback;
mod challenge;
mod client;
mod coordinator;
mod metadata;
mod records;
mod refresh;
mod storage;

pub use callback::{CallbackServer, WAIT_FOR_AUTH_PATH};
pub use challenge::BearerChallenge;
pub use client::{BrowserLauncher, OAuthProvider, Pkce, SystemBrowser, authorization_url};
pub use coordinator::{AuthCoordinator, AuthInitializer, AuthState};
pub use metadata::{
    AuthorizationServerMetadata, DEFAULT_SCOPE, DiscoverySource, MetadataResolver, OAuthMetadataBundle,
    ProtectedResourceMetadata, ScopeHints, normalize_resource, resolve_scope,
};
pub use records::{
    AuthLock, ClientRegistration, FileKind, PkceVerifier, RefreshLock, ServerKey, ServerRegistration,
    StoredRecord, TokenRecord, TokenState, is_expiring_soon,
};
pub use refresh::{RefreshOutcome, SkipReason, TokenRefreshManager};
pub use storage::{CredentialStore, Invalidation, RecordGuard, STORAGE_NAMESPACE};

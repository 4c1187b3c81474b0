//! Profile store collaborator.
//!
//! The matching core only ever needs one capability from the profile
//! service: turning an auth id into a display identity for match
//! notifications. Lookups are bounded by a timeout and every failure
//! degrades to an anonymous placeholder, so a slow or broken profile
//! backend can never block or fail a match.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;

const ANONYMOUS_DISPLAY_NAME: &str = "Stranger";

/// Public identity shown to a partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub anonymous: bool,
}

impl DisplayIdentity {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            display_name: Some(ANONYMOUS_DISPLAY_NAME.to_string()),
            anonymous: true,
        }
    }

    pub fn named(username: Option<String>, display_name: Option<String>) -> Self {
        if username.is_none() && display_name.is_none() {
            return Self::anonymous();
        }
        Self {
            username,
            display_name,
            anonymous: false,
        }
    }
}

impl Default for DisplayIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile store unavailable: {0}")]
    Unavailable(String),

    #[error("Profile lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Read-only access to user profiles owned by an external service
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch_display_identity(&self, auth_id: &str) -> Result<DisplayIdentity, ProfileError>;
}

/// Store that knows nobody. Used when no profile backend is configured.
#[derive(Debug, Default)]
pub struct AnonymousProfileStore;

#[async_trait]
impl ProfileStore for AnonymousProfileStore {
    async fn fetch_display_identity(&self, auth_id: &str) -> Result<DisplayIdentity, ProfileError> {
        Err(ProfileError::NotFound(auth_id.to_string()))
    }
}

/// In-memory store seeded from configuration
#[derive(Debug, Default)]
pub struct StaticProfileStore {
    identities: DashMap<String, DisplayIdentity>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ProfileConfig) -> Self {
        let store = Self::new();
        for (auth_id, identity) in &config.identities {
            store.insert(
                auth_id.clone(),
                DisplayIdentity::named(identity.username.clone(), identity.display_name.clone()),
            );
        }
        store
    }

    pub fn insert(&self, auth_id: impl Into<String>, identity: DisplayIdentity) {
        self.identities.insert(auth_id.into(), identity);
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl ProfileStore for StaticProfileStore {
    async fn fetch_display_identity(&self, auth_id: &str) -> Result<DisplayIdentity, ProfileError> {
        self.identities
            .get(auth_id)
            .map(|identity| identity.clone())
            .ok_or_else(|| ProfileError::NotFound(auth_id.to_string()))
    }
}

/// Pick the store implied by configuration
pub fn create_profile_store(config: &ProfileConfig) -> Arc<dyn ProfileStore> {
    if config.identities.is_empty() {
        tracing::info!("No profile identities configured, match notifications are anonymous");
        Arc::new(AnonymousProfileStore)
    } else {
        let store = StaticProfileStore::from_config(config);
        tracing::info!(identities = store.len(), "Static profile store loaded");
        Arc::new(store)
    }
}

/// Resolve a display identity, falling back to the anonymous placeholder on
/// a missing auth id, lookup failure, or timeout.
pub async fn resolve_display_identity(
    store: &dyn ProfileStore,
    auth_id: Option<&str>,
    timeout: Duration,
) -> DisplayIdentity {
    let Some(auth_id) = auth_id else {
        return DisplayIdentity::anonymous();
    };

    let result = match tokio::time::timeout(timeout, store.fetch_display_identity(auth_id)).await {
        Ok(result) => result,
        Err(_) => Err(ProfileError::Timeout(timeout)),
    };

    match result {
        Ok(identity) => identity,
        Err(ProfileError::NotFound(_)) => DisplayIdentity::anonymous(),
        Err(e) => {
            tracing::warn!(auth_id = %auth_id, error = %e, "Profile lookup failed, using anonymous identity");
            DisplayIdentity::anonymous()
        }
    }
}

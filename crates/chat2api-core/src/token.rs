//! Credential cache with single-flight refresh.
//!
//! Each credential owns at most one live [`AccessToken`] and one derived
//! [`IdentitySet`]. Concurrent refreshes for the same credential coalesce:
//! late callers park on a waiter list and receive the same outcome (token or
//! error) as the call that actually went upstream.

use std::collections::HashMap;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::identity::{IdentitySet, IdentityTemplate, derive_identity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub refresh_time: u64,
}

impl AccessToken {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.refresh_time
    }
}

type Waiter = oneshot::Sender<CoreResult<AccessToken>>;

#[derive(Default)]
struct CacheInner {
    tokens: HashMap<String, AccessToken>,
    identities: HashMap<String, IdentitySet>,
    pending: HashMap<String, Vec<Waiter>>,
}

#[derive(Default)]
pub struct TokenCache {
    inner: Mutex<CacheInner>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token for `credential`, refreshing through
    /// `refresh` when the entry is absent or expired.
    ///
    /// If a refresh for the same credential is already in flight, the caller
    /// joins its waiter list instead of issuing a duplicate upstream call.
    pub async fn acquire<F, Fut>(&self, credential: &str, refresh: F) -> CoreResult<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<AccessToken>>,
    {
        {
            let mut guard = self.inner.lock().await;
            if let Some(token) = guard.tokens.get(credential)
                && !token.is_expired(unix_now())
            {
                return Ok(token.clone());
            }
            if let Some(waiters) = guard.pending.get_mut(credential) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                drop(guard);
                debug!("joining in-flight token refresh");
                return match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CoreError::Auth("token refresh interrupted".to_string())),
                };
            }
            guard.pending.insert(credential.to_string(), Vec::new());
        }

        info!("refreshing access token");
        let outcome = refresh().await;

        let waiters = {
            let mut guard = self.inner.lock().await;
            if let Ok(token) = &outcome {
                guard.tokens.insert(credential.to_string(), token.clone());
            }
            guard.pending.remove(credential).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    /// Identity material for `credential`, derived once and reused.
    pub async fn identity(
        &self,
        credential: &str,
        template: Option<&IdentityTemplate>,
    ) -> IdentitySet {
        let mut guard = self.inner.lock().await;
        if let Some(identity) = guard.identities.get(credential) {
            return identity.clone();
        }
        let identity = derive_identity(credential, template);
        guard
            .identities
            .insert(credential.to_string(), identity.clone());
        identity
    }

    /// Drops the cached token and identity after an upstream rejection, so
    /// the next acquire forces a fresh refresh.
    pub async fn evict(&self, credential: &str) {
        let mut guard = self.inner.lock().await;
        if guard.tokens.remove(credential).is_some() {
            info!("evicted invalidated access token");
        }
        guard.identities.remove(credential);
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

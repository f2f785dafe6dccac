use std::sync::Arc;

use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

/// Holds the current access/refresh pair for the signed-in session.
///
/// Cheap to clone; all clones share one slot. Mutation is reserved for
/// sign-in/sign-out and the refresh coordinator — the request gateway only
/// ever reads.
#[derive(Clone, Default)]
pub struct CredentialStore {
    inner: Arc<RwLock<Option<Credential>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Credential> {
        self.inner.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|credential| credential.refresh_token.clone())
    }

    /// Installs a new pair, replacing both tokens at once.
    pub async fn replace(&self, credential: Credential) {
        *self.inner.write().await = Some(credential);
    }

    /// Drops both tokens. A partially-cleared pair is never observable.
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_signed_in(&self) -> bool {
        self.inner.read().await.is_some()
    }
}

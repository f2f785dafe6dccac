use std::sync::Arc;

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::Client;
use serde::Serialize;
use shared::protocol::RefreshResponse;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    credentials::{Credential, CredentialStore},
    error::RefreshError,
};

type SharedRenewal = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

#[derive(Serialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// Serializes credential renewal: while one renewal call is in flight, every
/// `refresh()` caller joins it and they all settle with the same outcome.
#[derive(Clone)]
pub struct RefreshCoordinator {
    http: Client,
    endpoint: String,
    store: CredentialStore,
    in_flight: Arc<Mutex<Option<SharedRenewal>>>,
}

impl RefreshCoordinator {
    pub fn new(http: Client, api_base_url: &str, store: CredentialStore) -> Self {
        Self {
            http,
            endpoint: format!("{}/auth/refresh", api_base_url.trim_end_matches('/')),
            store,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Renew the credential pair, coalescing concurrent callers onto a single
    /// renewal request. On any failure the store is cleared entirely so a
    /// stale access token cannot keep cycling through 401s.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        let renewal = {
            let mut slot = self.in_flight.lock().await;
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else {
                let this = self.clone();
                let renewal: SharedRenewal = async move {
                    let outcome = this.renew_once().await;
                    // Empty the slot before the first waiter observes the
                    // result, so a refresh() issued after settlement always
                    // starts a fresh attempt.
                    this.in_flight.lock().await.take();
                    if let Err(err) = &outcome {
                        warn!("credential renewal failed, clearing session: {err}");
                        this.store.clear().await;
                    }
                    outcome
                }
                .boxed()
                .shared();
                *slot = Some(renewal.clone());
                renewal
            }
        };
        renewal.await
    }

    async fn renew_once(&self) -> Result<Credential, RefreshError> {
        let Some(refresh_token) = self.store.refresh_token().await else {
            return Err(RefreshError::MissingRefreshToken);
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&RefreshRequest {
                refresh_token: refresh_token.clone(),
            })
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Endpoint {
                status: status.as_u16(),
            });
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let renewed = Credential {
            access_token: body.access_token,
            // The endpoint may rotate the refresh token; keep the old one
            // when it does not.
            refresh_token: body.refresh_token.unwrap_or(refresh_token),
        };
        self.store.replace(renewed.clone()).await;
        info!("credential renewed");
        Ok(renewed)
    }
}

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::{
    credentials::CredentialStore, error::ClientError, refresh::RefreshCoordinator, ClientEvent,
};

/// Reports whether the device currently has connectivity. The runtime checks
/// this before dispatching so an offline request fails immediately instead of
/// hanging until the transport times out.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Set exactly once, when a 401 triggers the renewal retry. Lives on the
    /// descriptor so unrelated concurrent requests cannot interfere with each
    /// other's retry accounting.
    retried: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: &impl Serialize) -> Self {
        self.body = serde_json::to_value(body).ok();
        self
    }
}

#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ClientError::Protocol(format!("invalid response body: {err}")))
    }
}

/// Fronts every REST call: attaches the bearer token, maintains the
/// in-flight counter behind the loading observable, and turns a first 401
/// into a renew-and-retry cycle.
pub struct RequestGateway {
    http: Client,
    base_url: String,
    timeout: Duration,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    connectivity: Arc<dyn ConnectivityProbe>,
    in_flight: AtomicUsize,
    loading_tx: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
}

impl RequestGateway {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        timeout: Duration,
        store: CredentialStore,
        refresher: RefreshCoordinator,
        connectivity: Arc<dyn ConnectivityProbe>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (loading_tx, _) = watch::channel(false);
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            store,
            refresher,
            connectivity,
            in_flight: AtomicUsize::new(0),
            loading_tx,
            events,
        }
    }

    /// True while at least one request is in flight.
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading_tx.subscribe()
    }

    pub async fn send(&self, mut descriptor: RequestDescriptor) -> Result<ApiResponse, ClientError> {
        if !self.connectivity.is_online().await {
            let err = ClientError::Network(format!(
                "device is offline; aborted {} {}",
                descriptor.method, descriptor.path
            ));
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
            return Err(err);
        }

        self.begin_request();
        let result = self.dispatch_with_renewal(&mut descriptor).await;
        self.end_request();

        if let Err(err) = &result {
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }
        result
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(RequestDescriptor::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        self.send(RequestDescriptor::post(path).with_json(body))
            .await?
            .json()
    }

    async fn dispatch_with_renewal(
        &self,
        descriptor: &mut RequestDescriptor,
    ) -> Result<ApiResponse, ClientError> {
        let response = self.dispatch_once(descriptor).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Self::classify(response);
        }

        if descriptor.retried {
            return self.expire_session(descriptor).await;
        }
        descriptor.retried = true;

        warn!(
            path = descriptor.path,
            "unauthorized response, renewing credential and retrying once"
        );
        if let Err(err) = self.refresher.refresh().await {
            // The coordinator already cleared the store.
            self.emit_signed_out(descriptor);
            return Err(err.into());
        }

        let response = self.dispatch_once(descriptor).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return self.expire_session(descriptor).await;
        }
        Self::classify(response)
    }

    async fn dispatch_once(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ApiResponse, ClientError> {
        let url = format!("{}{}", self.base_url, descriptor.path);
        let mut request = self
            .http
            .request(descriptor.method.clone(), url)
            .timeout(self.timeout);

        if !descriptor.query.is_empty() {
            request = request.query(&descriptor.query);
        }
        if let Some(body) = &descriptor.body {
            request = request.json(body);
        }
        // Read the store on every attempt so a retry picks up the renewed
        // token.
        if let Some(token) = self.store.access_token().await {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?
            .to_vec();
        Ok(ApiResponse { status, body })
    }

    fn classify(response: ApiResponse) -> Result<ApiResponse, ClientError> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Http {
                status: response.status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            })
        }
    }

    /// Second 401 on the same descriptor: the session is gone for good.
    async fn expire_session(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ApiResponse, ClientError> {
        self.store.clear().await;
        self.emit_signed_out(descriptor);
        Err(ClientError::CredentialExpired)
    }

    fn emit_signed_out(&self, descriptor: &RequestDescriptor) {
        let _ = self.events.send(ClientEvent::SignedOut {
            resume_path: Some(descriptor.path.clone()),
        });
    }

    fn begin_request(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.loading_tx.send_replace(true);
        }
    }

    fn end_request(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.loading_tx.send_replace(false);
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("request failed with status {status}")]
    Http { status: u16, body: String },
    #[error("session expired: renewal already attempted and still unauthorized")]
    CredentialExpired,
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("no user is signed in")]
    NotSignedIn,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Failure modes of the credential renewal call. `Clone` so every caller
/// sharing one in-flight renewal can receive the same settled outcome.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("credential renewal rejected with status {status}")]
    Endpoint { status: u16 },
    #[error("credential renewal transport failure: {0}")]
    Transport(String),
}

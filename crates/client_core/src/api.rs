use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{QuoteRequestId, RoomId, UserId},
    protocol::{ChatMessagePayload, ChatRoomSummary, TokenPairResponse, UserProfile},
};

use crate::{
    credentials::{Credential, CredentialStore},
    error::ClientError,
    gateway::RequestGateway,
    reconcile::HistorySource,
};

#[derive(Serialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct RoomMessagesResponse {
    messages: Vec<ChatMessagePayload>,
}

#[derive(Serialize)]
struct CreateRoomRequest {
    quote_request_id: QuoteRequestId,
    business_id: UserId,
}

#[derive(Serialize)]
struct SendMessageRequest {
    content: String,
}

pub struct AuthApi {
    gateway: Arc<RequestGateway>,
    store: CredentialStore,
}

impl AuthApi {
    pub fn new(gateway: Arc<RequestGateway>, store: CredentialStore) -> Self {
        Self { gateway, store }
    }

    /// Exchanges the login for a token pair and installs it in the store.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), ClientError> {
        let tokens: TokenPairResponse = self
            .gateway
            .post_json(
                "/auth/login",
                &LoginRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        self.store
            .replace(Credential {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
            })
            .await;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<UserProfile, ClientError> {
        self.gateway.get_json("/auth/user").await
    }

    /// Local sign-out only; the backend keeps no session to revoke.
    pub async fn sign_out(&self) {
        self.store.clear().await;
    }
}

pub struct ChatApi {
    gateway: Arc<RequestGateway>,
}

impl ChatApi {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    pub async fn rooms(&self) -> Result<Vec<ChatRoomSummary>, ClientError> {
        self.gateway.get_json("/chat/rooms").await
    }

    pub async fn create_room(
        &self,
        quote_request_id: QuoteRequestId,
        business_id: UserId,
    ) -> Result<ChatRoomSummary, ClientError> {
        self.gateway
            .post_json(
                "/chat/rooms",
                &CreateRoomRequest {
                    quote_request_id,
                    business_id,
                },
            )
            .await
    }

    pub async fn room_messages(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<ChatMessagePayload>, ClientError> {
        let response: RoomMessagesResponse = self
            .gateway
            .get_json(&format!("/chat/rooms/{}/messages", room_id.0))
            .await?;
        Ok(response.messages)
    }

    /// Plain REST send, used when the realtime publish reports failure. The
    /// backend stores the message and broadcasts it on the room topic itself.
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
    ) -> Result<ChatMessagePayload, ClientError> {
        self.gateway
            .post_json(
                &format!("/chat/rooms/{}/messages", room_id.0),
                &SendMessageRequest {
                    content: content.to_string(),
                },
            )
            .await
    }
}

#[async_trait]
impl HistorySource for ChatApi {
    async fn room_messages(&self, room_id: RoomId) -> Result<Vec<ChatMessagePayload>, ClientError> {
        ChatApi::room_messages(self, room_id).await
    }
}

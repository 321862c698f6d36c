use std::sync::Arc;

use shared::{
    domain::{Conversation, ConversationId, Identity, UserId},
    protocol::{
        AuthResponse, CreateConversationRequest, HistoryPage, HistoryRequest, LoginRequest,
        Paginated, RegisterRequest, UpdateConversationRequest, UpdateProfileImageRequest,
        UserSearchQuery,
    },
};

use crate::{
    error::Result,
    gateway::{ApiRequest, RequestGateway},
};

/// Typed request-channel endpoints on top of the gateway.
#[derive(Clone)]
pub struct ChatApi {
    gateway: Arc<RequestGateway>,
}

impl ChatApi {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let request = ApiRequest::post("/auth/login")
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })?
            .anonymous();
        self.gateway.send_json(&request).await
    }

    pub async fn register(&self, registration: &RegisterRequest) -> Result<AuthResponse> {
        let request = ApiRequest::post("/auth/register")
            .json(registration)?
            .anonymous();
        self.gateway.send_json(&request).await
    }

    pub async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        self.gateway.send_json(&ApiRequest::get("/groups")).await
    }

    pub async fn create_conversation(
        &self,
        body: &CreateConversationRequest,
    ) -> Result<Conversation> {
        let request = ApiRequest::post("/groups").json(body)?;
        self.gateway.send_json(&request).await
    }

    pub async fn update_conversation(
        &self,
        id: &ConversationId,
        body: &UpdateConversationRequest,
    ) -> Result<Conversation> {
        let request = ApiRequest::patch(format!("/groups/{id}")).json(body)?;
        self.gateway.send_json(&request).await
    }

    /// Most recent `limit` messages, newest first.
    pub async fn fetch_history(&self, id: &ConversationId, limit: u32) -> Result<HistoryPage> {
        let request = ApiRequest::post(format!("/groups/{id}/messages")).json(&HistoryRequest {
            limit: Some(limit),
            ..HistoryRequest::default()
        })?;
        self.gateway.send_json(&request).await
    }

    pub async fn search_users(&self, query: &UserSearchQuery) -> Result<Paginated<Identity>> {
        let request = ApiRequest::get("/users").query(query)?;
        self.gateway.send_json(&request).await
    }

    pub async fn get_user(&self, id: &UserId) -> Result<Identity> {
        self.gateway
            .send_json(&ApiRequest::get(format!("/users/{id}")))
            .await
    }

    pub async fn update_profile_image(&self, profile_url: &str) -> Result<Identity> {
        let request = ApiRequest::patch("/users/profile/image").json(&UpdateProfileImageRequest {
            profile_url: profile_url.to_string(),
        })?;
        self.gateway.send_json(&request).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;

//! REST endpoints used when the live channel cannot deliver.
//!
//! [`MessagingApi`] is the seam controllers talk to; [`HttpApi`] implements
//! it with reqwest against the backend's `/api` routes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, multipart};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::credentials::CredentialProvider;
use crate::error::ApiError;
use crate::models::{Conversation, ConversationId, Message, Notification, UserId};

/// An image attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendRequestResponse {
    Accept,
    Decline,
}

impl FriendRequestResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

impl fmt::Display for FriendRequestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError>;

    /// Start (or fetch the existing) conversation with another user.
    async fn create_conversation(&self, other_user: &UserId) -> Result<Conversation, ApiError>;

    /// One page of messages, `page` starting at 1.
    async fn list_messages(
        &self,
        id: &ConversationId,
        page: u32,
    ) -> Result<Vec<Message>, ApiError>;

    async fn send_message(
        &self,
        id: &ConversationId,
        content: &str,
        image: Option<ImageUpload>,
    ) -> Result<Message, ApiError>;

    async fn edit_message(
        &self,
        id: &ConversationId,
        message_id: i64,
        content: &str,
    ) -> Result<Message, ApiError>;

    async fn delete_message(&self, id: &ConversationId, message_id: i64) -> Result<(), ApiError>;

    async fn mark_conversation_read(&self, id: &ConversationId) -> Result<(), ApiError>;

    async fn list_notifications(&self) -> Result<Vec<Notification>, ApiError>;

    async fn mark_notification_read(&self, notification_id: i64) -> Result<(), ApiError>;

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError>;

    async fn clear_notifications(&self) -> Result<(), ApiError>;

    async fn respond_to_friend_request(
        &self,
        request_id: i64,
        response: FriendRequestResponse,
    ) -> Result<(), ApiError>;
}

/// The backend returns lists bare, paginated under `results`, or wrapped
/// under `data` depending on the endpoint.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Results { results: Vec<T> },
    Data { data: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Results { results: items } | Self::Data { data: items } => {
                items
            }
        }
    }
}

#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpApi {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, credentials)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self
            .credentials
            .token()
            .await
            .ok_or(ApiError::MissingCredentials)?;
        debug!(%method, path, "api request");
        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(token))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(ApiError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(ApiError::from_reqwest)
    }

    async fn fetch_list<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, ApiError> {
        Ok(self.fetch::<Listing<T>>(request).await?.into_vec())
    }
}

#[async_trait]
impl MessagingApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let req = self.request(Method::GET, "/conversations/").await?;
        self.fetch_list(req).await
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError> {
        let req = self
            .request(Method::GET, &format!("/conversations/{id}/"))
            .await?;
        self.fetch(req).await
    }

    async fn create_conversation(&self, other_user: &UserId) -> Result<Conversation, ApiError> {
        let req = self
            .request(Method::POST, "/conversations/")
            .await?
            .json(&json!({ "other_user_id": other_user }));
        self.fetch(req).await
    }

    async fn list_messages(
        &self,
        id: &ConversationId,
        page: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let req = self
            .request(Method::GET, &format!("/conversations/{id}/messages/"))
            .await?
            .query(&[("page", page.max(1))]);
        self.fetch_list(req).await
    }

    async fn send_message(
        &self,
        id: &ConversationId,
        content: &str,
        image: Option<ImageUpload>,
    ) -> Result<Message, ApiError> {
        let mut form = multipart::Form::new().text("content", content.to_string());
        if let Some(image) = image {
            let part = multipart::Part::bytes(image.bytes)
                .file_name(image.file_name)
                .mime_str(&image.mime)
                .map_err(ApiError::from_reqwest)?;
            form = form.part("image", part);
        }
        let req = self
            .request(Method::POST, &format!("/conversations/{id}/messages/"))
            .await?
            .multipart(form);
        self.fetch(req).await
    }

    async fn edit_message(
        &self,
        id: &ConversationId,
        message_id: i64,
        content: &str,
    ) -> Result<Message, ApiError> {
        let req = self
            .request(
                Method::PUT,
                &format!("/conversations/{id}/messages/{message_id}/"),
            )
            .await?
            .json(&json!({ "content": content }));
        self.fetch(req).await
    }

    async fn delete_message(&self, id: &ConversationId, message_id: i64) -> Result<(), ApiError> {
        let req = self
            .request(
                Method::DELETE,
                &format!("/conversations/{id}/messages/{message_id}/"),
            )
            .await?;
        self.execute(req).await.map(|_| ())
    }

    async fn mark_conversation_read(&self, id: &ConversationId) -> Result<(), ApiError> {
        let req = self
            .request(Method::POST, &format!("/conversations/{id}/mark-read/"))
            .await?;
        self.execute(req).await.map(|_| ())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, ApiError> {
        let req = self.request(Method::GET, "/notifications/").await?;
        self.fetch_list(req).await
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<(), ApiError> {
        let req = self
            .request(
                Method::POST,
                &format!("/notifications/{notification_id}/mark-read/"),
            )
            .await?;
        self.execute(req).await.map(|_| ())
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        let req = self
            .request(Method::POST, "/notifications/mark-all-read/")
            .await?;
        self.execute(req).await.map(|_| ())
    }

    async fn clear_notifications(&self) -> Result<(), ApiError> {
        let req = self.request(Method::DELETE, "/notifications/clear/").await?;
        self.execute(req).await.map(|_| ())
    }

    async fn respond_to_friend_request(
        &self,
        request_id: i64,
        response: FriendRequestResponse,
    ) -> Result<(), ApiError> {
        let req = self
            .request(
                Method::POST,
                &format!("/friend-request/respond/{request_id}/"),
            )
            .await?
            .json(&json!({ "action": response.as_str() }));
        self.execute(req).await.map(|_| ())
    }
}

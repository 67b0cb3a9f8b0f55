#![allow(dead_code)]

use std::sync::Arc;

use agora_live::models::Participant;
use agora_live::{
    ApiError, ChannelDeps, Conversation, ConversationId, CurrentUser, FriendRequestResponse,
    ImageUpload, LiveConfig, Message, MessagingApi, Notification, RealtimeEndpoint, Sender,
    SharedToken, UserId,
};
use agora_live::transport::memory::{MemoryConnector, MemoryPeer};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub fn alice() -> CurrentUser {
    CurrentUser::new(UserId::from(1), "alice")
}

pub fn bob() -> Sender {
    Sender {
        id: Some(UserId::from(2)),
        username: "bob".into(),
    }
}

pub fn message(id: i64, sender: Sender, content: &str) -> Message {
    Message {
        id,
        content: Some(content.to_string()),
        image_url: None,
        sender,
        created_at: Utc::now(),
        is_edited: false,
    }
}

pub fn notification(id: i64, friend_request_id: Option<i64>) -> Notification {
    Notification {
        id,
        message: format!("notification {id}"),
        notification_type: "friend_request".into(),
        is_read: false,
        created_at: Some(Utc::now()),
        friend_request_id,
        invalid_reason: None,
    }
}

/// In-memory backend recording every REST call.
#[derive(Default)]
pub struct FakeState {
    pub messages: Vec<Message>,
    pub next_id: i64,
    pub fail_sends: bool,
    pub fail_lists: bool,
    pub sends: Vec<String>,
    pub images: Vec<String>,
    pub list_calls: usize,
    pub mark_read_calls: usize,
    pub notifications: Vec<Notification>,
    pub notification_reads: Vec<i64>,
    pub mark_all_calls: usize,
    pub clear_calls: usize,
    pub friend_responses: Vec<(i64, FriendRequestResponse)>,
}

pub struct FakeApi {
    me: CurrentUser,
    pub state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new(me: CurrentUser) -> Arc<Self> {
        Arc::new(Self {
            me,
            state: Mutex::new(FakeState {
                next_id: 100,
                ..FakeState::default()
            }),
        })
    }
}

fn server_error() -> ApiError {
    ApiError::Status {
        status: 500,
        body: "boom".into(),
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        Ok(vec![])
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError> {
        Ok(Conversation {
            id: id.clone(),
            participants: vec![],
            last_message: None,
            unread_count: 0,
            updated_at: None,
        })
    }

    async fn create_conversation(&self, other_user: &UserId) -> Result<Conversation, ApiError> {
        Ok(Conversation {
            id: ConversationId::from(1),
            participants: vec![Participant {
                id: Some(other_user.clone()),
                username: String::new(),
            }],
            last_message: None,
            unread_count: 0,
            updated_at: None,
        })
    }

    async fn list_messages(
        &self,
        _id: &ConversationId,
        _page: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_lists {
            return Err(server_error());
        }
        Ok(state.messages.clone())
    }

    async fn send_message(
        &self,
        _id: &ConversationId,
        content: &str,
        image: Option<ImageUpload>,
    ) -> Result<Message, ApiError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(server_error());
        }
        state.next_id += 1;
        state.sends.push(content.to_string());
        let mut msg = message(state.next_id, self.me.as_sender(), content);
        if let Some(image) = image {
            state.images.push(image.file_name.clone());
            msg.image_url = Some(format!("/media/{}", image.file_name));
        }
        state.messages.push(msg.clone());
        Ok(msg)
    }

    async fn edit_message(
        &self,
        _id: &ConversationId,
        message_id: i64,
        content: &str,
    ) -> Result<Message, ApiError> {
        let mut state = self.state.lock();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(ApiError::Status {
                status: 404,
                body: String::new(),
            })?;
        msg.content = Some(content.to_string());
        msg.is_edited = true;
        Ok(msg.clone())
    }

    async fn delete_message(&self, _id: &ConversationId, message_id: i64) -> Result<(), ApiError> {
        self.state.lock().messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn mark_conversation_read(&self, _id: &ConversationId) -> Result<(), ApiError> {
        self.state.lock().mark_read_calls += 1;
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, ApiError> {
        Ok(self.state.lock().notifications.clone())
    }

    async fn mark_notification_read(&self, notification_id: i64) -> Result<(), ApiError> {
        self.state.lock().notification_reads.push(notification_id);
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        self.state.lock().mark_all_calls += 1;
        Ok(())
    }

    async fn clear_notifications(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.clear_calls += 1;
        state.notifications.clear();
        Ok(())
    }

    async fn respond_to_friend_request(
        &self,
        request_id: i64,
        response: FriendRequestResponse,
    ) -> Result<(), ApiError> {
        self.state
            .lock()
            .friend_responses
            .push((request_id, response));
        Ok(())
    }
}

pub struct Harness {
    pub deps: ChannelDeps,
    pub connector: MemoryConnector,
    pub peers: mpsc::UnboundedReceiver<MemoryPeer>,
    pub api: Arc<FakeApi>,
    pub token: SharedToken,
}

pub fn harness() -> Harness {
    let (connector, peers) = MemoryConnector::new();
    let api = FakeApi::new(alice());
    let token = SharedToken::new(Some("secret".into()));
    let mut config = LiveConfig::for_api_base("http://chat.test/api");
    config.endpoint = RealtimeEndpoint::new("chat.test", false);
    let deps = ChannelDeps::new(
        config,
        Arc::new(connector.clone()),
        Arc::new(token.clone()),
        api.clone(),
    );
    Harness {
        deps,
        connector,
        peers,
        api,
        token,
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use serde_json::Value;
use shared::{
    domain::{Attachment, Conversation, ConversationId, Delivery, Identity, Message, MessageId, UserId},
    protocol::{
        CreateConversationRequest, InboundMessage, OutboundMessage, Paginated,
        UpdateConversationRequest, UserSearchQuery, EVENT_CONVERSATION_CREATED,
        EVENT_MESSAGE_INCOMING, EVENT_MESSAGE_SEND,
    },
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    clock::Clock,
    connection::ConnectionManager,
    error::{ClientError, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    MessagesChanged(ConversationId),
    ConversationsInvalidated,
    SelectionChanged(Option<ConversationId>),
}

struct StoreState {
    conversations: Vec<Conversation>,
    conversations_stale: bool,
    selected: Option<ConversationId>,
    /// Bumped on every selection change so a slow history load for an
    /// earlier selection can be discarded.
    selection_epoch: u64,
    messages: Vec<Message>,
    identities: HashMap<UserId, Identity>,
    own_identity: Option<Identity>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
            conversations_stale: true,
            selected: None,
            selection_epoch: 0,
            messages: Vec::new(),
            identities: HashMap::new(),
            own_identity: None,
        }
    }
}

impl StoreState {
    fn cache_identity(&mut self, identity: &Identity) {
        if identity.id.as_str().is_empty() {
            return;
        }
        self.identities.insert(identity.id.clone(), identity.clone());
    }

    fn own_id(&self) -> UserId {
        self.own_identity
            .as_ref()
            .map(|identity| identity.id.clone())
            .unwrap_or_else(|| UserId::new(""))
    }
}

/// Inserts after every message with the same or an earlier `created_at`, so
/// the sequence stays non-decreasing and ties keep arrival order.
fn insert_ordered(messages: &mut Vec<Message>, message: Message) {
    let at = messages.partition_point(|existing| existing.created_at <= message.created_at);
    messages.insert(at, message);
}

fn sort_by_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.sort_time().cmp(&a.sort_time()));
}

pub struct ConversationStore {
    api: ChatApi,
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
    history_page_size: u32,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationStore {
    pub fn new(
        api: ChatApi,
        connection: Arc<ConnectionManager>,
        clock: Arc<dyn Clock>,
        history_page_size: u32,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            connection,
            clock,
            history_page_size,
            state: Mutex::new(StoreState::default()),
            events,
            listener: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Starts merging inbound channel events. Subscriptions are taken here so
    /// nothing published after `start` returns is missed.
    pub fn start(self: &Arc<Self>) {
        let mut listener = self.lock_listener();
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut incoming = self.connection.subscribe(EVENT_MESSAGE_INCOMING);
        let mut created = self.connection.subscribe(EVENT_CONVERSATION_CREATED);
        let store: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = incoming.recv() => {
                        let (Some(data), Some(store)) = (data, store.upgrade()) else {
                            break;
                        };
                        store.apply_inbound(data);
                    }
                    signal = created.recv() => {
                        let (Some(_), Some(store)) = (signal, store.upgrade()) else {
                            break;
                        };
                        debug!("conversations: conversation created remotely");
                        store.invalidate_conversations();
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.abort();
        }
    }

    pub fn set_session_identity(&self, identity: Identity) {
        let mut state = self.lock_state();
        state.cache_identity(&identity);
        state.own_identity = Some(identity);
    }

    pub fn session_identity(&self) -> Option<Identity> {
        self.lock_state().own_identity.clone()
    }

    pub fn cache_identities<'a>(&self, identities: impl IntoIterator<Item = &'a Identity>) {
        let mut state = self.lock_state();
        for identity in identities {
            state.cache_identity(identity);
        }
    }

    /// Cache lookup only; never touches the network.
    pub fn resolve_identity(&self, id: &UserId) -> Option<Identity> {
        self.lock_state().identities.get(id).cloned()
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        if self.lock_state().conversations_stale {
            return self.refresh_conversations().await;
        }
        Ok(self.conversations())
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        let mut fetched = self.api.fetch_conversations().await?;
        sort_by_activity(&mut fetched);

        let mut state = self.lock_state();
        for member in fetched.iter().flat_map(|c| c.members.iter()) {
            state.cache_identity(member);
        }
        if let Some(own) = state.own_identity.clone() {
            state.cache_identity(&own);
        }
        state.conversations = fetched.clone();
        state.conversations_stale = false;
        debug!(count = fetched.len(), "conversations: list refreshed");
        Ok(fetched)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations = self.lock_state().conversations.clone();
        sort_by_activity(&mut conversations);
        conversations
    }

    pub fn conversations_stale(&self) -> bool {
        self.lock_state().conversations_stale
    }

    pub fn invalidate_conversations(&self) {
        self.lock_state().conversations_stale = true;
        let _ = self.events.send(StoreEvent::ConversationsInvalidated);
    }

    pub fn filter_conversations(&self, term: &str) -> Vec<Conversation> {
        let needle = term.trim().to_lowercase();
        let own_id = self.lock_state().own_id();
        self.conversations()
            .into_iter()
            .filter(|c| needle.is_empty() || c.display_name(&own_id).to_lowercase().contains(&needle))
            .collect()
    }

    pub fn display_name(&self, conversation: &Conversation) -> String {
        conversation.display_name(&self.lock_state().own_id())
    }

    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.lock_state().selected.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    /// Makes `id` the active conversation and loads its recent history.
    /// Messages that arrived while the load was in flight are kept.
    pub async fn select_conversation(&self, id: &ConversationId) -> Vec<Message> {
        let epoch = {
            let mut state = self.lock_state();
            state.selected = Some(id.clone());
            state.selection_epoch += 1;
            state.messages.clear();
            state.selection_epoch
        };
        let _ = self.events.send(StoreEvent::SelectionChanged(Some(id.clone())));

        let history = self.load_history(id, self.history_page_size).await;

        let merged = {
            let mut state = self.lock_state();
            if state.selection_epoch != epoch {
                debug!(conversation_id = %id, "conversations: discarding history for stale selection");
                return history;
            }
            let arrived = std::mem::take(&mut state.messages);
            let mut merged = history;
            for message in arrived {
                if !merged.iter().any(|m| m.id == message.id) {
                    insert_ordered(&mut merged, message);
                }
            }
            state.messages = merged.clone();
            merged
        };
        let _ = self.events.send(StoreEvent::MessagesChanged(id.clone()));
        merged
    }

    pub fn clear_selection(&self) {
        {
            let mut state = self.lock_state();
            state.selected = None;
            state.selection_epoch += 1;
            state.messages.clear();
        }
        let _ = self.events.send(StoreEvent::SelectionChanged(None));
    }

    /// Recent history oldest-first. A failed load yields an empty list.
    pub async fn load_history(&self, id: &ConversationId, limit: u32) -> Vec<Message> {
        match self.api.fetch_history(id, limit).await {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                messages.sort_by_key(|m| m.created_at);
                messages
            }
            Err(err) => {
                warn!(conversation_id = %id, "conversations: history load failed: {err}");
                Vec::new()
            }
        }
    }

    /// Shows the message immediately as optimistic, then emits it. Nothing is
    /// mutated when the preconditions fail.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: Option<&str>,
        attachment: Option<Attachment>,
    ) -> Result<Message> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let content = content.filter(|text| !text.is_empty()).map(str::to_string);
        if content.is_none() && attachment.is_none() {
            return Err(ClientError::EmptyMessage);
        }

        let optimistic = {
            let mut state = self.lock_state();
            if state.selected.as_ref() != Some(conversation_id) {
                return Err(ClientError::NoConversationSelected);
            }
            let Some(sender) = state.own_identity.clone() else {
                return Err(ClientError::NoSession);
            };
            let now = self.clock.now();
            let message = Message {
                id: MessageId::provisional(),
                content: content.clone(),
                attachment: attachment.clone(),
                sender,
                conversation_id: conversation_id.clone(),
                created_at: now,
                updated_at: now,
                delivery: Delivery::Optimistic,
            };
            insert_ordered(&mut state.messages, message.clone());
            message
        };
        let _ = self
            .events
            .send(StoreEvent::MessagesChanged(conversation_id.clone()));

        let outbound = OutboundMessage {
            conversation_id: conversation_id.clone(),
            content,
            attachment,
            client_message_id: Some(optimistic.id.clone()),
        };
        if let Err(err) = self.connection.emit(EVENT_MESSAGE_SEND, &outbound).await {
            warn!(conversation_id = %conversation_id, "conversations: send failed, withdrawing optimistic message: {err}");
            self.lock_state().messages.retain(|m| m.id != optimistic.id);
            let _ = self
                .events
                .send(StoreEvent::MessagesChanged(conversation_id.clone()));
            return Err(err);
        }

        {
            let mut state = self.lock_state();
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| &c.id == conversation_id)
            {
                conversation.observe_message(&optimistic);
            }
        }
        self.invalidate_conversations();
        Ok(optimistic)
    }

    pub fn apply_inbound(&self, data: Value) {
        let inbound = match InboundMessage::from_event(data) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!("conversations: dropping inbound message: {err}");
                return;
            }
        };

        let now = self.clock.now();
        let conversation_id = inbound.conversation_id.clone();
        let shown = {
            let mut state = self.lock_state();
            let sender = state
                .identities
                .get(&inbound.sender_id)
                .cloned()
                .or(inbound.embedded_sender)
                .unwrap_or_else(|| Identity::placeholder(inbound.sender_id.clone()));
            let server_id = inbound.id;
            let message = Message {
                id: server_id.clone().unwrap_or_else(MessageId::unassigned),
                content: inbound.content,
                attachment: inbound.attachment,
                sender,
                conversation_id: conversation_id.clone(),
                created_at: inbound.created_at.unwrap_or(now),
                updated_at: inbound.updated_at.unwrap_or(now),
                delivery: Delivery::Confirmed,
            };

            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.observe_message(&message);
            }

            let shown = state.selected.as_ref() == Some(&conversation_id);
            if shown {
                let echo_of = inbound.client_message_id.as_ref().and_then(|client_id| {
                    state
                        .messages
                        .iter()
                        .position(|m| m.is_optimistic() && &m.id == client_id)
                });
                if let Some(at) = echo_of {
                    state.messages.remove(at);
                } else if let Some(at) = server_id
                    .as_ref()
                    .and_then(|id| state.messages.iter().position(|m| &m.id == id))
                {
                    state.messages.remove(at);
                }
                insert_ordered(&mut state.messages, message);
            }
            shown
        };

        if shown {
            let _ = self
                .events
                .send(StoreEvent::MessagesChanged(conversation_id.clone()));
        } else {
            debug!(conversation_id = %conversation_id, "conversations: inbound message for another conversation");
        }
        self.invalidate_conversations();
    }

    /// A name is only sent for conversations with more than one other member.
    pub async fn create_conversation(
        &self,
        name: Option<&str>,
        member_ids: Vec<UserId>,
    ) -> Result<Conversation> {
        let name = if member_ids.len() > 1 {
            name.map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        } else {
            None
        };
        let created = self
            .api
            .create_conversation(&CreateConversationRequest { name, member_ids })
            .await?;
        self.cache_identities(&created.members);
        info!(conversation_id = %created.id, "conversations: conversation created");
        self.invalidate_conversations();
        Ok(created)
    }

    pub async fn update_conversation(
        &self,
        id: &ConversationId,
        name: Option<String>,
        image_url: Option<String>,
    ) -> Result<Conversation> {
        let updated = self
            .api
            .update_conversation(id, &UpdateConversationRequest { name, image_url })
            .await?;
        {
            let mut state = self.lock_state();
            for member in &updated.members {
                state.cache_identity(member);
            }
            if let Some(existing) = state.conversations.iter_mut().find(|c| &c.id == id) {
                existing.name = updated.name.clone();
                existing.image_url = updated.image_url.clone();
                existing.updated_at = updated.updated_at;
            }
        }
        self.invalidate_conversations();
        Ok(updated)
    }

    pub async fn search_users(
        &self,
        search: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Paginated<Identity>> {
        let found = self
            .api
            .search_users(&UserSearchQuery {
                page,
                limit,
                search: search.map(str::to_string),
            })
            .await?;
        self.cache_identities(&found.data);
        Ok(found)
    }

    pub async fn get_user(&self, id: &UserId) -> Result<Identity> {
        let identity = self.api.get_user(id).await?;
        self.cache_identities([&identity]);
        Ok(identity)
    }

    pub async fn update_profile_image(&self, profile_url: &str) -> Result<Identity> {
        let identity = self.api.update_profile_image(profile_url).await?;
        let mut state = self.lock_state();
        state.cache_identity(&identity);
        if state
            .own_identity
            .as_ref()
            .is_some_and(|own| own.id == identity.id)
        {
            state.own_identity = Some(identity.clone());
        }
        Ok(identity)
    }

    pub fn clear(&self) {
        {
            let mut state = self.lock_state();
            let epoch = state.selection_epoch + 1;
            *state = StoreState::default();
            state.selection_epoch = epoch;
        }
        let _ = self.events.send(StoreEvent::SelectionChanged(None));
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;

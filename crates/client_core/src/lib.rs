use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::{Conversation, ConversationId, Message, TempMessageId, UserId, UserSummary};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub mod backend;
pub mod config;
pub mod conversation_store;
pub mod dispatcher;
pub mod error;
pub mod message_store;
pub mod realtime;
pub mod reconciler;
pub mod send_pipeline;
pub mod transport;
pub mod unread;

pub use backend::{ChatBackend, HttpChatBackend};
pub use config::{load_settings, ClientSettings};
pub use dispatcher::{EventDispatcher, EventSubscription};
pub use error::{ChatError, ChatResult};
pub use realtime::{ChannelKind, ReconnectPolicy, SubscriptionState};
pub use transport::{PushTransport, WsPushTransport};

use conversation_store::ConversationStore;
use message_store::{FetchTicket, MessageStore};
use realtime::{RealtimeChannelManager, RealtimeEvent};
use reconciler::ReconcileOrigin;
use unread::{UnreadEffect, UnreadTracker};

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsUpdated(Vec<Conversation>),
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    DraftChanged(String),
    SubscriptionChanged {
        channel: ChannelKind,
        state: SubscriptionState,
    },
    /// The placeholder has already been removed and the draft restored.
    SendFailed {
        conversation_id: ConversationId,
        temp_id: TempMessageId,
        error: ChatError,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub reconnect: ReconnectPolicy,
    pub event_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            event_buffer: 1024,
        }
    }
}

/// Operations a front end drives the engine through.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn connect(&self) -> ChatResult<Vec<Conversation>>;
    async fn shutdown(&self);
    async fn refresh_conversations(&self) -> ChatResult<Vec<Conversation>>;
    async fn open_conversation(&self, conversation_id: &ConversationId) -> ChatResult<Vec<Message>>;
    async fn close_conversation(&self);
    async fn send(&self, conversation_id: &ConversationId, content: &str) -> ChatResult<Message>;
    async fn start_new_conversation(&self, participant_id: &UserId) -> ChatResult<Conversation>;
    async fn search(&self, term: &str) -> ChatResult<Vec<UserSummary>>;
    fn subscribe_events(&self) -> EventSubscription<ChatEvent>;
}

pub(crate) struct ChatState {
    pub(crate) conversations: ConversationStore,
    pub(crate) messages: MessageStore,
    pub(crate) unread: UnreadTracker,
    pub(crate) draft: String,
    pub(crate) connected: bool,
}

impl ChatState {
    pub(crate) fn new(local_user: UserId) -> Self {
        Self {
            conversations: ConversationStore::new(),
            messages: MessageStore::new(local_user.clone()),
            unread: UnreadTracker::new(local_user),
            draft: String::new(),
            connected: false,
        }
    }

    fn ensure_connected(&self) -> ChatResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ChatError::NotConnected(
                "call connect() before using the chat client".to_string(),
            ))
        }
    }

    fn open_snapshot(&self) -> Option<(ConversationId, Vec<Message>)> {
        self.messages
            .conversation_id()
            .map(|conversation_id| (conversation_id.clone(), self.messages.messages().to_vec()))
    }
}

/// Conversation engine for one signed-in user.
///
/// Lock order is `channels` before `state`; `state` is never held across a
/// network call.
pub struct ChatClient {
    user_id: UserId,
    backend: Arc<dyn ChatBackend>,
    state: Mutex<ChatState>,
    channels: Mutex<RealtimeChannelManager>,
    realtime_rx: Mutex<Option<mpsc::UnboundedReceiver<RealtimeEvent>>>,
    events: EventDispatcher<ChatEvent>,
}

impl ChatClient {
    pub fn new(
        user_id: UserId,
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn PushTransport>,
        options: ClientOptions,
    ) -> Arc<Self> {
        let (realtime_tx, realtime_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(ChatState::new(user_id.clone())),
            channels: Mutex::new(RealtimeChannelManager::new(
                transport,
                options.reconnect,
                realtime_tx,
            )),
            realtime_rx: Mutex::new(Some(realtime_rx)),
            events: EventDispatcher::new(options.event_buffer),
            user_id,
            backend,
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> anyhow::Result<Arc<Self>> {
        settings.ensure_user()?;
        let user_id = UserId::new(settings.user_id.trim());
        let backend = HttpChatBackend::new(&settings.server_url, settings.request_timeout())?;
        let transport =
            WsPushTransport::new(settings.realtime_url()?, user_id.clone(), settings.event_buffer)?;
        Ok(Self::new(
            user_id,
            Arc::new(backend),
            Arc::new(transport),
            ClientOptions {
                reconnect: settings.reconnect_policy(),
                event_buffer: settings.event_buffer,
            },
        ))
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn subscribe_events(&self) -> EventSubscription<ChatEvent> {
        self.events.subscribe()
    }

    /// Starts realtime delivery and loads the conversation list. Calling it
    /// again after [`ChatClient::shutdown`] resubscribes.
    pub async fn connect(self: &Arc<Self>) -> ChatResult<Vec<Conversation>> {
        if let Some(realtime_rx) = self.realtime_rx.lock().await.take() {
            self.spawn_pump(realtime_rx);
        }
        self.state.lock().await.connected = true;
        self.channels
            .lock()
            .await
            .open_list_channel(self.user_id.clone())
            .await;
        info!(user_id = %self.user_id, "chat client connected");
        self.refresh_conversations().await
    }

    /// Releases both subscriptions before returning. Local state is kept.
    pub async fn shutdown(&self) {
        let mut channels = self.channels.lock().await;
        channels.shutdown().await;
        self.state.lock().await.connected = false;
        info!(user_id = %self.user_id, "chat client shut down");
    }

    pub async fn refresh_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let generation = {
            let mut state = self.state.lock().await;
            state.ensure_connected()?;
            state.conversations.begin_refresh()
        };

        let fetched = self.backend.fetch_conversations(&self.user_id).await?;

        let list = {
            let mut state = self.state.lock().await;
            if !state.conversations.apply_refresh(generation, fetched) {
                return Ok(state.conversations.list());
            }
            state.conversations.list()
        };
        self.events
            .publish(ChatEvent::ConversationsUpdated(list.clone()));
        Ok(list)
    }

    /// Selects a conversation, zeroes its unread count, moves the message
    /// subscription over to it, and loads its history. A history load that
    /// finishes after another conversation was opened is discarded.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<Message>> {
        let (ticket, conversations, messages) = {
            let mut state = self.state.lock().await;
            state.ensure_connected()?;
            if !state.conversations.contains(conversation_id) {
                return Err(ChatError::NotFound(format!(
                    "conversation {conversation_id} does not exist"
                )));
            }
            let ticket = state.messages.open(conversation_id.clone());
            let ChatState {
                conversations,
                unread,
                ..
            } = &mut *state;
            unread.mark_read(conversations, conversation_id)?;
            (
                ticket,
                state.conversations.list(),
                state.messages.messages().to_vec(),
            )
        };
        self.events
            .publish(ChatEvent::ConversationsUpdated(conversations));
        self.events.publish(ChatEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
            messages,
        });

        self.attach_message_channel(&ticket).await;
        self.spawn_mark_read(conversation_id.clone());

        let fetched = match self
            .backend
            .fetch_messages(&self.user_id, conversation_id)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%conversation_id, "message fetch failed: {err}");
                if self.state.lock().await.messages.is_current(&ticket) {
                    self.events.publish(ChatEvent::Error(err.to_string()));
                }
                return Err(err);
            }
        };

        let applied = {
            let mut state = self.state.lock().await;
            if state.messages.apply_fetch(&ticket, fetched) {
                Some(state.messages.messages().to_vec())
            } else {
                None
            }
        };
        match applied {
            Some(messages) => {
                self.events.publish(ChatEvent::MessagesUpdated {
                    conversation_id: conversation_id.clone(),
                    messages: messages.clone(),
                });
                Ok(messages)
            }
            None => Ok(self.messages().await),
        }
    }

    pub async fn close_conversation(&self) {
        let mut channels = self.channels.lock().await;
        self.state.lock().await.messages.close();
        channels.close_message_channel().await;
    }

    /// Sends `content` optimistically. On failure the placeholder is removed,
    /// the original text goes back into the draft, and the error is returned.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ChatResult<Message> {
        let (pending, snapshot) = {
            let mut state = self.state.lock().await;
            state.ensure_connected()?;
            let pending = state.begin_send(&self.user_id, conversation_id, content)?;
            (pending, state.open_snapshot())
        };
        debug!(%conversation_id, temp_id = %pending.temp_id, "optimistic send started");
        self.events.publish(ChatEvent::DraftChanged(String::new()));
        self.publish_messages(snapshot);

        match self
            .backend
            .send_message(&self.user_id, &pending.conversation_id, &pending.content)
            .await
        {
            Ok(durable) => {
                let (snapshot, conversations) = {
                    let mut state = self.state.lock().await;
                    state.confirm_send(&pending, durable.clone());
                    (state.open_snapshot(), state.conversations.list())
                };
                debug!(%conversation_id, temp_id = %pending.temp_id, message_id = %durable.id, "send confirmed");
                self.publish_messages(snapshot);
                self.events
                    .publish(ChatEvent::ConversationsUpdated(conversations));
                Ok(durable)
            }
            Err(err) => {
                warn!(%conversation_id, temp_id = %pending.temp_id, "send failed: {err}");
                let temp_id = pending.temp_id;
                let draft = pending.draft.clone();
                let snapshot = {
                    let mut state = self.state.lock().await;
                    state.roll_back_send(pending);
                    state.open_snapshot()
                };
                self.publish_messages(snapshot);
                self.events.publish(ChatEvent::DraftChanged(draft));
                self.events.publish(ChatEvent::SendFailed {
                    conversation_id: conversation_id.clone(),
                    temp_id,
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    pub async fn send_draft(&self, conversation_id: &ConversationId) -> ChatResult<Message> {
        let draft = self.draft().await;
        self.send(conversation_id, &draft).await
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        let text = text.into();
        self.state.lock().await.draft = text.clone();
        self.events.publish(ChatEvent::DraftChanged(text));
    }

    pub async fn draft(&self) -> String {
        self.state.lock().await.draft.clone()
    }

    /// Returns the conversation with `participant_id`, creating it on the
    /// server if this user has none yet.
    pub async fn start_new_conversation(
        &self,
        participant_id: &UserId,
    ) -> ChatResult<Conversation> {
        if participant_id == &self.user_id {
            return Err(ChatError::Validation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }
        {
            let state = self.state.lock().await;
            state.ensure_connected()?;
            if let Some(existing) = state.conversations.find_by_participant(participant_id) {
                return Ok(existing.clone());
            }
        }

        let conversation = self
            .backend
            .start_conversation(&self.user_id, participant_id)
            .await?;
        let conversations = {
            let mut state = self.state.lock().await;
            state.conversations.upsert(conversation.clone());
            state.conversations.list()
        };
        info!(conversation_id = %conversation.id, %participant_id, "conversation started");
        self.events
            .publish(ChatEvent::ConversationsUpdated(conversations));
        Ok(conversation)
    }

    pub async fn search(&self, term: &str) -> ChatResult<Vec<UserSummary>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let mut users = self.backend.search_users(&self.user_id, term).await?;
        users.retain(|user| user.user_id != self.user_id);
        Ok(users)
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.list()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.messages().to_vec()
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.state.lock().await.messages.conversation_id().cloned()
    }

    pub async fn message_channel_state(&self) -> SubscriptionState {
        self.channels.lock().await.message_channel_state()
    }

    pub async fn list_channel_state(&self) -> SubscriptionState {
        self.channels.lock().await.list_channel_state()
    }

    async fn attach_message_channel(&self, ticket: &FetchTicket) {
        let mut channels = self.channels.lock().await;
        // A later open may have run while this one waited for the lock.
        if !self.state.lock().await.messages.is_current(ticket) {
            debug!(
                conversation_id = %ticket.conversation_id(),
                "skipping subscription for superseded selection"
            );
            return;
        }
        channels
            .open_message_channel(ticket.conversation_id().clone())
            .await;
    }

    fn spawn_pump(self: &Arc<Self>, mut realtime_rx: mpsc::UnboundedReceiver<RealtimeEvent>) {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = realtime_rx.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.handle_realtime_event(event).await;
            }
            debug!("realtime event pump stopped");
        });
    }

    async fn handle_realtime_event(self: &Arc<Self>, event: RealtimeEvent) {
        match event {
            RealtimeEvent::StateChanged {
                channel,
                state,
                detail,
            } => {
                if let Some(detail) = detail {
                    debug!(%channel, ?state, "subscription state detail: {detail}");
                }
                self.events
                    .publish(ChatEvent::SubscriptionChanged { channel, state });
            }
            RealtimeEvent::MessageInserted(message) => {
                self.apply_push(message, ReconcileOrigin::PushInsert, true)
                    .await;
            }
            RealtimeEvent::MessageUpdated(message) => {
                self.apply_push(message, ReconcileOrigin::PushUpdate, true)
                    .await;
            }
            RealtimeEvent::InboxMessage(message) => {
                self.apply_push(message, ReconcileOrigin::PushInsert, false)
                    .await;
            }
            RealtimeEvent::ConversationsChanged => self.spawn_refresh(),
        }
    }

    /// `require_open` drops events from the per-conversation subscription that
    /// arrive after the user switched away; the list subscription covers those.
    async fn apply_push(
        self: &Arc<Self>,
        message: Message,
        origin: ReconcileOrigin,
        require_open: bool,
    ) {
        let mut needs_refresh = false;
        let mut mark_read = None;
        let (snapshot, conversations) = {
            let mut state = self.state.lock().await;
            let open = state.messages.conversation_id().cloned();
            let is_open = open.as_ref() == Some(&message.conversation_id);
            if require_open && !is_open {
                debug!(
                    conversation_id = %message.conversation_id,
                    "dropping push for a conversation that is no longer open"
                );
                return;
            }

            let conversations = if origin == ReconcileOrigin::PushInsert {
                let ChatState {
                    conversations,
                    unread,
                    ..
                } = &mut *state;
                match unread.on_incoming(conversations, &message, open.as_ref()) {
                    Ok(effect) => {
                        if effect == UnreadEffect::MarkRead {
                            mark_read = Some(message.conversation_id.clone());
                        }
                        Some(conversations.list())
                    }
                    Err(ChatError::NotFound(_)) => {
                        needs_refresh = true;
                        None
                    }
                    Err(err) => {
                        warn!(conversation_id = %message.conversation_id, "unread tracking failed: {err}");
                        None
                    }
                }
            } else {
                None
            };

            let snapshot = if is_open && state.messages.reconcile(message, origin).is_some() {
                state.open_snapshot()
            } else {
                None
            };
            (snapshot, conversations)
        };

        self.publish_messages(snapshot);
        if let Some(conversations) = conversations {
            self.events
                .publish(ChatEvent::ConversationsUpdated(conversations));
        }
        if let Some(conversation_id) = mark_read {
            self.spawn_mark_read(conversation_id);
        }
        if needs_refresh {
            self.spawn_refresh();
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.refresh_conversations().await {
                warn!("conversation list refresh failed: {err}");
                client.events.publish(ChatEvent::Error(err.to_string()));
            }
        });
    }

    fn spawn_mark_read(&self, conversation_id: ConversationId) {
        let backend = Arc::clone(&self.backend);
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.mark_as_read(&user_id, &conversation_id).await {
                warn!(%conversation_id, "mark as read failed: {err}");
            }
        });
    }

    fn publish_messages(&self, snapshot: Option<(ConversationId, Vec<Message>)>) {
        if let Some((conversation_id, messages)) = snapshot {
            self.events.publish(ChatEvent::MessagesUpdated {
                conversation_id,
                messages,
            });
        }
    }
}

#[async_trait]
impl ChatHandle for Arc<ChatClient> {
    async fn connect(&self) -> ChatResult<Vec<Conversation>> {
        ChatClient::connect(self).await
    }

    async fn shutdown(&self) {
        ChatClient::shutdown(self).await
    }

    async fn refresh_conversations(&self) -> ChatResult<Vec<Conversation>> {
        ChatClient::refresh_conversations(self).await
    }

    async fn open_conversation(&self, conversation_id: &ConversationId) -> ChatResult<Vec<Message>> {
        ChatClient::open_conversation(self, conversation_id).await
    }

    async fn close_conversation(&self) {
        ChatClient::close_conversation(self).await
    }

    async fn send(&self, conversation_id: &ConversationId, content: &str) -> ChatResult<Message> {
        ChatClient::send(self, conversation_id, content).await
    }

    async fn start_new_conversation(&self, participant_id: &UserId) -> ChatResult<Conversation> {
        ChatClient::start_new_conversation(self, participant_id).await
    }

    async fn search(&self, term: &str) -> ChatResult<Vec<UserSummary>> {
        ChatClient::search(self, term).await
    }

    fn subscribe_events(&self) -> EventSubscription<ChatEvent> {
        ChatClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

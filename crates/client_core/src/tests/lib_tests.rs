use super::*;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex as StdMutex,
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{DeliveryStatus, MessageId, MessageKey, ParticipantRole},
    protocol::{ConversationRow, MessageRow, PushEvent, PushKind, SubscriptionFilter},
};
use tokio::{sync::oneshot, time::timeout};

use crate::transport::{PushSubscription, TransportSignal};

enum SendScript {
    Respond(ChatResult<Message>),
    Gated(oneshot::Receiver<ChatResult<Message>>),
}

#[derive(Default)]
struct Calls {
    fetch_conversations: usize,
    fetch_messages: Vec<ConversationId>,
    sends: Vec<(ConversationId, String)>,
    mark_read: Vec<ConversationId>,
    searches: Vec<String>,
    started: Vec<UserId>,
}

#[derive(Default)]
struct FakeBackend {
    conversations: StdMutex<Vec<Conversation>>,
    messages: StdMutex<HashMap<ConversationId, Vec<Message>>>,
    fetch_gates: StdMutex<HashMap<ConversationId, oneshot::Receiver<()>>>,
    send_script: StdMutex<VecDeque<SendScript>>,
    users: StdMutex<Vec<UserSummary>>,
    calls: StdMutex<Calls>,
}

impl FakeBackend {
    fn with_conversations(conversations: Vec<Conversation>) -> Self {
        let backend = Self::default();
        *backend.conversations.lock().expect("conversations") = conversations;
        backend
    }

    fn set_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.messages
            .lock()
            .expect("messages")
            .insert(conversation_id.into(), messages);
    }

    fn gate_fetch(&self, conversation_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.fetch_gates
            .lock()
            .expect("gates")
            .insert(conversation_id.into(), rx);
        tx
    }

    fn gate_send(&self) -> oneshot::Sender<ChatResult<Message>> {
        let (tx, rx) = oneshot::channel();
        self.send_script
            .lock()
            .expect("script")
            .push_back(SendScript::Gated(rx));
        tx
    }

    fn fail_next_send(&self, err: ChatError) {
        self.send_script
            .lock()
            .expect("script")
            .push_back(SendScript::Respond(Err(err)));
    }

    fn calls<T>(&self, read: impl FnOnce(&Calls) -> T) -> T {
        read(&self.calls.lock().expect("calls"))
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_conversations(&self, _user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        self.calls.lock().expect("calls").fetch_conversations += 1;
        Ok(self.conversations.lock().expect("conversations").clone())
    }

    async fn fetch_messages(
        &self,
        _user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<Message>> {
        self.calls
            .lock()
            .expect("calls")
            .fetch_messages
            .push(conversation_id.clone());
        let gate = self.fetch_gates.lock().expect("gates").remove(conversation_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .messages
            .lock()
            .expect("messages")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ChatResult<Message> {
        let script = {
            let mut calls = self.calls.lock().expect("calls");
            calls.sends.push((conversation_id.clone(), content.to_string()));
            let id = format!("m-{}", calls.sends.len());
            self.send_script
                .lock()
                .expect("script")
                .pop_front()
                .unwrap_or_else(|| {
                    SendScript::Respond(Ok(durable(&id, conversation_id.as_str(), user_id.as_str(), content)))
                })
        };
        match script {
            SendScript::Respond(result) => result,
            SendScript::Gated(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ChatError::Network("gate dropped".into()))),
        }
    }

    async fn mark_as_read(
        &self,
        _user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        self.calls
            .lock()
            .expect("calls")
            .mark_read
            .push(conversation_id.clone());
        Ok(())
    }

    async fn start_conversation(
        &self,
        _user_id: &UserId,
        participant_id: &UserId,
    ) -> ChatResult<Conversation> {
        self.calls
            .lock()
            .expect("calls")
            .started
            .push(participant_id.clone());
        let created = conversation(&format!("c-{participant_id}"), participant_id.as_str(), 0);
        self.conversations
            .lock()
            .expect("conversations")
            .push(created.clone());
        Ok(created)
    }

    async fn search_users(&self, _user_id: &UserId, term: &str) -> ChatResult<Vec<UserSummary>> {
        self.calls
            .lock()
            .expect("calls")
            .searches
            .push(term.to_string());
        Ok(self.users.lock().expect("users").clone())
    }
}

#[derive(Default)]
struct FakeTransport {
    feeds: StdMutex<HashMap<SubscriptionFilter, mpsc::Sender<TransportSignal>>>,
    subscribed: StdMutex<Vec<SubscriptionFilter>>,
}

impl FakeTransport {
    fn feed(&self, filter: &SubscriptionFilter) -> Option<mpsc::Sender<TransportSignal>> {
        self.feeds.lock().expect("feeds").get(filter).cloned()
    }

    fn subscribed(&self) -> Vec<SubscriptionFilter> {
        self.subscribed.lock().expect("subscribed").clone()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn subscribe(&self, filter: SubscriptionFilter) -> ChatResult<PushSubscription> {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (close_tx, _close_rx) = oneshot::channel();
        self.feeds
            .lock()
            .expect("feeds")
            .insert(filter.clone(), feed_tx);
        self.subscribed
            .lock()
            .expect("subscribed")
            .push(filter.clone());
        Ok(PushSubscription::new(filter, feed_rx, close_tx))
    }
}

fn conversation(id: &str, participant: &str, unread_count: u32) -> Conversation {
    Conversation {
        id: id.into(),
        participant_id: participant.into(),
        participant_display_name: format!("{participant} display"),
        participant_role: ParticipantRole::Farmer,
        last_message_preview: None,
        last_message_at: None,
        unread_count,
    }
}

fn durable(id: &str, conversation_id: &str, sender: &str, content: &str) -> Message {
    Message {
        id: MessageKey::Durable(MessageId::new(id)),
        conversation_id: conversation_id.into(),
        sender_id: sender.into(),
        content: content.into(),
        created_at: Utc::now(),
        is_read: false,
        status: DeliveryStatus::Confirmed,
    }
}

fn insert_event(id: &str, conversation_id: &str, sender: &str, recipient: &str, content: &str) -> PushEvent {
    let row = MessageRow {
        id: id.into(),
        conversation_id: conversation_id.into(),
        sender_id: sender.into(),
        recipient_id: Some(recipient.into()),
        content: content.into(),
        created_at: Utc::now(),
        is_read: false,
    };
    PushEvent::message(PushKind::Insert, &row).expect("event")
}

fn conversation_filter(id: &str) -> SubscriptionFilter {
    SubscriptionFilter::Conversation {
        conversation_id: id.into(),
    }
}

fn participant_filter() -> SubscriptionFilter {
    SubscriptionFilter::Participant {
        user_id: "me".into(),
    }
}

fn fast_options() -> ClientOptions {
    ClientOptions {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        event_buffer: 256,
    }
}

fn client(backend: &Arc<FakeBackend>, transport: &Arc<FakeTransport>) -> Arc<ChatClient> {
    ChatClient::new(
        "me".into(),
        Arc::clone(backend) as Arc<dyn ChatBackend>,
        Arc::clone(transport) as Arc<dyn PushTransport>,
        fast_options(),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn next_event(
    events: &mut EventSubscription<ChatEvent>,
    mut wanted: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.expect("dispatcher alive");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn push(transport: &FakeTransport, filter: &SubscriptionFilter, event: PushEvent) {
    let mut feed = None;
    eventually(|| {
        feed = transport.feed(filter);
        feed.is_some()
    })
    .await;
    feed.expect("feed")
        .send(TransportSignal::Event(event))
        .await
        .expect("push delivered");
}

fn unread_of(conversations: &[Conversation], id: &str) -> u32 {
    conversations
        .iter()
        .find(|c| c.id.as_str() == id)
        .map(|c| c.unread_count)
        .expect("conversation listed")
}

#[tokio::test]
async fn operations_before_connect_are_rejected() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);

    let err = client
        .open_conversation(&"c7".into())
        .await
        .expect_err("not connected");
    assert!(matches!(err, ChatError::NotConnected(_)));
    assert!(matches!(
        client.send(&"c7".into(), "hi").await,
        Err(ChatError::NotConnected(_))
    ));
    assert!(transport.subscribed().is_empty());
}

#[tokio::test]
async fn open_send_and_push_race_leave_single_durable_entry() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 3)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();

    client.connect().await.expect("connect");
    client.open_conversation(&"c7".into()).await.expect("open");

    assert_eq!(unread_of(&client.conversations().await, "c7"), 0);
    eventually(|| backend.calls(|calls| calls.mark_read == vec![ConversationId::new("c7")])).await;

    let gate = backend.gate_send();
    let sender = Arc::clone(&client);
    let send = tokio::spawn(async move { sender.send(&"c7".into(), "Hello").await });

    next_event(&mut events, |event| {
        matches!(event, ChatEvent::MessagesUpdated { messages, .. }
            if messages.len() == 1 && messages[0].is_pending_temporary())
    })
    .await;

    push(
        &transport,
        &conversation_filter("c7"),
        insert_event("m-42", "c7", "me", "farmer-1", "Hello"),
    )
    .await;
    next_event(&mut events, |event| {
        matches!(event, ChatEvent::MessagesUpdated { messages, .. }
            if messages.len() == 1 && messages[0].durable_id().map(|id| id.as_str()) == Some("m-42"))
    })
    .await;

    gate.send(Ok(durable("m-42", "c7", "me", "Hello")))
        .expect("send gate open");
    let confirmed = send.await.expect("join").expect("send");
    assert_eq!(confirmed.durable_id().map(|id| id.as_str()), Some("m-42"));

    let messages = client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].durable_id().map(|id| id.as_str()), Some("m-42"));
    let conversations = client.conversations().await;
    assert_eq!(conversations[0].last_message_preview.as_deref(), Some("Hello"));
    assert_eq!(conversations[0].unread_count, 0);
}

#[tokio::test]
async fn failed_send_rolls_back_and_restores_draft() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    backend.set_history("c7", vec![durable("m-1", "c7", "farmer-1", "fresh eggs?")]);
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();

    client.connect().await.expect("connect");
    client.open_conversation(&"c7".into()).await.expect("open");
    backend.fail_next_send(ChatError::Network("connection reset".into()));
    client.set_draft("  yes, 3 dozen ").await;

    let err = client.send_draft(&"c7".into()).await.expect_err("send fails");

    assert!(err.is_retryable());
    assert_eq!(client.draft().await, "  yes, 3 dozen ");
    let messages = client.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages.iter().all(|m| m.temp_id().is_none()));
    assert_eq!(
        backend.calls(|calls| calls.sends.clone()),
        vec![(ConversationId::new("c7"), "yes, 3 dozen".to_string())]
    );
    let failed = next_event(&mut events, |event| matches!(event, ChatEvent::SendFailed { .. })).await;
    assert!(matches!(failed, ChatEvent::SendFailed { error: ChatError::Network(_), .. }));
}

#[tokio::test]
async fn blank_draft_is_rejected_before_the_network() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    client.connect().await.expect("connect");

    let err = client.send(&"c7".into(), "   ").await.expect_err("blank");

    assert!(matches!(err, ChatError::Validation(_)));
    assert!(backend.calls(|calls| calls.sends.is_empty()));
}

#[tokio::test]
async fn stale_fetch_does_not_overwrite_newer_selection() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![
        conversation("c7", "farmer-1", 0),
        conversation("c8", "farmer-2", 0),
    ]));
    backend.set_history("c7", vec![durable("m-7", "c7", "farmer-1", "from c7")]);
    backend.set_history("c8", vec![durable("m-8", "c8", "farmer-2", "from c8")]);
    let release_c7 = backend.gate_fetch("c7");
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    client.connect().await.expect("connect");

    let opener = Arc::clone(&client);
    let slow_open = tokio::spawn(async move { opener.open_conversation(&"c7".into()).await });
    eventually(|| backend.calls(|calls| calls.fetch_messages.contains(&"c7".into()))).await;

    client.open_conversation(&"c8".into()).await.expect("open c8");
    release_c7.send(()).expect("release c7 fetch");
    slow_open.await.expect("join").expect("stale open still resolves");

    let messages = client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation_id.as_str(), "c8");
    assert_eq!(client.open_conversation_id().await, Some("c8".into()));
    assert_eq!(transport.subscribed().last(), Some(&conversation_filter("c8")));
}

#[tokio::test]
async fn unread_counts_grow_by_one_per_message_and_reset_on_open() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![
        conversation("c7", "farmer-1", 0),
        conversation("c8", "farmer-2", 0),
    ]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();
    client.connect().await.expect("connect");
    client.open_conversation(&"c8".into()).await.expect("open c8");

    let list = participant_filter();
    push(&transport, &list, insert_event("m-1", "c7", "farmer-1", "me", "tomatoes ready")).await;
    push(&transport, &list, insert_event("m-1", "c7", "farmer-1", "me", "tomatoes ready")).await;
    push(&transport, &list, insert_event("m-2", "c7", "farmer-1", "me", "pick up today?")).await;

    next_event(&mut events, |event| {
        matches!(event, ChatEvent::ConversationsUpdated(list) if unread_of(list, "c7") == 2)
    })
    .await;
    let conversations = client.conversations().await;
    assert_eq!(unread_of(&conversations, "c7"), 2);
    assert_eq!(conversations[0].id.as_str(), "c7");
    assert_eq!(conversations[0].last_message_preview.as_deref(), Some("pick up today?"));
    assert!(client.messages().await.is_empty());

    client.open_conversation(&"c7".into()).await.expect("open c7");
    assert_eq!(unread_of(&client.conversations().await, "c7"), 0);
}

#[tokio::test]
async fn push_for_open_conversation_marks_read_instead_of_counting() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();
    client.connect().await.expect("connect");
    client.open_conversation(&"c7".into()).await.expect("open");

    push(
        &transport,
        &conversation_filter("c7"),
        insert_event("m-3", "c7", "farmer-1", "me", "still available"),
    )
    .await;
    next_event(&mut events, |event| {
        matches!(event, ChatEvent::MessagesUpdated { messages, .. } if messages.len() == 1)
    })
    .await;

    assert_eq!(unread_of(&client.conversations().await, "c7"), 0);
    eventually(|| backend.calls(|calls| calls.mark_read.len() == 2)).await;
}

#[tokio::test]
async fn dropped_message_channel_keeps_messages_and_resubscribes() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    backend.set_history("c7", vec![durable("m-1", "c7", "farmer-1", "eggs ready")]);
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();
    client.connect().await.expect("connect");
    client.open_conversation(&"c7".into()).await.expect("open");

    push(
        &transport,
        &conversation_filter("c7"),
        insert_event("m-2", "c7", "farmer-1", "me", "two dozen left"),
    )
    .await;
    next_event(&mut events, |event| {
        matches!(event, ChatEvent::MessagesUpdated { messages, .. } if messages.len() == 2)
    })
    .await;
    let before = client.messages().await;

    transport
        .feed(&conversation_filter("c7"))
        .expect("feed")
        .send(TransportSignal::Closed("connection reset".into()))
        .await
        .expect("closed delivered");
    next_event(&mut events, |event| {
        matches!(
            event,
            ChatEvent::SubscriptionChanged {
                state: SubscriptionState::Error,
                ..
            }
        )
    })
    .await;
    assert_eq!(client.messages().await, before);

    let c7_subscriptions = || {
        transport
            .subscribed()
            .iter()
            .filter(|filter| **filter == conversation_filter("c7"))
            .count()
    };
    next_event(&mut events, |event| {
        matches!(
            event,
            ChatEvent::SubscriptionChanged {
                channel: ChannelKind::Messages(_),
                state: SubscriptionState::Active,
            }
        )
    })
    .await;
    assert_eq!(c7_subscriptions(), 2);
    assert_eq!(client.message_channel_state().await, SubscriptionState::Active);
    assert_eq!(client.messages().await, before);

    push(
        &transport,
        &conversation_filter("c7"),
        insert_event("m-3", "c7", "farmer-1", "me", "last call"),
    )
    .await;
    next_event(&mut events, |event| {
        matches!(event, ChatEvent::MessagesUpdated { messages, .. } if messages.len() == 3)
    })
    .await;
    let ids: Vec<String> = client
        .messages()
        .await
        .iter()
        .filter_map(|message| message.durable_id().map(|id| id.as_str().to_string()))
        .collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
}

#[tokio::test]
async fn conversation_push_triggers_list_refresh() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();
    client.connect().await.expect("connect");

    backend
        .conversations
        .lock()
        .expect("conversations")
        .push(conversation("c9", "farmer-9", 1));
    let row = ConversationRow {
        id: "c9".into(),
        participant_a: "farmer-9".into(),
        participant_b: "me".into(),
        last_message: None,
        last_message_at: None,
    };
    push(
        &transport,
        &participant_filter(),
        PushEvent::conversation(PushKind::Insert, &row).expect("event"),
    )
    .await;

    next_event(&mut events, |event| {
        matches!(event, ChatEvent::ConversationsUpdated(list) if list.len() == 2)
    })
    .await;
    assert_eq!(unread_of(&client.conversations().await, "c9"), 1);
    assert_eq!(backend.calls(|calls| calls.fetch_conversations), 2);
}

#[tokio::test]
async fn inbox_message_for_unknown_conversation_refreshes_list() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let mut events = client.subscribe_events();
    client.connect().await.expect("connect");

    backend
        .conversations
        .lock()
        .expect("conversations")
        .push(conversation("c9", "farmer-9", 1));
    push(
        &transport,
        &participant_filter(),
        insert_event("m-9", "c9", "farmer-9", "me", "hello buyer"),
    )
    .await;

    next_event(&mut events, |event| {
        matches!(event, ChatEvent::ConversationsUpdated(list) if list.len() == 2)
    })
    .await;
}

#[tokio::test]
async fn start_new_conversation_reuses_existing_pair() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    client.connect().await.expect("connect");

    let existing = client
        .start_new_conversation(&"farmer-1".into())
        .await
        .expect("existing");
    let created = client
        .start_new_conversation(&"farmer-2".into())
        .await
        .expect("created");

    assert_eq!(existing.id.as_str(), "c7");
    assert_eq!(created.id.as_str(), "c-farmer-2");
    assert_eq!(backend.calls(|calls| calls.started.clone()), vec![UserId::new("farmer-2")]);
    assert_eq!(client.conversations().await.len(), 2);
    assert!(matches!(
        client.start_new_conversation(&"me".into()).await,
        Err(ChatError::Validation(_))
    ));
}

#[tokio::test]
async fn search_trims_skips_blank_and_hides_self() {
    let backend = Arc::new(FakeBackend::default());
    *backend.users.lock().expect("users") = vec![
        UserSummary {
            user_id: "me".into(),
            display_name: "Me".into(),
            role: ParticipantRole::Buyer,
        },
        UserSummary {
            user_id: "farmer-1".into(),
            display_name: "Green Acres".into(),
            role: ParticipantRole::Farmer,
        },
    ];
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);

    assert!(client.search("   ").await.expect("blank").is_empty());
    let found = client.search("  green ").await.expect("search");

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].user_id.as_str(), "farmer-1");
    assert_eq!(backend.calls(|calls| calls.searches.clone()), vec!["green".to_string()]);
}

#[tokio::test]
async fn shutdown_releases_subscriptions_and_reports_state() {
    let backend = Arc::new(FakeBackend::with_conversations(vec![conversation("c7", "farmer-1", 0)]));
    let transport = Arc::new(FakeTransport::default());
    let client = client(&backend, &transport);
    let handle: &dyn ChatHandle = &client;
    let mut events = handle.subscribe_events();

    handle.connect().await.expect("connect");
    handle.open_conversation(&"c7".into()).await.expect("open");
    next_event(&mut events, |event| {
        matches!(event, ChatEvent::SubscriptionChanged { channel: ChannelKind::Messages(_), state: SubscriptionState::Active })
    })
    .await;

    handle.shutdown().await;

    assert_eq!(client.message_channel_state().await, SubscriptionState::Closed);
    assert_eq!(client.list_channel_state().await, SubscriptionState::Closed);
    assert!(matches!(
        handle.send(&"c7".into(), "hi").await,
        Err(ChatError::NotConnected(_))
    ));
}

use std::{fmt, sync::Arc, time::Duration};

use shared::{
    domain::{ConversationId, Message, UserId},
    protocol::{PushEvent, PushKind, PushRecord, SubscriptionFilter},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::transport::{PushTransport, TransportSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Closed,
    Connecting,
    Active,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Messages(ConversationId),
    ConversationList,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Messages(conversation_id) => write!(f, "messages:{conversation_id}"),
            ChannelKind::ConversationList => f.write_str("conversations"),
        }
    }
}

/// Normalized output of both subscriptions.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    /// Message insert seen by the conversation-list subscription.
    InboxMessage(Message),
    ConversationsChanged,
    StateChanged {
        channel: ChannelKind,
        state: SubscriptionState,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

struct ChannelWorker {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    state: watch::Receiver<SubscriptionState>,
}

impl ChannelWorker {
    /// Returns once the worker has released its subscription.
    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            warn!("realtime worker ended abnormally: {err}");
        }
    }

    fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }
}

/// Owns at most one message subscription and one conversation-list
/// subscription. Switching conversations fully releases the previous message
/// subscription before the next one is requested.
pub struct RealtimeChannelManager {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<RealtimeEvent>,
    message_channel: Option<(ConversationId, ChannelWorker)>,
    list_channel: Option<ChannelWorker>,
}

impl RealtimeChannelManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<RealtimeEvent>,
    ) -> Self {
        Self {
            transport,
            policy,
            events,
            message_channel: None,
            list_channel: None,
        }
    }

    pub async fn open_message_channel(&mut self, conversation_id: ConversationId) {
        if let Some((current, worker)) = &self.message_channel {
            if current == &conversation_id && !worker.task.is_finished() {
                debug!(%conversation_id, "message subscription already open");
                return;
            }
        }
        self.close_message_channel().await;

        let filter = SubscriptionFilter::Conversation {
            conversation_id: conversation_id.clone(),
        };
        let worker = self.spawn_worker(ChannelKind::Messages(conversation_id.clone()), filter);
        self.message_channel = Some((conversation_id, worker));
    }

    pub async fn close_message_channel(&mut self) {
        if let Some((conversation_id, worker)) = self.message_channel.take() {
            worker.stop().await;
            info!(%conversation_id, "message subscription closed");
        }
    }

    pub async fn open_list_channel(&mut self, user_id: UserId) {
        if let Some(worker) = &self.list_channel {
            if !worker.task.is_finished() {
                return;
            }
        }
        self.close_list_channel().await;
        let filter = SubscriptionFilter::Participant { user_id };
        self.list_channel = Some(self.spawn_worker(ChannelKind::ConversationList, filter));
    }

    pub async fn close_list_channel(&mut self) {
        if let Some(worker) = self.list_channel.take() {
            worker.stop().await;
            info!("conversation list subscription closed");
        }
    }

    pub async fn shutdown(&mut self) {
        self.close_message_channel().await;
        self.close_list_channel().await;
    }

    pub fn message_channel_state(&self) -> SubscriptionState {
        self.message_channel
            .as_ref()
            .map_or(SubscriptionState::Closed, |(_, worker)| worker.state())
    }

    pub fn list_channel_state(&self) -> SubscriptionState {
        self.list_channel
            .as_ref()
            .map_or(SubscriptionState::Closed, ChannelWorker::state)
    }

    fn spawn_worker(&self, channel: ChannelKind, filter: SubscriptionFilter) -> ChannelWorker {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Closed);
        let worker = Worker {
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            events: self.events.clone(),
            channel,
            filter,
            state: state_tx,
        };
        ChannelWorker {
            shutdown: shutdown_tx,
            task: tokio::spawn(worker.run(shutdown_rx)),
            state: state_rx,
        }
    }
}

struct Worker {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<RealtimeEvent>,
    channel: ChannelKind,
    filter: SubscriptionFilter,
    state: watch::Sender<SubscriptionState>,
}

impl Worker {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt = 0u32;
        loop {
            self.set_state(SubscriptionState::Connecting, None);
            let subscribed = tokio::select! {
                _ = &mut shutdown => break,
                subscribed = self.transport.subscribe(self.filter.clone()) => subscribed,
            };

            let failure = match subscribed {
                Ok(mut subscription) => {
                    attempt = 0;
                    self.set_state(SubscriptionState::Active, None);
                    let reason = loop {
                        tokio::select! {
                            _ = &mut shutdown => {
                                subscription.unsubscribe().await;
                                self.set_state(SubscriptionState::Closed, None);
                                return;
                            }
                            signal = subscription.recv() => match signal {
                                Some(TransportSignal::Event(event)) => self.forward(event),
                                Some(TransportSignal::Closed(reason)) => break reason,
                                None => break "subscription ended".to_string(),
                            }
                        }
                    };
                    subscription.unsubscribe().await;
                    reason
                }
                Err(err) => err.to_string(),
            };

            let delay = self.policy.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                channel = %self.channel,
                retry_in_ms = delay.as_millis() as u64,
                "realtime subscription failed: {failure}"
            );
            self.set_state(SubscriptionState::Error, Some(failure));

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(SubscriptionState::Closed, None);
    }

    fn set_state(&self, state: SubscriptionState, detail: Option<String>) {
        self.state.send_replace(state);
        if state == SubscriptionState::Active {
            info!(channel = %self.channel, "realtime subscription active");
        }
        let _ = self.events.send(RealtimeEvent::StateChanged {
            channel: self.channel.clone(),
            state,
            detail,
        });
    }

    fn forward(&self, event: PushEvent) {
        let record = match event.record() {
            Ok(record) => record,
            Err(err) => {
                warn!(channel = %self.channel, "dropping undecodable push row: {err}");
                return;
            }
        };
        if !self.filter.matches(&record) {
            debug!(channel = %self.channel, "dropping push event outside subscription filter");
            return;
        }
        if let Some(normalized) = normalize(&self.channel, event.kind, record) {
            let _ = self.events.send(normalized);
        }
    }
}

fn normalize(channel: &ChannelKind, kind: PushKind, record: PushRecord) -> Option<RealtimeEvent> {
    match (channel, kind, record) {
        (ChannelKind::Messages(_), PushKind::Insert, PushRecord::Message(row)) => {
            Some(RealtimeEvent::MessageInserted(row.into()))
        }
        (ChannelKind::Messages(_), PushKind::Update, PushRecord::Message(row)) => {
            Some(RealtimeEvent::MessageUpdated(row.into()))
        }
        (ChannelKind::ConversationList, PushKind::Insert, PushRecord::Message(row)) => {
            Some(RealtimeEvent::InboxMessage(row.into()))
        }
        (ChannelKind::ConversationList, _, PushRecord::Conversation(_)) => {
            Some(RealtimeEvent::ConversationsChanged)
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;

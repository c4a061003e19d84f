use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{PushEvent, SubscriptionFilter},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone)]
pub enum TransportSignal {
    Event(PushEvent),
    /// The connection ended; no further events will arrive on this subscription.
    Closed(String),
}

/// Live handle returned by [`PushTransport::subscribe`]. Dropping it also
/// releases the subscription, but only [`PushSubscription::unsubscribe`] waits
/// for the release to finish.
pub struct PushSubscription {
    filter: SubscriptionFilter,
    signals: mpsc::Receiver<TransportSignal>,
    closer: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PushSubscription {
    pub fn new(
        filter: SubscriptionFilter,
        signals: mpsc::Receiver<TransportSignal>,
        closer: oneshot::Sender<()>,
    ) -> Self {
        Self {
            filter,
            signals,
            closer: Some(closer),
            task: None,
        }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub async fn recv(&mut self) -> Option<TransportSignal> {
        self.signals.recv().await
    }

    pub async fn unsubscribe(mut self) {
        debug!(filter = ?self.filter, "releasing push subscription");
        // Undelivered signals are discarded so the reader task never waits on capacity.
        self.signals.close();
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, filter: SubscriptionFilter) -> ChatResult<PushSubscription>;
}

/// One WebSocket per subscription. The filter is the first frame sent; every
/// text frame after that is a JSON [`PushEvent`].
pub struct WsPushTransport {
    realtime_url: Url,
    user_id: UserId,
    buffer: usize,
}

impl WsPushTransport {
    pub fn new(realtime_url: Url, user_id: UserId, buffer: usize) -> ChatResult<Self> {
        if !matches!(realtime_url.scheme(), "ws" | "wss") {
            return Err(ChatError::Validation(
                "realtime_url must start with ws:// or wss://".to_string(),
            ));
        }
        Ok(Self {
            realtime_url,
            user_id,
            buffer: buffer.max(1),
        })
    }

    fn connect_url(&self) -> Url {
        let mut url = self.realtime_url.clone();
        url.query_pairs_mut()
            .append_pair("user_id", self.user_id.as_str());
        url
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn subscribe(&self, filter: SubscriptionFilter) -> ChatResult<PushSubscription> {
        let url = self.connect_url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChatError::Subscription(format!("failed to connect {url}: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let frame = serde_json::to_string(&filter)
            .map_err(|err| ChatError::Subscription(format!("failed to encode filter: {err}")))?;
        ws_writer.send(WsMessage::Text(frame)).await?;

        let (signal_tx, signal_rx) = mpsc::channel(self.buffer);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let task_filter = filter.clone();
        let task = tokio::spawn(async move {
            let closed_reason = loop {
                tokio::select! {
                    _ = &mut close_rx => break None,
                    frame = ws_reader.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let event = match serde_json::from_str::<PushEvent>(&text) {
                                Ok(event) => event,
                                Err(err) => {
                                    warn!("invalid push event: {err}");
                                    continue;
                                }
                            };
                            // A full buffer must not keep the release request waiting.
                            let delivered = tokio::select! {
                                _ = &mut close_rx => break None,
                                sent = signal_tx.send(TransportSignal::Event(event)) => sent.is_ok(),
                            };
                            if !delivered {
                                break None;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            break Some(
                                frame
                                    .map(|frame| frame.reason.to_string())
                                    .filter(|reason| !reason.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string()),
                            );
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Some(format!("websocket receive failed: {err}")),
                        None => break Some("websocket stream ended".to_string()),
                    }
                }
            };
            match closed_reason {
                Some(reason) => {
                    let _ = signal_tx.send(TransportSignal::Closed(reason)).await;
                }
                None => {
                    let _ = ws_writer.send(WsMessage::Close(None)).await;
                    debug!(filter = ?task_filter, "push subscription released");
                }
            }
        });

        Ok(PushSubscription::new(filter, signal_rx, close_tx).with_task(task))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

//! Typed publish/subscribe for notifications leaving the engine.
//!
//! The dispatcher is owned by whoever creates it (the [`crate::ChatClient`]
//! owns the one carrying [`crate::ChatEvent`]). A view subscribes when it is
//! mounted and drops its [`EventSubscription`] on teardown; dropping is the
//! unsubscribe. Slow subscribers skip what they missed instead of blocking
//! publishers.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

pub struct EventDispatcher<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventDispatcher<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers the event reached. Zero is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EventSubscription<E> {
        EventSubscription {
            stream: BroadcastStream::new(self.sender.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventSubscription<E> {
    stream: BroadcastStream<E>,
}

impl<E: Clone + Send + 'static> EventSubscription<E> {
    /// Next event, or `None` once the dispatcher is gone.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.stream.next().await? {
                Ok(event) => return Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; skipping missed events");
                }
            }
        }
    }
}

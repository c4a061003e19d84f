//! Merges messages from the three delivery paths (bulk fetch, own-send
//! confirmation, push events) into one duplicate-free sequence.
//!
//! Order is arrival order. Entries are never re-sorted by `created_at`; the
//! only positional rule is that a temporary entry promoted to its durable
//! counterpart keeps the slot it was appended into.

use shared::domain::{Message, TempMessageId, UserId};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOrigin {
    /// Optimistic placeholder appended by a local send.
    LocalAppend,
    Fetch,
    /// HTTP response of a send, naming the placeholder it confirms.
    OwnSendConfirm { temp_id: TempMessageId },
    PushInsert,
    PushUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// An entry with the same identity existed and was swapped in place.
    Replaced { index: usize },
    /// A pending placeholder was swapped for its durable counterpart.
    Promoted {
        index: usize,
        temp_id: TempMessageId,
    },
    Appended { index: usize },
}

impl Reconciled {
    pub fn index(&self) -> usize {
        match *self {
            Reconciled::Replaced { index }
            | Reconciled::Promoted { index, .. }
            | Reconciled::Appended { index } => index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageReconciler {
    local_user: UserId,
}

impl MessageReconciler {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn reconcile(
        &self,
        current: &mut Vec<Message>,
        incoming: Message,
        origin: ReconcileOrigin,
    ) -> Reconciled {
        if let Some(index) = position_of_same_identity(current, &incoming) {
            current[index] = incoming;
            let index = match origin {
                // The push path already promoted some placeholder; the one this
                // response names must not linger next to the durable entry.
                ReconcileOrigin::OwnSendConfirm { temp_id } => {
                    remove_temp_before(current, temp_id, index)
                }
                _ => index,
            };
            trace!(index, ?origin, "reconcile: replaced existing entry");
            return Reconciled::Replaced { index };
        }

        let promotable = match origin {
            ReconcileOrigin::OwnSendConfirm { temp_id } => current
                .iter()
                .position(|message| message.temp_id() == Some(temp_id))
                .map(|index| (index, temp_id)),
            ReconcileOrigin::PushInsert if incoming.sender_id == self.local_user => {
                current
                    .iter()
                    .enumerate()
                    .find_map(|(index, message)| match message.temp_id() {
                        Some(temp_id)
                            if message.is_pending_temporary()
                                && message.sender_id == incoming.sender_id
                                && message.content == incoming.content =>
                        {
                            Some((index, temp_id))
                        }
                        _ => None,
                    })
            }
            _ => None,
        };

        if let Some((index, temp_id)) = promotable {
            current[index] = incoming;
            trace!(index, %temp_id, ?origin, "reconcile: promoted placeholder");
            return Reconciled::Promoted { index, temp_id };
        }

        current.push(incoming);
        let index = current.len() - 1;
        trace!(index, ?origin, "reconcile: appended");
        Reconciled::Appended { index }
    }

    /// Rebuilds the sequence around a bulk fetch: the fetched list becomes the
    /// base, and local entries it does not cover (pending placeholders, pushes
    /// that raced the fetch) follow it in their existing relative order.
    pub fn rebase(&self, current: Vec<Message>, fetched: Vec<Message>) -> Vec<Message> {
        let mut merged = Vec::with_capacity(fetched.len() + current.len());
        for message in fetched {
            self.reconcile(&mut merged, message, ReconcileOrigin::Fetch);
        }
        for message in current {
            if position_of_same_identity(&merged, &message).is_some() {
                continue;
            }
            self.reconcile(&mut merged, message, ReconcileOrigin::LocalAppend);
        }
        merged
    }
}

/// Removes the placeholder with `temp_id`, if present. Returns what it removed.
pub fn remove_temporary(current: &mut Vec<Message>, temp_id: TempMessageId) -> Option<Message> {
    let index = current
        .iter()
        .position(|message| message.temp_id() == Some(temp_id))?;
    Some(current.remove(index))
}

fn position_of_same_identity(current: &[Message], incoming: &Message) -> Option<usize> {
    current.iter().position(|message| message.id == incoming.id)
}

fn remove_temp_before(current: &mut Vec<Message>, temp_id: TempMessageId, index: usize) -> usize {
    match current
        .iter()
        .position(|message| message.temp_id() == Some(temp_id))
    {
        Some(temp_index) => {
            current.remove(temp_index);
            if temp_index < index {
                index - 1
            } else {
                index
            }
        }
        None => index,
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;

//! Outgoing message queue with demand-driven delivery.
//!
//! Producers push through any clone of [`MessageQueue`]; pushes never block
//! and never reject until the queue is closed. The single consumer holds the
//! [`Subscription`] and pulls one message per unit of demand it has
//! requested, so nothing is delivered while it sleeps on the rate limit or
//! waits out a reconnect. Order is strict FIFO regardless of priority.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueError;

/// One outgoing chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: String,
    priority: bool,
    enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            priority: false,
            enqueued_at: Utc::now(),
        }
    }

    /// A control line exempt from the normal rate limit up to the ceiling.
    pub fn priority(content: impl Into<String>) -> Self {
        Self {
            priority: true,
            ..Self::new(content)
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn has_priority(&self) -> bool {
        self.priority
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

#[derive(Default)]
struct State {
    items: VecDeque<Message>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Producer side. Cheap to clone.
#[derive(Clone)]
pub struct MessageQueue {
    shared: Arc<Shared>,
}

impl MessageQueue {
    /// Create a queue and its only subscription.
    pub fn channel() -> (Self, Subscription) {
        let shared = Arc::new(Shared::default());
        let sub = Subscription {
            shared: shared.clone(),
            demand: 0,
        };
        (Self { shared }, sub)
    }

    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(message);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Queue a normal chat line.
    pub fn say(&self, text: impl Into<String>) -> Result<(), QueueError> {
        self.enqueue(Message::new(text))
    }

    /// Queue a priority chat line.
    pub fn say_priority(&self, text: impl Into<String>) -> Result<(), QueueError> {
        self.enqueue(Message::priority(text))
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Terminate the queue. Pending messages are discarded and the number
    /// discarded is returned; the subscription sees end-of-stream.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.shared.notify.notify_one();
        discarded
    }
}

/// Consumer side. Delivers at most as many messages as were requested.
pub struct Subscription {
    shared: Arc<Shared>,
    demand: usize,
}

impl Subscription {
    /// Signal readiness for `n` more messages.
    pub fn request(&mut self, n: usize) {
        self.demand = self.demand.saturating_add(n);
    }

    /// Outstanding demand not yet satisfied.
    pub fn demand(&self) -> usize {
        self.demand
    }

    /// Wait for the next message against outstanding demand.
    ///
    /// Returns `None` once the queue is closed. With no outstanding demand it
    /// also returns `None` immediately, without taking a message.
    pub async fn next(&mut self) -> Option<Message> {
        if self.demand == 0 {
            return None;
        }
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.items.pop_front() {
                    self.demand -= 1;
                    return Some(message);
                }
            }
            notified.await;
        }
    }
}

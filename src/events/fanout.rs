//! Non-blocking subscriber fan-out.
//!
//! Each subscriber owns a bounded `tokio::sync::mpsc` channel. The producer
//! uses `try_send`: a full channel drops the event for that subscriber only,
//! and back-pressure never reaches the producer. Delivery order per subscriber
//! matches append order.

use tokio::sync::mpsc::{self, error::TrySendError};

use super::chain::Event;

/// Producer-side handle to one subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Event>,
}

impl Subscriber {
    /// Subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer-side handle returned by `EventLog::subscribe`.
#[derive(Debug)]
pub struct Subscription {
    /// Id to pass to `EventLog::unsubscribe`.
    pub id: u64,
    /// Events sealed after subscribing.
    pub receiver: mpsc::Receiver<Event>,
}

/// Create a connected subscriber/subscription pair.
pub fn channel(id: u64, buffer: usize) -> (Subscriber, Subscription) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (Subscriber { id, sender }, Subscription { id, receiver })
}

/// Counts from one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Subscribers that accepted the event.
    pub delivered: usize,
    /// Subscribers whose buffer was full.
    pub dropped: usize,
    /// Subscribers whose receiver is gone.
    pub closed: usize,
}

/// Offer `event` to every subscriber without blocking.
pub fn broadcast(subscribers: &[Subscriber], event: &Event) -> FanoutStats {
    let mut stats = FanoutStats::default();
    for sub in subscribers {
        match sub.sender.try_send(event.clone()) {
            Ok(()) => stats.delivered += 1,
            Err(TrySendError::Full(_)) => {
                stats.dropped += 1;
                tracing::debug!(subscriber_id = sub.id, index = event.index, "subscriber full, event dropped");
            }
            Err(TrySendError::Closed(_)) => stats.closed += 1,
        }
    }
    stats
}

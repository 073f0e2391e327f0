//! Fan-out of the live mass feed to WebSocket consumers.
//!
//! The broadcast loop never waits on a consumer: every subscriber has a small
//! bounded queue, frames that do not fit are dropped for that subscriber only,
//! and a subscriber that keeps falling behind is evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tare_core::FeedFrame;
use tokio::sync::{RwLock, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::registry::BoardRegistry;
use crate::transport::Transport;

struct Subscriber {
    tx: mpsc::Sender<Utf8Bytes>,
    /// Consecutive frames that did not fit in the queue.
    dropped: u32,
}

/// A consumer's end of the feed. The receiver closes when the subscriber is
/// evicted.
pub struct Subscription {
    pub id: u64,
    pub frames: mpsc::Receiver<Utf8Bytes>,
}

pub struct FeedHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    count: AtomicUsize,
    client_buffer: usize,
    max_drops: u32,
}

impl FeedHub {
    pub fn new(client_buffer: usize, max_drops: u32) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
            client_buffer: client_buffer.max(1),
            max_drops: max_drops.max(1),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, frames) = mpsc::channel(self.client_buffer);

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, Subscriber { tx, dropped: 0 });
        self.count.store(subscribers.len(), Ordering::Relaxed);
        debug!(subscriber = id, total = subscribers.len(), "feed subscriber added");

        Subscription { id, frames }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(&id).is_some() {
            self.count.store(subscribers.len(), Ordering::Relaxed);
            debug!(subscriber = id, total = subscribers.len(), "feed subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Offer one frame to every subscriber. Returns how many accepted it.
    pub async fn publish(&self, frame: &FeedFrame) -> usize {
        let json = match serde_json::to_string(frame) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!(error = %e, "Failed to serialise feed frame");
                return 0;
            }
        };

        let mut subscribers = self.subscribers.write().await;
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, subscriber) in subscribers.iter_mut() {
            match subscriber.tx.try_send(json.clone()) {
                Ok(()) => {
                    subscriber.dropped = 0;
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.dropped += 1;
                    if subscriber.dropped >= self.max_drops {
                        warn!(
                            subscriber = id,
                            dropped = subscriber.dropped,
                            "Evicting slow feed consumer"
                        );
                        evicted.push(*id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*id),
            }
        }

        for id in evicted {
            subscribers.remove(&id);
        }
        self.count.store(subscribers.len(), Ordering::Relaxed);

        delivered
    }
}

/// Publish the registry's snapshot every `period` until cancelled.
#[instrument(name = "feed_loop", skip_all, fields(period_ms = period.as_millis() as u64))]
pub async fn run_feed_loop<T: Transport>(
    registry: BoardRegistry<T>,
    hub: Arc<FeedHub>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if hub.subscriber_count() == 0 {
                    continue;
                }
                let frame = FeedFrame::from_snapshot(registry.snapshot());
                hub.publish(&frame).await;
            }
        }
    }

    debug!("feed loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tare_core::BoardAddress;

    fn frame(total: f64) -> FeedFrame {
        FeedFrame::from_snapshot([(BoardAddress::from("AA"), total)])
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_frame() {
        let hub = FeedHub::new(4, 3);
        let mut a = hub.subscribe().await;
        let mut b = hub.subscribe().await;

        assert_eq!(hub.publish(&frame(12.5)).await, 2);

        let expected = r#"{"total":12.5,"boards":[{"addr":"AA","mass":12.5}]}"#;
        assert_eq!(a.frames.recv().await.unwrap().as_str(), expected);
        assert_eq!(b.frames.recv().await.unwrap().as_str(), expected);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_affecting_others() {
        let hub = FeedHub::new(1, 2);
        let mut fast = hub.subscribe().await;
        let mut slow = hub.subscribe().await;

        for i in 0..3 {
            hub.publish(&frame(f64::from(i))).await;
            fast.frames.recv().await.unwrap();
        }

        assert_eq!(hub.subscriber_count(), 1);
        // the one queued frame is still readable, then the queue closes
        assert!(slow.frames.recv().await.is_some());
        assert!(slow.frames.recv().await.is_none());

        assert_eq!(hub.publish(&frame(4.0)).await, 1);
        assert!(fast.frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let hub = FeedHub::new(4, 3);
        let sub = hub.subscribe().await;
        drop(sub);

        assert_eq!(hub.publish(&frame(1.0)).await, 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = FeedHub::new(4, 3);
        let sub = hub.subscribe().await;
        hub.unsubscribe(sub.id).await;
        hub.unsubscribe(sub.id).await;
        assert_eq!(hub.subscriber_count(), 0);
    }
}

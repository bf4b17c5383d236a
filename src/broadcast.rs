//! Per-job fan-out of status events.
//!
//! A [`StatusHub`] remembers the most recent event and broadcasts every new
//! one. Subscribing reads the remembered event and registers the receiver
//! under the same lock that `publish` takes, so a subscriber sees the latest
//! state first and then every later event, with no gap and no duplicate.

use std::sync::Mutex;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::types::StatusSnapshot;

/// What subscribers of a job receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Status(StatusSnapshot),
    /// Polling gave up; no further status will follow.
    Failed { message: String },
}

#[derive(Debug)]
pub struct StatusHub {
    latest: Mutex<MonitorEvent>,
    tx: broadcast::Sender<MonitorEvent>,
}

impl StatusHub {
    pub fn new(initial: StatusSnapshot, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: Mutex::new(MonitorEvent::Status(initial)),
            tx,
        }
    }

    pub fn publish(&self, event: MonitorEvent) {
        let mut latest = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        *latest = event.clone();
        // No receivers is fine; the event is still remembered.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> StatusSubscription {
        let latest = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        StatusSubscription {
            pending: Some(latest.clone()),
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of a job: the latest event, then live events until
/// the job's monitor finishes.
#[derive(Debug)]
pub struct StatusSubscription {
    pending: Option<MonitorEvent>,
    rx: broadcast::Receiver<MonitorEvent>,
}

impl StatusSubscription {
    /// `None` once the hub is gone and every buffered event was delivered.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status subscriber fell behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = MonitorEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(percent: u8) -> MonitorEvent {
        MonitorEvent::Status(StatusSnapshot::Progress { percent })
    }

    #[tokio::test]
    async fn late_subscriber_starts_from_latest() {
        let hub = StatusHub::new(StatusSnapshot::Progress { percent: 0 }, 8);
        hub.publish(progress(10));
        hub.publish(progress(40));

        let mut sub = hub.subscribe();
        hub.publish(progress(70));
        drop(hub);

        assert_eq!(sub.recv().await, Some(progress(40)));
        assert_eq!(sub.recv().await, Some(progress(70)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn subscribers_share_one_sequence() {
        let hub = StatusHub::new(StatusSnapshot::Progress { percent: 0 }, 8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(progress(50));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(progress(0)));
            assert_eq!(sub.recv().await, Some(progress(50)));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let hub = StatusHub::new(StatusSnapshot::Progress { percent: 0 }, 2);
        let mut sub = hub.subscribe();
        for p in 1..=5 {
            hub.publish(progress(p));
        }
        drop(hub);

        assert_eq!(sub.recv().await, Some(progress(0)));
        assert_eq!(sub.recv().await, Some(progress(4)));
        assert_eq!(sub.recv().await, Some(progress(5)));
        assert_eq!(sub.recv().await, None);
    }
}

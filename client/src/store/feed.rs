//! Coalesced change notifications for the local store.
//!
//! Every committed write is published here. Changes are held for one
//! coalescing window and collapsed per record, so a burst of writes to the
//! same record reaches subscribers as a single notification carrying the
//! final state.

use chartsync_engine::{ClinicalRecord, Origin, RecordId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Maximum distinct pending records before a forced flush.
const MAX_PENDING_CHANGES: usize = 1000;

/// Capacity of the subscriber channel.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// A committed change to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub record_id: RecordId,
    /// State after the change; `None` once purged
    pub record: Option<ClinicalRecord>,
    /// Origin of the last write in the window
    pub origin: Origin,
}

impl RecordChange {
    pub fn written(record: &ClinicalRecord, origin: Origin) -> Self {
        Self {
            record_id: record.id.clone(),
            record: Some(record.clone()),
            origin,
        }
    }

    pub fn purged(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: record_id.into(),
            record: None,
            origin: Origin::Purge,
        }
    }
}

enum FeedCommand {
    Change(RecordChange),
    Flush(oneshot::Sender<()>),
}

/// Handle to the change feed task.
#[derive(Clone)]
pub struct ChangeFeed {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
    updates: broadcast::Sender<RecordChange>,
}

impl ChangeFeed {
    /// Spawn the feed task. It stops once every handle is dropped.
    pub fn start(window: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let window = window.max(Duration::from_millis(1));

        tokio::spawn(run(window, cmd_rx, updates.clone()));

        Self { cmd_tx, updates }
    }

    pub fn publish(&self, change: RecordChange) {
        if self.cmd_tx.send(FeedCommand::Change(change)).is_err() {
            warn!("change feed stopped; notification dropped");
        }
    }

    pub fn publish_all(&self, changes: impl IntoIterator<Item = RecordChange>) {
        for change in changes {
            self.publish(change);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.updates.subscribe()
    }

    /// Deliver everything pending now.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(FeedCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run(
    window: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    updates: broadcast::Sender<RecordChange>,
) {
    let mut pending: BTreeMap<RecordId, RecordChange> = BTreeMap::new();
    // the window opens with the first change after a flush
    let mut deadline: Option<Instant> = None;

    loop {
        let window_closed = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(FeedCommand::Change(change)) => {
                    if pending.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    pending.insert(change.record_id.clone(), change);
                    if pending.len() >= MAX_PENDING_CHANGES {
                        warn!(count = pending.len(), "too many pending changes, flushing early");
                        flush(&mut pending, &updates);
                        deadline = None;
                    }
                }
                Some(FeedCommand::Flush(ack)) => {
                    flush(&mut pending, &updates);
                    deadline = None;
                    let _ = ack.send(());
                }
                None => {
                    flush(&mut pending, &updates);
                    break;
                }
            },
            _ = window_closed => {
                flush(&mut pending, &updates);
                deadline = None;
            }
        }
    }
    debug!("change feed stopped");
}

fn flush(pending: &mut BTreeMap<RecordId, RecordChange>, updates: &broadcast::Sender<RecordChange>) {
    if pending.is_empty() {
        return;
    }
    debug!(count = pending.len(), "flushing record changes");
    for (_, change) in std::mem::take(pending) {
        // no subscribers is fine
        let _ = updates.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(summary: &str) -> ClinicalRecord {
        let mut r = ClinicalRecord::new("p1", "u1", "Bed 1", 0, 0);
        r.clinical_summary = summary.into();
        r
    }

    #[tokio::test]
    async fn burst_collapses_to_final_state() {
        let feed = ChangeFeed::start(Duration::from_millis(20));
        let mut rx = feed.subscribe();

        for text in ["a", "ab", "abc"] {
            feed.publish(RecordChange::written(&record(text), Origin::Local));
        }
        feed.flush().await;

        let change = rx.recv().await.unwrap();
        assert_eq!(change.record.unwrap().clinical_summary, "abc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn distinct_records_each_notify() {
        let feed = ChangeFeed::start(Duration::from_millis(20));
        let mut rx = feed.subscribe();

        let mut other = record("x");
        other.id = "p2".into();
        feed.publish(RecordChange::written(&record("a"), Origin::Remote));
        feed.publish(RecordChange::written(&other, Origin::Local));
        feed.publish(RecordChange::purged("p3"));

        let mut ids = vec![
            rx.recv().await.unwrap().record_id,
            rx.recv().await.unwrap().record_id,
            rx.recv().await.unwrap().record_id,
        ];
        ids.sort();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn last_origin_wins() {
        let feed = ChangeFeed::start(Duration::from_millis(20));
        let mut rx = feed.subscribe();

        feed.publish(RecordChange::written(&record("a"), Origin::Local));
        feed.publish(RecordChange::written(&record("b"), Origin::Remote));
        feed.flush().await;

        assert_eq!(rx.recv().await.unwrap().origin, Origin::Remote);
    }
}

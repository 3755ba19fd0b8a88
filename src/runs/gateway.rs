//! Replay-then-live event streams for a single client.
//!
//! The broker subscription is taken before the store replay starts. It
//! carries every event the store had not made durable at that moment plus
//! everything produced afterwards, so the seam between stored and live
//! events is closed by skipping live events whose sequence number was
//! already replayed. A gap in the replay marks an event whose write failed;
//! the replay stops there and the subscription supplies the rest in order.

use super::broker::{BrokerMessage, RunBroker, Terminal};
use super::store::EventStore;
use crate::domain::runs::{DisconnectPolicy, Run, RunStatus};
use crate::persistence::PersistenceLayer;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

pub type RunStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>;

/// Applies the disconnect policy if the stream is dropped before its
/// terminal sentinel was delivered.
#[derive(Debug)]
struct DisconnectGuard {
    broker: RunBroker,
    run_id: String,
    policy: DisconnectPolicy,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.policy {
            DisconnectPolicy::Cancel => {
                tracing::info!(run_id = %self.run_id, "client disconnected; cancelling run");
                self.broker.cancel_run(&self.run_id);
            }
            DisconnectPolicy::Continue => {
                tracing::debug!(run_id = %self.run_id, "client disconnected; run continues");
            }
        }
    }
}

/// Sentinel for a run that has no live channel in this process.
pub fn terminal_for(run: &Run) -> Terminal {
    match run.status {
        RunStatus::Completed | RunStatus::Interrupted => Terminal::Done,
        RunStatus::Cancelled => Terminal::Cancelled,
        RunStatus::Failed => Terminal::Error(
            run.error_message
                .clone()
                .unwrap_or_else(|| "run failed".to_string()),
        ),
        RunStatus::Pending | RunStatus::Running => {
            Terminal::Error("run is not executing in this process".to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingGateway {
    db: Arc<dyn PersistenceLayer>,
    store: EventStore,
    broker: RunBroker,
}

impl StreamingGateway {
    pub fn new(db: Arc<dyn PersistenceLayer>, store: EventStore, broker: RunBroker) -> Self {
        Self { db, store, broker }
    }

    /// Events of `run` with `seq > after`: stored ones first, then live ones,
    /// then exactly one terminal sentinel.
    pub fn open(&self, run: &Run, after: u64, policy: DisconnectPolicy) -> RunStream {
        let run_id = run.run_id.clone();
        // attach before replaying so nothing produced meanwhile is missed
        let subscription = self.broker.subscribe_existing(&run_id);
        let replay = self.store.replay(&run_id, after);
        let db = Arc::clone(&self.db);
        let mut guard = DisconnectGuard {
            broker: self.broker.clone(),
            run_id: run_id.clone(),
            policy,
            finished: false,
        };

        Box::pin(async_stream::stream! {
            let mut last = after;
            let live = subscription.as_ref().is_some_and(|s| s.covers_unstored());
            futures::pin_mut!(replay);
            while let Some(item) = replay.next().await {
                match item {
                    Ok(record) if live && record.seq != last + 1 => {
                        tracing::debug!(
                            run_id = %run_id,
                            expected = last + 1,
                            found = record.seq,
                            "gap in stored events; continuing from the live channel"
                        );
                        break;
                    }
                    Ok(record) => {
                        last = record.seq;
                        yield BrokerMessage::Event(Arc::new(record));
                    }
                    Err(err) => {
                        tracing::error!(run_id = %run_id, error = %err, "event replay failed");
                        guard.finished = true;
                        yield BrokerMessage::End(Terminal::Error("event replay failed".to_string()));
                        return;
                    }
                }
            }

            match subscription {
                Some(mut subscription) => {
                    while let Some(message) = subscription.recv().await {
                        match message {
                            BrokerMessage::Event(record) if record.seq <= last => {}
                            BrokerMessage::Event(record) => {
                                last = record.seq;
                                yield BrokerMessage::Event(record);
                            }
                            BrokerMessage::End(terminal) => {
                                guard.finished = true;
                                yield BrokerMessage::End(terminal);
                            }
                        }
                    }
                }
                None => {
                    let terminal = match db.get_run(&run_id).await {
                        Ok(Some(run)) => terminal_for(&run),
                        Ok(None) => Terminal::Error("run not found".to_string()),
                        Err(err) => {
                            tracing::error!(run_id = %run_id, error = %err, "failed to load run status");
                            Terminal::Error("run status unavailable".to_string())
                        }
                    };
                    guard.finished = true;
                    yield BrokerMessage::End(terminal);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{EventRecord, RunEvent, StreamMode};
    use crate::domain::threads::{Thread, ThreadStatus};
    use crate::persistence::providers::memory::MemoryProvider;
    use crate::runs::retry::RetryPolicy;
    use chrono::Utc;
    use serde_json::json;

    fn record(seq: u64) -> EventRecord {
        EventRecord::new(
            "r",
            seq,
            RunEvent {
                mode: StreamMode::Values,
                data: json!({ "n": seq }),
            },
        )
    }

    async fn setup(status: RunStatus) -> (StreamingGateway, Arc<MemoryProvider>, RunBroker, Run) {
        let db = Arc::new(MemoryProvider::new());
        db.create_thread(&Thread {
            thread_id: "t".into(),
            user_id: "u".into(),
            assistant_id: None,
            status: ThreadStatus::Idle,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        let run = Run {
            run_id: "r".into(),
            thread_id: "t".into(),
            assistant_id: "a".into(),
            user_id: "u".into(),
            status,
            input: json!({}),
            config: json!({}),
            context: json!({}),
            output: None,
            error_message: Some("model unavailable".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.create_run(&run).await.unwrap();
        let dyn_db = Arc::clone(&db) as Arc<dyn PersistenceLayer>;
        let broker = RunBroker::default();
        let store = EventStore::new(Arc::clone(&dyn_db), RetryPolicy::default(), 2);
        (StreamingGateway::new(dyn_db, store, broker.clone()), db, broker, run)
    }

    fn seqs(messages: &[BrokerMessage]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| match m {
                BrokerMessage::Event(e) => Some(e.seq),
                BrokerMessage::End(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stored_then_live_without_duplicates() {
        let (gateway, db, broker, run) = setup(RunStatus::Running).await;
        broker.open("r");
        // events 1..=3 are both durable and in the broker backlog
        for seq in 1..=3 {
            broker.put_to_broker(record(seq));
            db.append_event(&record(seq)).await.unwrap();
        }
        let stream = gateway.open(&run, 0, DisconnectPolicy::Continue);
        for seq in 4..=5 {
            broker.put_to_broker(record(seq));
            db.append_event(&record(seq)).await.unwrap();
        }
        broker.cleanup_run("r");

        let messages: Vec<BrokerMessage> = stream.collect().await;
        assert_eq!(seqs(&messages), vec![1, 2, 3, 4, 5]);
        assert_eq!(messages.last(), Some(&BrokerMessage::End(Terminal::Done)));
    }

    #[tokio::test]
    async fn test_unstored_event_is_delivered_in_order() {
        let (gateway, db, broker, run) = setup(RunStatus::Running).await;
        broker.open("r");
        for seq in 1..=4 {
            broker.put_to_broker(record(seq));
            // the write of event 3 failed
            if seq != 3 {
                db.append_event(&record(seq)).await.unwrap();
                broker.mark_stored("r", seq);
            }
        }
        let stream = gateway.open(&run, 0, DisconnectPolicy::Continue);
        broker.put_to_broker(record(5));
        broker.cleanup_run("r");

        let messages: Vec<BrokerMessage> = stream.collect().await;
        assert_eq!(seqs(&messages), vec![1, 2, 3, 4, 5]);
        assert_eq!(messages.last(), Some(&BrokerMessage::End(Terminal::Done)));
    }

    #[tokio::test]
    async fn test_gap_after_cleanup_is_replayed_as_stored() {
        let (gateway, db, broker, run) = setup(RunStatus::Completed).await;
        broker.open("r");
        for seq in [1, 2, 4] {
            db.append_event(&record(seq)).await.unwrap();
        }
        broker.cleanup_run("r");

        let messages: Vec<BrokerMessage> = gateway.open(&run, 0, DisconnectPolicy::Continue).collect().await;
        assert_eq!(seqs(&messages), vec![1, 2, 4]);
        assert_eq!(messages.last(), Some(&BrokerMessage::End(Terminal::Done)));
    }

    #[tokio::test]
    async fn test_resume_offset_skips_seen_events() {
        let (gateway, db, broker, run) = setup(RunStatus::Running).await;
        broker.open("r");
        for seq in 1..=4 {
            broker.put_to_broker(record(seq));
            db.append_event(&record(seq)).await.unwrap();
        }
        let stream = gateway.open(&run, 2, DisconnectPolicy::Continue);
        broker.cleanup_run("r");

        let messages: Vec<BrokerMessage> = stream.collect().await;
        assert_eq!(seqs(&messages), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_finished_run_without_channel_ends_with_stored_status() {
        let (gateway, db, _broker, run) = setup(RunStatus::Failed).await;
        db.append_event(&record(1)).await.unwrap();

        let messages: Vec<BrokerMessage> = gateway.open(&run, 0, DisconnectPolicy::Continue).collect().await;
        assert_eq!(seqs(&messages), vec![1]);
        assert_eq!(
            messages.last(),
            Some(&BrokerMessage::End(Terminal::Error("model unavailable".into())))
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_applies_disconnect_policy() {
        let (gateway, _db, broker, run) = setup(RunStatus::Running).await;
        let control = broker.open("r");

        let stream = gateway.open(&run, 0, DisconnectPolicy::Continue);
        drop(stream);
        assert!(!control.cancel.is_cancelled());

        let mut stream = gateway.open(&run, 0, DisconnectPolicy::Cancel);
        broker.put_to_broker(record(1));
        assert!(matches!(stream.next().await, Some(BrokerMessage::Event(_))));
        drop(stream);
        assert!(control.cancel.is_cancelled());
        assert_eq!(broker.subscriber_count("r"), 0);
    }
}

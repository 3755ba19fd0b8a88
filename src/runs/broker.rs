//! In-memory fan-out of live run events.
//!
//! Each run gets a channel holding its attached subscriber queues, a backlog
//! of the events not yet known to be durable, the terminal sentinel once one
//! is known, and the cooperative control tokens of the run. Backlog append
//! and fan-out happen under the same lock as subscription, so a new
//! subscriber sees every backlog and live event exactly once and in
//! production order.
//!
//! The backlog is trimmed up to the highest sequence number below which every
//! event has been stored. Anything older is served by the store replay. An
//! event whose write failed holds the watermark back, so it and everything
//! after it stay in the backlog until the channel is cleaned up.
//!
//! Channels are removed by [`RunBroker::cleanup_run`]. A bounded set of
//! tombstones remembers how recently removed runs ended so late subscribers
//! get the terminal sentinel instead of hanging.

use crate::domain::events::EventRecord;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a run's live channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Cancelled,
    Error(String),
}

/// One item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMessage {
    Event(Arc<EventRecord>),
    End(Terminal),
}

/// Cooperative control signals of a run. `cancel` is observed by the
/// executor, `interrupt` by the agent runtime at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub interrupt: CancellationToken,
}

#[derive(Debug, Default)]
struct Channel {
    subscribers: HashMap<u64, mpsc::UnboundedSender<BrokerMessage>>,
    backlog: VecDeque<Arc<EventRecord>>,
    stored_through: u64,
    terminal: Option<Terminal>,
    control: RunControl,
}

impl Channel {
    fn finish(&mut self, terminal: Terminal) -> bool {
        if self.terminal.is_some() {
            return false;
        }
        for tx in self.subscribers.values() {
            // a closed receiver just means the subscriber went away
            let _ = tx.send(BrokerMessage::End(terminal.clone()));
        }
        self.subscribers.clear();
        self.terminal = Some(terminal);
        true
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    channels: HashMap<String, Channel>,
    tombstones: HashMap<String, Terminal>,
    tombstone_order: VecDeque<String>,
    next_subscriber: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    tombstone_capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide registry of per-run broadcast channels.
#[derive(Debug, Clone)]
pub struct RunBroker {
    shared: Arc<Shared>,
}

impl Default for RunBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl RunBroker {
    pub fn new(tombstone_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                tombstone_capacity: tombstone_capacity.max(1),
            }),
        }
    }

    /// Ensure a channel exists for `run_id` and return its control signals.
    pub fn open(&self, run_id: &str) -> RunControl {
        let mut state = self.shared.lock();
        state.tombstones.remove(run_id);
        state
            .channels
            .entry(run_id.to_string())
            .or_default()
            .control
            .clone()
    }

    /// Deliver an event to every attached subscriber and the channel backlog.
    /// Never blocks on subscribers.
    pub fn put_to_broker(&self, record: EventRecord) {
        let mut state = self.shared.lock();
        if state.tombstones.contains_key(&record.run_id) {
            tracing::warn!(
                run_id = %record.run_id,
                event_id = %record.event_id,
                "dropping event for a run whose channel was already cleaned up"
            );
            return;
        }
        let channel = state.channels.entry(record.run_id.clone()).or_default();
        if channel.terminal.is_some() {
            tracing::warn!(
                run_id = %record.run_id,
                event_id = %record.event_id,
                "dropping event produced after the run's terminal signal"
            );
            return;
        }

        let record = Arc::new(record);
        channel
            .subscribers
            .retain(|_, tx| tx.send(BrokerMessage::Event(Arc::clone(&record))).is_ok());
        channel.backlog.push_back(record);
    }

    /// Record that `seq` of `run_id` was made durable. Advances the stored
    /// watermark when `seq` directly follows it and drops the backlog prefix
    /// the store now covers.
    pub fn mark_stored(&self, run_id: &str, seq: u64) {
        let mut state = self.shared.lock();
        let Some(channel) = state.channels.get_mut(run_id) else {
            return;
        };
        if seq != channel.stored_through + 1 {
            return;
        }
        channel.stored_through = seq;
        while channel
            .backlog
            .front()
            .is_some_and(|record| record.seq <= channel.stored_through)
        {
            channel.backlog.pop_front();
        }
    }

    /// Attach to a run, creating its channel if needed. The subscription yields
    /// the not-yet-durable backlog, then live events, then exactly one
    /// terminal sentinel.
    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let mut state = self.shared.lock();
        if let Some(subscription) = self.attach_existing(&mut state, run_id) {
            return subscription;
        }
        state.channels.entry(run_id.to_string()).or_default();
        self.attach_existing(&mut state, run_id)
            .unwrap_or_else(|| Subscription::finished(self, run_id, Terminal::Done))
    }

    /// Attach only if a live channel or tombstone exists for `run_id`.
    pub fn subscribe_existing(&self, run_id: &str) -> Option<Subscription> {
        let mut state = self.shared.lock();
        self.attach_existing(&mut state, run_id)
    }

    fn attach_existing(&self, state: &mut BrokerState, run_id: &str) -> Option<Subscription> {
        if let Some(terminal) = state.tombstones.get(run_id) {
            return Some(Subscription::finished(self, run_id, terminal.clone()));
        }

        let id = state.next_subscriber;
        let channel = state.channels.get_mut(run_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for record in &channel.backlog {
            let _ = tx.send(BrokerMessage::Event(Arc::clone(record)));
        }
        match &channel.terminal {
            Some(terminal) => {
                let _ = tx.send(BrokerMessage::End(terminal.clone()));
            }
            None => {
                channel.subscribers.insert(id, tx);
            }
        }
        state.next_subscriber += 1;

        Some(Subscription {
            broker: Arc::clone(&self.shared),
            run_id: run_id.to_string(),
            id,
            rx,
            ended: false,
            attached: true,
        })
    }

    /// Mark the run cancelled for every subscriber. First terminal signal wins.
    pub fn signal_run_cancelled(&self, run_id: &str) -> bool {
        self.signal(run_id, Terminal::Cancelled)
    }

    /// Mark the run failed for every subscriber. First terminal signal wins.
    pub fn signal_run_error(&self, run_id: &str, message: impl Into<String>) -> bool {
        self.signal(run_id, Terminal::Error(message.into()))
    }

    fn signal(&self, run_id: &str, terminal: Terminal) -> bool {
        let mut state = self.shared.lock();
        if state.tombstones.contains_key(run_id) {
            return false;
        }
        let signalled = state
            .channels
            .entry(run_id.to_string())
            .or_default()
            .finish(terminal.clone());
        if signalled {
            tracing::debug!(run_id, terminal = ?terminal, "broker terminal signal");
        }
        signalled
    }

    /// Request cooperative cancellation. Returns whether a live channel exists.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        self.with_control(run_id, |control| control.cancel.cancel())
    }

    /// Ask the agent runtime to pause at its next checkpoint. Returns whether
    /// a live channel exists.
    pub fn interrupt_run(&self, run_id: &str) -> bool {
        self.with_control(run_id, |control| control.interrupt.cancel())
    }

    fn with_control(&self, run_id: &str, f: impl FnOnce(&RunControl)) -> bool {
        let state = self.shared.lock();
        match state.channels.get(run_id) {
            Some(channel) => {
                f(&channel.control);
                true
            }
            None => false,
        }
    }

    /// Tear down the run's channel. Subscribers that have not seen a terminal
    /// sentinel get `Done`; already-queued events stay readable. Idempotent.
    pub fn cleanup_run(&self, run_id: &str) {
        let mut state = self.shared.lock();
        let Some(mut channel) = state.channels.remove(run_id) else {
            return;
        };
        channel.finish(Terminal::Done);
        let terminal = channel.terminal.take().unwrap_or(Terminal::Done);

        if state.tombstones.insert(run_id.to_string(), terminal).is_none() {
            state.tombstone_order.push_back(run_id.to_string());
        }
        while state.tombstone_order.len() > self.shared.tombstone_capacity {
            if let Some(evicted) = state.tombstone_order.pop_front() {
                state.tombstones.remove(&evicted);
            }
        }
        tracing::debug!(run_id, "broker channel cleaned up");
    }

    pub fn has_channel(&self, run_id: &str) -> bool {
        self.shared.lock().channels.contains_key(run_id)
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.shared
            .lock()
            .channels
            .get(run_id)
            .map_or(0, |c| c.subscribers.len())
    }
}

/// A scoped attachment to a run's channel. Dropping it detaches.
#[derive(Debug)]
pub struct Subscription {
    broker: Arc<Shared>,
    run_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    ended: bool,
    attached: bool,
}

impl Subscription {
    fn finished(broker: &RunBroker, run_id: &str, terminal: Terminal) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(BrokerMessage::End(terminal));
        Self {
            broker: Arc::clone(&broker.shared),
            run_id: run_id.to_string(),
            id: u64::MAX,
            rx,
            ended: false,
            attached: false,
        }
    }

    /// Whether this subscription is attached to a channel, and so carries
    /// every event the store had not made durable when it attached. A
    /// subscription built from a tombstone only carries the sentinel.
    pub fn covers_unstored(&self) -> bool {
        self.attached
    }

    /// Next message, or `None` after the terminal sentinel was delivered.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        futures::future::poll_fn(|cx| self.poll_message(cx)).await
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Option<BrokerMessage>> {
        if self.ended {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                if matches!(message, BrokerMessage::End(_)) {
                    self.ended = true;
                }
                Poll::Ready(Some(message))
            }
            // sender dropped without a sentinel: the channel is gone
            Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(Some(BrokerMessage::End(Terminal::Done)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for Subscription {
    type Item = BrokerMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_message(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        if let Some(channel) = state.channels.get_mut(&self.run_id) {
            channel.subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{RunEvent, StreamMode};
    use futures::StreamExt;
    use serde_json::json;

    fn record(run_id: &str, seq: u64) -> EventRecord {
        EventRecord::new(
            run_id,
            seq,
            RunEvent {
                mode: StreamMode::Values,
                data: json!({ "n": seq }),
            },
        )
    }

    async fn drain(sub: Subscription) -> (Vec<u64>, Terminal) {
        let messages: Vec<BrokerMessage> = sub.collect().await;
        let mut seqs = Vec::new();
        let mut terminal = None;
        for message in messages {
            match message {
                BrokerMessage::Event(e) => seqs.push(e.seq),
                BrokerMessage::End(t) => {
                    assert!(terminal.is_none(), "more than one terminal sentinel");
                    terminal = Some(t);
                }
            }
        }
        (seqs, terminal.unwrap())
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog_then_live() {
        let broker = RunBroker::default();
        broker.open("r");
        broker.put_to_broker(record("r", 1));
        broker.put_to_broker(record("r", 2));

        let sub = broker.subscribe("r");
        broker.put_to_broker(record("r", 3));
        broker.cleanup_run("r");

        assert_eq!(drain(sub).await, (vec![1, 2, 3], Terminal::Done));
    }

    #[tokio::test]
    async fn test_stored_prefix_leaves_the_backlog() {
        let broker = RunBroker::default();
        broker.open("r");
        for seq in 1..=3 {
            broker.put_to_broker(record("r", seq));
        }
        broker.mark_stored("r", 1);
        broker.mark_stored("r", 2);
        let sub = broker.subscribe("r");
        broker.cleanup_run("r");
        assert_eq!(drain(sub).await, (vec![3], Terminal::Done));
    }

    #[tokio::test]
    async fn test_failed_write_holds_back_trimming() {
        let broker = RunBroker::default();
        broker.open("r");
        for seq in 1..=4 {
            broker.put_to_broker(record("r", seq));
        }
        // seq 2 never became durable
        broker.mark_stored("r", 1);
        broker.mark_stored("r", 3);
        broker.mark_stored("r", 4);
        let sub = broker.subscribe("r");
        assert!(sub.covers_unstored());
        broker.cleanup_run("r");
        assert_eq!(drain(sub).await, (vec![2, 3, 4], Terminal::Done));

        let late = broker.subscribe("r");
        assert!(!late.covers_unstored());
    }

    #[tokio::test]
    async fn test_first_terminal_wins() {
        let broker = RunBroker::default();
        let sub = broker.subscribe("r");
        assert!(broker.signal_run_error("r", "boom"));
        assert!(!broker.signal_run_cancelled("r"));
        broker.cleanup_run("r");

        assert_eq!(drain(sub).await, (vec![], Terminal::Error("boom".into())));
    }

    #[tokio::test]
    async fn test_subscribe_after_cleanup_ends_immediately() {
        let broker = RunBroker::default();
        broker.open("r");
        broker.signal_run_cancelled("r");
        broker.cleanup_run("r");
        broker.cleanup_run("r");

        let sub = broker.subscribe("r");
        assert_eq!(drain(sub).await, (vec![], Terminal::Cancelled));
        assert!(!broker.has_channel("r"));
        assert!(broker.subscribe_existing("never-ran").is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_detaches() {
        let broker = RunBroker::default();
        broker.open("r");
        let a = broker.subscribe("r");
        let b = broker.subscribe("r");
        assert_eq!(broker.subscriber_count("r"), 2);
        drop(a);
        assert_eq!(broker.subscriber_count("r"), 1);
        drop(b);
        assert_eq!(broker.subscriber_count("r"), 0);
    }

    #[tokio::test]
    async fn test_control_signals_reach_tokens() {
        let broker = RunBroker::default();
        let control = broker.open("r");
        assert!(broker.interrupt_run("r"));
        assert!(control.interrupt.is_cancelled());
        assert!(!control.cancel.is_cancelled());
        assert!(broker.cancel_run("r"));
        assert!(control.cancel.is_cancelled());
        assert!(!broker.cancel_run("other"));
    }

    #[tokio::test]
    async fn test_tombstones_are_bounded() {
        let broker = RunBroker::new(2);
        for id in ["a", "b", "c"] {
            broker.open(id);
            broker.cleanup_run(id);
        }
        assert!(broker.subscribe_existing("a").is_none());
        assert!(broker.subscribe_existing("c").is_some());
    }
}

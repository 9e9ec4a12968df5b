//! Event bus: fans agent run telemetry out to every subscriber.
//!
//! Listeners registered with `on_agent_event` are called synchronously, in
//! registration order, for every event of every run. They are the lossless
//! path; the trace recorder hangs off one. Async consumers can `subscribe` to
//! a tokio broadcast channel instead, which drops events for receivers that
//! fall behind rather than blocking the producer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use bat_types::trace::{now_ms, AgentEvent, NewAgentEvent};

use crate::registry::RunRegistry;

const BUS_CAPACITY: usize = 256;

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;
type ListenerList = RwLock<Vec<(u64, Listener)>>;

#[derive(Clone)]
pub struct EventBus {
    runs: Arc<RunRegistry>,
    listeners: Arc<ListenerList>,
    next_listener_id: Arc<AtomicU64>,
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(runs: Arc<RunRegistry>) -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            runs,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
            sender,
        }
    }

    /// The registry this bus stamps sequence numbers and session keys from.
    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Subscribe to receive future events asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// Register a listener for every subsequent event.
    pub fn on_agent_event<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        self.listeners.write().unwrap().push((id, listener));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Stamp `seq`, `ts` and the session key onto an event and deliver it.
    ///
    /// Returns the delivered record, or `None` if the event was dropped.
    pub fn emit_agent_event(&self, event: NewAgentEvent) -> Option<AgentEvent> {
        if event.run_id.trim().is_empty() {
            warn!(stream = %event.payload.stream(), "Dropping agent event without a run id");
            return None;
        }

        let session_key = event.session_key.or_else(|| {
            self.runs
                .get_agent_run_context(&event.run_id)
                .map(|ctx| ctx.session_key)
        });
        let seq = self.runs.next_seq(&event.run_id);
        let record = AgentEvent {
            run_id: event.run_id,
            seq,
            ts: now_ms(),
            session_key,
            payload: event.payload,
        };

        self.deliver(&record);
        Some(record)
    }

    /// Emit a wire frame (`{runId, sessionKey?, stream, data}`) from an
    /// out-of-process producer. Malformed frames are logged and dropped.
    pub fn emit_json(&self, frame: Value) -> Option<AgentEvent> {
        match serde_json::from_value::<NewAgentEvent>(frame) {
            Ok(event) => self.emit_agent_event(event),
            Err(e) => {
                warn!("Dropping malformed agent event: {}", e);
                None
            }
        }
    }

    fn deliver(&self, event: &AgentEvent) {
        // Snapshot so listeners can (un)subscribe from inside a callback.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    run_id = %event.run_id,
                    seq = event.seq,
                    "Agent event listener panicked"
                );
            }
        }

        // No async subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

/// Returned by [`EventBus::on_agent_event`]. Dropping the handle leaves the
/// listener registered.
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl ListenerHandle {
    /// Remove the listener. Other listeners and sequence state are untouched.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

//! Event bus — sequenced fan-out of agent events with per-run replay.
//!
//! One logical process-wide bus with per-run sub-buses. `emit` assigns a
//! strictly monotonic `seq` per run under the sub-bus lock, appends to a
//! bounded replay buffer, and delivers to run listeners and session
//! listeners. Listeners are channel senders: a closed receiver is
//! dropped, never blocks the emitter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use fm_domain::event::AgentEvent;
use fm_domain::{Error, Result};

/// Replay buffer bound per active run.
const BUFFER_CAP: usize = 10_000;

/// Handle returned by listener registration; used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct RunBusInner {
    next_seq: u64,
    buffer: VecDeque<AgentEvent>,
    listeners: Vec<(ListenerId, mpsc::UnboundedSender<AgentEvent>)>,
}

struct RunBus {
    inner: Mutex<RunBusInner>,
}

impl RunBus {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RunBusInner {
                next_seq: 1,
                buffer: VecDeque::new(),
                listeners: Vec::new(),
            }),
        }
    }
}

/// Session listeners receive `(run_id, event)` pairs: the envelope
/// itself does not carry the run id, and turn assembly needs it.
type SessionSender = mpsc::UnboundedSender<(String, AgentEvent)>;

pub struct EventBus {
    runs: RwLock<HashMap<String, Arc<RunBus>>>,
    session_listeners: RwLock<HashMap<String, Vec<(ListenerId, SessionSender)>>>,
    next_listener_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            session_listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn run_bus(&self, run_id: &str) -> Arc<RunBus> {
        if let Some(bus) = self.runs.read().get(run_id) {
            return bus.clone();
        }
        self.runs
            .write()
            .entry(run_id.to_owned())
            .or_insert_with(|| Arc::new(RunBus::new()))
            .clone()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Emit an event into a run's stream. Assigns the sequence number;
    /// re-emitting an already-sequenced event is a programming error.
    /// Returns the assigned seq.
    pub fn emit(&self, run_id: &str, mut event: AgentEvent) -> Result<u64> {
        if event.seq != 0 {
            debug_assert!(false, "event re-emitted with seq {}", event.seq);
            return Err(Error::Other(format!(
                "event already emitted with seq {}",
                event.seq
            )));
        }

        let bus = self.run_bus(run_id);
        let seq = {
            let mut inner = bus.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            event.seq = seq;

            inner.buffer.push_back(event.clone());
            if inner.buffer.len() > BUFFER_CAP {
                inner.buffer.pop_front();
            }

            // Fan out to run listeners, dropping closed channels.
            inner.listeners.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            seq
        };

        // Session fan-out outside the run lock.
        if let Some(session_id) = event.session_id.clone() {
            let mut listeners = self.session_listeners.write();
            if let Some(subs) = listeners.get_mut(&session_id) {
                subs.retain(|(_, tx)| tx.send((run_id.to_owned(), event.clone())).is_ok());
            }
        }

        Ok(seq)
    }

    /// Register a run listener. The receiver gets every event emitted
    /// after registration, in order.
    pub fn add_listener(&self, run_id: &str) -> (ListenerId, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        let bus = self.run_bus(run_id);
        bus.inner.lock().listeners.push((id, tx));
        (id, rx)
    }

    /// Atomically snapshot the replay buffer and register a live
    /// listener, so a late subscriber sees every event exactly once.
    pub fn subscribe_with_replay(
        &self,
        run_id: &str,
    ) -> (Vec<AgentEvent>, ListenerId, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        let bus = self.run_bus(run_id);
        let mut inner = bus.inner.lock();
        let replay: Vec<AgentEvent> = inner.buffer.iter().cloned().collect();
        inner.listeners.push((id, tx));
        (replay, id, rx)
    }

    /// Register a session listener receiving `(run_id, event)` across
    /// all of the session's runs.
    pub fn add_session_listener(
        &self,
        session_id: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<(String, AgentEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        self.session_listeners
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    /// Snapshot of the replay buffer.
    pub fn buffer(&self, run_id: &str) -> Vec<AgentEvent> {
        let bus = self.run_bus(run_id);
        let inner = bus.inner.lock();
        inner.buffer.iter().cloned().collect()
    }

    /// Idempotent.
    pub fn remove_listener(&self, run_id: &str, listener: ListenerId) {
        if let Some(bus) = self.runs.read().get(run_id) {
            bus.inner.lock().listeners.retain(|(id, _)| *id != listener);
        }
    }

    /// Idempotent.
    pub fn remove_session_listener(&self, session_id: &str, listener: ListenerId) {
        let mut listeners = self.session_listeners.write();
        if let Some(subs) = listeners.get_mut(session_id) {
            subs.retain(|(id, _)| *id != listener);
            if subs.is_empty() {
                listeners.remove(session_id);
            }
        }
    }

    /// Drop a run's sub-bus (terminal runs after the buffer is drained).
    pub fn drop_run(&self, run_id: &str) {
        self.runs.write().remove(run_id);
    }

    /// Test hook: forget everything.
    pub fn reset(&self) {
        self.runs.write().clear();
        self.session_listeners.write().clear();
    }
}

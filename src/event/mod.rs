//! Non-realtime event bus.
//!
//! Every command entering the core travels as an [`Event`]: a closed
//! kind tag, a bag of named parameters, and a one-shot completion the
//! poster blocks on. A single worker thread dispatches each event to
//! every registered handler in registration order, then completes the
//! event itself so posters never hang on an unrecognized kind.

use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::block::{BlockId, Device, Thread};
use crate::connector::{BlockInfo, Connection};
use crate::error::RecvError;
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
use crate::utils::CancelToken;

/// Closed set of event kinds consumed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Change the RT period. Param `"period"`: i64 nanoseconds.
    PeriodChange,
    /// Query the RT period. Response param `"period"`: i64 nanoseconds.
    GetPeriod,
    /// Register a compute block. Param `"thread"`: boxed block; moved
    /// into the RT side on success.
    ThreadInsert,
    /// Deregister a compute block. Param `"block"`: id; the boxed block
    /// comes back in response param `"thread"`.
    ThreadRemove,
    /// Register a device. Param `"device"`: boxed device.
    DeviceInsert,
    /// Deregister a device. Param `"block"`: id; response `"device"`.
    DeviceRemove,
    /// Deactivate a compute block. Param `"block"`: id.
    ThreadPause,
    /// Activate a compute block. Param `"block"`: id.
    ThreadUnpause,
    /// Deactivate a device. Param `"block"`: id.
    DevicePause,
    /// Activate a device. Param `"block"`: id.
    DeviceUnpause,
    /// Wire two ports. Param `"connection"`; on rejection the response
    /// param `"error"` carries the reason and nothing reaches the RT side.
    LinkInsert,
    /// Unwire two ports. Param `"connection"`.
    LinkRemove,
    /// List registered blocks. Response param `"blockList"`.
    BlockQuery,
    /// List every connection. Response param `"connections"`.
    ConnectionQuery,
    /// Stop the RT loop. Later RT-affecting events complete with no effect.
    Shutdown,
    /// No operation; still round-trips through the RT loop.
    Noop,
}

/// Tagged parameter value. The closed set mirrors what event posters
/// and the RT system actually exchange.
pub enum Param {
    I64(i64),
    F64(f64),
    Str(String),
    Block(BlockId),
    Device(Box<dyn Device>),
    Thread(Box<dyn Thread>),
    Connection(Connection),
    Blocks(Vec<BlockInfo>),
    Connections(Vec<Connection>),
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::I64(v) => write!(f, "I64({v})"),
            Param::F64(v) => write!(f, "F64({v})"),
            Param::Str(v) => write!(f, "Str({v:?})"),
            Param::Block(v) => write!(f, "Block({})", v.0),
            Param::Device(d) => write!(f, "Device({})", d.block().name()),
            Param::Thread(t) => write!(f, "Thread({})", t.block().name()),
            Param::Connection(c) => write!(f, "Connection({c:?})"),
            Param::Blocks(v) => write!(f, "Blocks(len={})", v.len()),
            Param::Connections(v) => write!(f, "Connections(len={})", v.len()),
        }
    }
}

/// One-shot completion: a flag behind a mutex plus a condvar. `wait`
/// blocks until `complete` runs; completing twice is harmless.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        drop(done);
        self.cond.notify_all();
    }

    fn is_complete(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An event in flight: kind, parameter bag, completion.
pub struct Event {
    kind: EventKind,
    params: Mutex<Vec<(String, Param)>>,
    completion: Completion,
}

impl Event {
    pub fn new(kind: EventKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            params: Mutex::new(Vec::new()),
            completion: Completion::new(),
        })
    }

    /// Convenience constructor with an initial parameter set.
    pub fn with(kind: EventKind, params: Vec<(&str, Param)>) -> Arc<Self> {
        let ev = Self {
            kind,
            params: Mutex::new(
                params
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value))
                    .collect(),
            ),
            completion: Completion::new(),
        };
        Arc::new(ev)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Set or replace a named parameter. Also how handlers attach
    /// response values.
    pub fn set_param(&self, name: &str, value: Param) {
        let mut params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = params.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            params.push((name.to_string(), value));
        }
    }

    /// Remove and return a named parameter.
    pub fn take_param(&self, name: &str) -> Option<Param> {
        let mut params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        let idx = params.iter().position(|(n, _)| n == name)?;
        Some(params.swap_remove(idx).1)
    }

    pub fn param_exists(&self, name: &str) -> bool {
        self.params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(n, _)| n == name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.iter().find_map(|(n, v)| match v {
            Param::I64(x) if n == name => Some(*x),
            _ => None,
        })
    }

    pub fn get_block(&self, name: &str) -> Option<BlockId> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.iter().find_map(|(n, v)| match v {
            Param::Block(id) if n == name => Some(*id),
            _ => None,
        })
    }

    pub fn get_connection(&self, name: &str) -> Option<Connection> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.iter().find_map(|(n, v)| match v {
            Param::Connection(c) if n == name => Some(*c),
            _ => None,
        })
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        let params = self.params.lock().unwrap_or_else(|e| e.into_inner());
        params.iter().find_map(|(n, v)| match v {
            Param::Str(s) if n == name => Some(s.clone()),
            _ => None,
        })
    }

    pub fn take_device(&self, name: &str) -> Option<Box<dyn Device>> {
        match self.take_param(name) {
            Some(Param::Device(d)) => Some(d),
            Some(other) => {
                self.set_param(name, other);
                None
            }
            None => None,
        }
    }

    pub fn take_thread(&self, name: &str) -> Option<Box<dyn Thread>> {
        match self.take_param(name) {
            Some(Param::Thread(t)) => Some(t),
            Some(other) => {
                self.set_param(name, other);
                None
            }
            None => None,
        }
    }

    pub fn take_blocks(&self, name: &str) -> Option<Vec<BlockInfo>> {
        match self.take_param(name) {
            Some(Param::Blocks(v)) => Some(v),
            Some(other) => {
                self.set_param(name, other);
                None
            }
            None => None,
        }
    }

    pub fn take_connections(&self, name: &str) -> Option<Vec<Connection>> {
        match self.take_param(name) {
            Some(Param::Connections(v)) => Some(v),
            Some(other) => {
                self.set_param(name, other);
                None
            }
            None => None,
        }
    }

    /// Block until the event is marked done.
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Mark the event done, releasing the poster.
    pub fn done(&self) {
        self.completion.complete();
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_complete()
    }
}

/// Receives every event dispatched by the [`Manager`].
pub trait Handler: Send + Sync {
    fn receive_event(&self, event: &Event);
}

type HandlerList = Arc<RwLock<Vec<Arc<dyn Handler>>>>;

/// The event bus: handler registry, FIFO queue, one worker thread.
pub struct Manager {
    handlers: HandlerList,
    queue_tx: Mutex<MpmcSender<Arc<Event>>>,
    cancel: CancelToken,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Manager {
    pub fn new() -> anyhow::Result<Self> {
        let (queue_tx, queue_rx) = MpmcChannel::unbounded::<Arc<Event>>();
        let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));
        let cancel = CancelToken::new();

        let worker_handlers = handlers.clone();
        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name("rtlab-events".into())
            .spawn(move || Self::process_events(queue_rx, worker_handlers, worker_cancel))?;

        Ok(Self {
            handlers,
            queue_tx: Mutex::new(queue_tx),
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn process_events(rx: MpmcReceiver<Arc<Event>>, handlers: HandlerList, cancel: CancelToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_blocking(Duration::from_millis(50)) {
                Ok(event) => Self::dispatch(&handlers, &event),
                Err(RecvError::Timeout) => continue,
                Err(_) => break,
            }
        }
        // Shutdown drain: release every poster still queued, with no
        // handler side effects.
        let mut rx = rx;
        while let Ok(event) = rx.try_recv() {
            event.done();
        }
    }

    fn dispatch(handlers: &HandlerList, event: &Arc<Event>) {
        let list = handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in list.iter() {
            handler.receive_event(event);
        }
        drop(list);
        // Liveness guarantee: whatever the handlers did, the poster is
        // released once the chain is exhausted.
        event.done();
    }

    /// Register a handler. Idempotent on the same instance.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        let mut list = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if !list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            list.push(handler);
        }
    }

    /// Remove a handler. No-op if absent.
    pub fn unregister_handler(&self, handler: &Arc<dyn Handler>) {
        let mut list = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        list.retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn is_registered(&self, handler: &Arc<dyn Handler>) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|h| Arc::ptr_eq(h, handler))
    }

    /// Enqueue an event and block until it is processed.
    ///
    /// Must not be called from a handler running on the worker thread:
    /// the wait would deadlock the dispatch loop.
    pub fn post(&self, event: &Arc<Event>) {
        if self.cancel.is_cancelled() || self.enqueue(event).is_err() {
            event.done();
            return;
        }
        event.wait();
    }

    /// Enqueue a batch under a single queue lock, then wait on each
    /// event in order.
    pub fn post_batch(&self, events: &[Arc<Event>]) {
        if self.cancel.is_cancelled() {
            for event in events {
                event.done();
            }
            return;
        }
        {
            let mut tx = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
            for event in events {
                if tx.try_send(event.clone()).is_err() {
                    event.done();
                }
            }
        }
        for event in events {
            event.wait();
        }
    }

    fn enqueue(&self, event: &Arc<Event>) -> Result<(), ()> {
        let mut tx = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.try_send(event.clone()).map_err(|_| ())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Handler for Recorder {
        fn receive_event(&self, event: &Event) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{:?}", self.tag, event.kind()));
        }
    }

    #[test]
    fn unhandled_events_are_still_completed() {
        let manager = Manager::new().unwrap();
        let event = Event::new(EventKind::Noop);
        manager.post(&event);
        assert!(event.is_done());
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let manager = Manager::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "a",
            log: log.clone(),
        });
        let b: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "b",
            log: log.clone(),
        });
        manager.register_handler(a.clone());
        manager.register_handler(b.clone());
        assert!(manager.is_registered(&a));

        manager.post(&Event::new(EventKind::Noop));
        manager.post(&Event::new(EventKind::GetPeriod));

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec!["a:Noop", "b:Noop", "a:GetPeriod", "b:GetPeriod"]
        );
    }

    #[test]
    fn registration_is_idempotent() {
        let manager = Manager::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "a",
            log: log.clone(),
        });
        manager.register_handler(a.clone());
        manager.register_handler(a.clone());
        manager.post(&Event::new(EventKind::Noop));
        assert_eq!(log.lock().unwrap().len(), 1);

        manager.unregister_handler(&a);
        assert!(!manager.is_registered(&a));
        manager.post(&Event::new(EventKind::Noop));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn batch_is_dispatched_in_order() {
        let manager = Manager::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn Handler> = Arc::new(Recorder {
            tag: "a",
            log: log.clone(),
        });
        manager.register_handler(a);

        let events = [
            Event::new(EventKind::PeriodChange),
            Event::new(EventKind::Noop),
            Event::new(EventKind::Shutdown),
        ];
        manager.post_batch(&events);
        for event in &events {
            assert!(event.is_done());
        }
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["a:PeriodChange", "a:Noop", "a:Shutdown"]);
    }

    #[test]
    fn params_round_trip() {
        let event = Event::with(EventKind::PeriodChange, vec![("period", Param::I64(42))]);
        assert_eq!(event.get_i64("period"), Some(42));
        assert!(event.param_exists("period"));
        event.set_param("period", Param::I64(7));
        assert_eq!(event.get_i64("period"), Some(7));
        assert!(matches!(event.take_param("period"), Some(Param::I64(7))));
        assert!(!event.param_exists("period"));
    }
}

//! The RT system: spawns the periodic task, translates events into
//! RT-bound commands, and surfaces telemetry.
//!
//! Control path: a poster hands an [`Event`](crate::event::Event) to the
//! event manager; this handler updates the connector, builds a command
//! (snapshots included), pushes it into the host-to-RT ring, and blocks
//! on the command's acknowledgement. The RT loop applies commands only
//! at the end of a tick, so the active set and wiring are fixed within
//! one period.

mod executor;
pub mod os;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use uuid::Uuid;

use crate::block::BlockId;
use crate::config::SystemConfig;
use crate::connector::{BlockKind, BlockMeta, Connector};
use crate::error::RecvError;
use crate::event::{Event, EventKind, Handler, Manager, Param};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::MpmcChannel;
use crate::io::ringbuffer::{RingBuffer, RingReceiver, RingSender};
use crate::utils::{CancelToken, try_pin_core};

use executor::{Command, CommandAction, CommandAck, Executor, Flow, GraphUpdate};
use os::{Pacer, Task};

pub use os::DEFAULT_PERIOD_NS;

const DEFAULT_COMMAND_CAPACITY: usize = 64;
const DEFAULT_TELEMETRY_CAPACITY: usize = 256;

/// What a telemetry record reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    PeriodUpdate,
    DeviceListUpdate,
    ThreadListUpdate,
    Noop,
    Shutdown,
    Error(RtErrorKind),
}

/// RT-side error conditions surfaced through telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtErrorKind {
    /// The telemetry ring was full; a record was dropped.
    TelemetryOverflow,
}

/// RT-to-host status record. `command` correlates the record with the
/// command that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub kind: TelemetryKind,
    pub command: Option<Uuid>,
}

/// The realtime system. Construct with [`System::launch`]; interact by
/// posting events through the [`Manager`] it registered with.
pub struct System {
    task: Arc<Task>,
    cmd_tx: Mutex<RingSender<Command>>,
    telemetry_rx: Mutex<RingReceiver<TelemetryRecord>>,
    connector: Mutex<Connector>,
    last_telemetry: Mutex<Option<TelemetryRecord>>,
    cancel: CancelToken,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl System {
    /// Create the SPSC rings, spawn the RT task, and register the
    /// system as an event handler on `manager`.
    pub fn launch(config: SystemConfig, manager: &Manager) -> anyhow::Result<Arc<Self>> {
        let period_ns = config.period_ns.unwrap_or(DEFAULT_PERIOD_NS);
        anyhow::ensure!(period_ns > 0, "period must be positive");

        let (cmd_tx, cmd_rx) =
            RingBuffer::bounded::<Command>(config.command_capacity.unwrap_or(DEFAULT_COMMAND_CAPACITY));
        let (telemetry_tx, telemetry_rx) = RingBuffer::bounded::<TelemetryRecord>(
            config.telemetry_capacity.unwrap_or(DEFAULT_TELEMETRY_CAPACITY),
        );

        let task = Task::new(period_ns);
        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            let _ = flag::register(*sig, term.clone());
        }

        let rt_task = task.clone();
        let join = thread::Builder::new()
            .name("rtlab-rt".into())
            .spawn(move || run_rt_task(config, rt_task, term, cmd_rx, telemetry_tx))?;

        let system = Arc::new(Self {
            task,
            cmd_tx: Mutex::new(cmd_tx),
            telemetry_rx: Mutex::new(telemetry_rx),
            connector: Mutex::new(Connector::new()),
            last_telemetry: Mutex::new(None),
            cancel: CancelToken::new(),
            join: Mutex::new(Some(join)),
        });
        let handler: Arc<dyn Handler> = system.clone();
        manager.register_handler(handler);
        Ok(system)
    }

    /// Current loop period in nanoseconds.
    pub fn get_period(&self) -> i64 {
        self.task.period()
    }

    /// True when the loop runs under a realtime scheduling policy;
    /// false means best-effort timing.
    pub fn is_realtime(&self) -> bool {
        self.task.is_realtime()
    }

    /// True once the RT loop has exited.
    pub fn is_shut_down(&self) -> bool {
        self.task.is_finished()
    }

    /// Whether a block id is currently registered.
    pub fn is_registered(&self, id: BlockId) -> bool {
        self.lock_connector().is_registered(id)
    }

    /// Drain and return all pending telemetry, oldest first.
    pub fn poll_telemetry(&self) -> Vec<TelemetryRecord> {
        let mut rx = self
            .telemetry_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        drop(rx);
        if let Some(last) = records.last() {
            *self
                .last_telemetry
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(*last);
        }
        records
    }

    /// Most recent telemetry record observed so far.
    pub fn last_telemetry(&self) -> Option<TelemetryRecord> {
        self.poll_telemetry();
        *self
            .last_telemetry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lock_connector(&self) -> std::sync::MutexGuard<'_, Connector> {
        self.connector.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a command and wait for the RT loop to acknowledge it.
    /// `None` when the loop is gone or unresponsive; callers then
    /// complete their event with no effect.
    fn submit(&self, action: CommandAction) -> Option<CommandAck> {
        let (ack_tx, ack_rx) = MpmcChannel::bounded::<CommandAck>(1);
        let command = Command {
            id: Uuid::new_v4(),
            action,
            done: ack_tx,
        };
        {
            let mut tx = self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner());
            if tx
                .send(command, &self.cancel, Some(Duration::from_secs(1)))
                .is_err()
            {
                tracing::warn!("rt command queue rejected command");
                return None;
            }
        }
        let ack_timeout = Duration::from_nanos(self.task.period().max(0) as u64)
            .saturating_mul(4)
            .max(Duration::from_secs(2));
        match ack_rx.recv_blocking(ack_timeout) {
            Ok(ack) => Some(ack),
            Err(RecvError::Timeout) => {
                tracing::warn!("rt command not acknowledged in time");
                None
            }
            Err(_) => None,
        }
    }

    fn handle_period_change(&self, event: &Event) {
        let Some(period_ns) = event.get_i64("period") else {
            event.done();
            return;
        };
        if self.task.is_finished() {
            event.done();
            return;
        }
        if period_ns <= 0 {
            event.set_param("error", Param::Str("period must be positive".into()));
            event.done();
            return;
        }
        if period_ns == self.task.period() {
            // Nothing to apply; the manager releases the poster.
            return;
        }
        self.submit(CommandAction::SetPeriod { period_ns });
        event.done();
    }

    fn handle_device_insert(&self, event: &Event) {
        if self.task.is_finished() {
            event.done();
            return;
        }
        let Some(device) = event.take_device("device") else {
            event.done();
            return;
        };
        let id = device.block().id();
        let meta = BlockMeta::describe(device.block(), BlockKind::Device);
        let update = {
            let mut connector = self.lock_connector();
            let restored = connector.insert_block(meta);
            if !restored.is_empty() {
                tracing::debug!(block = id.0, links = restored.len(), "restored connections");
            }
            graph_refresh(&connector)
        };
        if self
            .submit(CommandAction::InsertDevice { device, update })
            .is_none()
        {
            self.lock_connector().remove_block(id);
        }
        event.done();
    }

    fn handle_device_remove(&self, event: &Event) {
        if self.task.is_finished() {
            event.done();
            return;
        }
        let Some(block) = event.get_block("block") else {
            event.done();
            return;
        };
        let update = {
            let mut connector = self.lock_connector();
            if !connector.is_registered(block) {
                drop(connector);
                event.set_param("error", Param::Str("unknown block".into()));
                event.done();
                return;
            }
            connector.remove_block(block);
            graph_refresh(&connector)
        };
        if let Some(mut ack) = self.submit(CommandAction::RemoveDevice { block, update })
            && let Some(device) = ack.removed_device.take()
        {
            event.set_param("device", Param::Device(device));
        }
        event.done();
    }

    fn handle_thread_insert(&self, event: &Event) {
        if self.task.is_finished() {
            event.done();
            return;
        }
        let Some(thread) = event.take_thread("thread") else {
            event.done();
            return;
        };
        let id = thread.block().id();
        let meta = BlockMeta::describe(thread.block(), BlockKind::Thread);
        let update = {
            let mut connector = self.lock_connector();
            let restored = connector.insert_block(meta);
            if !restored.is_empty() {
                tracing::debug!(block = id.0, links = restored.len(), "restored connections");
            }
            graph_refresh(&connector)
        };
        if self
            .submit(CommandAction::InsertThread { thread, update })
            .is_none()
        {
            self.lock_connector().remove_block(id);
        }
        event.done();
    }

    fn handle_thread_remove(&self, event: &Event) {
        if self.task.is_finished() {
            event.done();
            return;
        }
        let Some(block) = event.get_block("block") else {
            event.done();
            return;
        };
        let update = {
            let mut connector = self.lock_connector();
            if !connector.is_registered(block) {
                drop(connector);
                event.set_param("error", Param::Str("unknown block".into()));
                event.done();
                return;
            }
            connector.remove_block(block);
            graph_refresh(&connector)
        };
        if let Some(mut ack) = self.submit(CommandAction::RemoveThread { block, update })
            && let Some(thread) = ack.removed_thread.take()
        {
            event.set_param("thread", Param::Thread(thread));
        }
        event.done();
    }

    fn handle_set_active(&self, event: &Event, active: bool) {
        if self.task.is_finished() {
            event.done();
            return;
        }
        let Some(block) = event.get_block("block") else {
            event.done();
            return;
        };
        if !self.lock_connector().is_registered(block) {
            event.set_param("error", Param::Str("unknown block".into()));
            event.done();
            return;
        }
        self.submit(CommandAction::SetActive { block, active });
        event.done();
    }

    fn handle_link_insert(&self, event: &Event) {
        let Some(connection) = event.get_connection("connection") else {
            event.done();
            return;
        };
        let update = {
            let mut connector = self.lock_connector();
            match connector.connect(connection) {
                Ok(()) => Some(graph_refresh(&connector)),
                Err(e) => {
                    event.set_param("error", Param::Str(e.to_string()));
                    None
                }
            }
        };
        if let Some(update) = update
            && !self.task.is_finished()
        {
            self.submit(CommandAction::RefreshRoutes { update });
        }
        event.done();
    }

    fn handle_link_remove(&self, event: &Event) {
        let Some(connection) = event.get_connection("connection") else {
            event.done();
            return;
        };
        let update = {
            let mut connector = self.lock_connector();
            connector.disconnect(connection);
            graph_refresh(&connector)
        };
        if !self.task.is_finished() {
            self.submit(CommandAction::RefreshRoutes { update });
        }
        event.done();
    }
}

impl Handler for System {
    fn receive_event(&self, event: &Event) {
        match event.kind() {
            EventKind::PeriodChange => self.handle_period_change(event),
            EventKind::GetPeriod => {
                event.set_param("period", Param::I64(self.task.period()));
                event.done();
            }
            EventKind::DeviceInsert => self.handle_device_insert(event),
            EventKind::DeviceRemove => self.handle_device_remove(event),
            EventKind::ThreadInsert => self.handle_thread_insert(event),
            EventKind::ThreadRemove => self.handle_thread_remove(event),
            EventKind::ThreadPause | EventKind::DevicePause => {
                self.handle_set_active(event, false)
            }
            EventKind::ThreadUnpause | EventKind::DeviceUnpause => {
                self.handle_set_active(event, true)
            }
            EventKind::LinkInsert => self.handle_link_insert(event),
            EventKind::LinkRemove => self.handle_link_remove(event),
            EventKind::BlockQuery => {
                event.set_param("blockList", Param::Blocks(self.lock_connector().block_list()));
                event.done();
            }
            EventKind::ConnectionQuery => {
                event.set_param(
                    "connections",
                    Param::Connections(self.lock_connector().all_connections()),
                );
                event.done();
            }
            EventKind::Shutdown => {
                if !self.task.is_finished() {
                    self.submit(CommandAction::Shutdown);
                }
                event.done();
            }
            EventKind::Noop => {
                if !self.task.is_finished() {
                    self.submit(CommandAction::Noop);
                }
                event.done();
            }
        }
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.task.finish();
        self.cancel.cancel();
        if let Some(join) = self
            .join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = join.join();
        }
    }
}

/// Compile the connector's current state into the snapshot refresh a
/// structural command carries: new plan, new order, and spare capacity
/// for the RT-side rebuild.
fn graph_refresh(connector: &Connector) -> GraphUpdate {
    let device_order = connector.devices().to_vec();
    let thread_order = connector.threads().to_vec();
    let plan = connector.compile_plan(&device_order, &thread_order);
    let spare_devices = Vec::with_capacity(device_order.len() + 1);
    let spare_threads = Vec::with_capacity(thread_order.len() + 1);
    GraphUpdate {
        plan,
        thread_order,
        spare_devices,
        spare_threads,
    }
}

/// Body of the RT task thread.
fn run_rt_task(
    config: SystemConfig,
    task: Arc<Task>,
    term: Arc<AtomicBool>,
    cmd_rx: RingReceiver<Command>,
    telemetry_tx: RingSender<TelemetryRecord>,
) {
    if let Some(core_id) = config.core_id {
        match try_pin_core(core_id) {
            Ok(core) => tracing::info!(core, "rt task pinned"),
            Err(e) => tracing::warn!("cannot pin rt task: {e}"),
        }
    }
    if config.lock_memory
        && let Err(e) = os::initiate()
    {
        tracing::warn!("memory locking unavailable, continuing best-effort: {e}");
    }
    if let Some(priority) = config.rt_priority {
        match os::set_realtime_priority(priority) {
            Ok(()) => {
                task.set_realtime(true);
                tracing::info!(priority, "rt task scheduled SCHED_FIFO");
            }
            Err(e) => tracing::warn!("realtime scheduling unavailable, continuing best-effort: {e}"),
        }
    }

    let mut executor = Executor::new(cmd_rx, telemetry_tx, task.clone());
    let mut pacer = Pacer::new(task.period());

    loop {
        pacer.wait();
        if term.load(Ordering::Relaxed) || task.is_finished() {
            executor.emit_shutdown();
            break;
        }
        executor.tick();
        if executor.drain_commands(&mut pacer) == Flow::Shutdown {
            break;
        }
    }
    task.finish();
    os::shutdown();
}

//! The RT side of the system: owns the live block objects and runs the
//! per-tick dataflow, then drains the command ring.
//!
//! Everything here executes on the RT task after launch. The tick path
//! performs no allocation: route copies stage through the plan's
//! preallocated scratch buffer, and list updates swap in vectors
//! assembled on the host side, handing the retired ones back through
//! the acknowledge channel.

use std::sync::Arc;

use uuid::Uuid;

use crate::block::{BlockId, Device, Direction, Thread};
use crate::connector::{RoutePlan, Slot};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::MpmcSender;
use crate::io::ringbuffer::{RingReceiver, RingSender};
use crate::rt::os::{Pacer, Task};
use crate::rt::{RtErrorKind, TelemetryKind, TelemetryRecord};

/// A registered device slot. `active` is flipped only while draining
/// commands, so the active set is fixed within a tick.
pub(crate) struct DeviceSlot {
    pub id: BlockId,
    pub active: bool,
    pub device: Box<dyn Device>,
}

/// A registered compute-block slot, kept in topological order.
pub(crate) struct ThreadSlot {
    pub id: BlockId,
    pub active: bool,
    pub thread: Box<dyn Thread>,
}

/// Host-assembled snapshot refresh: the new routing plan, the new
/// compute-block order, and empty vectors with enough capacity for the
/// rebuilt lists so the swap never allocates on the RT side.
pub(crate) struct GraphUpdate {
    pub plan: RoutePlan,
    pub thread_order: Vec<BlockId>,
    pub spare_devices: Vec<DeviceSlot>,
    pub spare_threads: Vec<ThreadSlot>,
}

/// A block object travelling into the RT side.
pub(crate) enum Incoming {
    Device(Box<dyn Device>),
    Thread(Box<dyn Thread>),
}

/// What a command asks the RT loop to do.
pub(crate) enum CommandAction {
    SetPeriod { period_ns: i64 },
    InsertDevice { device: Box<dyn Device>, update: GraphUpdate },
    RemoveDevice { block: BlockId, update: GraphUpdate },
    InsertThread { thread: Box<dyn Thread>, update: GraphUpdate },
    RemoveThread { block: BlockId, update: GraphUpdate },
    SetActive { block: BlockId, active: bool },
    RefreshRoutes { update: GraphUpdate },
    Shutdown,
    Noop,
}

/// RT-bound command: action, correlation id, acknowledge channel. The
/// poster blocks on the acknowledgement, so the command's payload is
/// alive for the whole round trip.
pub(crate) struct Command {
    pub id: Uuid,
    pub action: CommandAction,
    pub done: MpmcSender<CommandAck>,
}

/// Snapshots retired by a swap, released on the host side.
pub(crate) struct Retired {
    pub devices: Vec<DeviceSlot>,
    pub threads: Vec<ThreadSlot>,
    pub plan: RoutePlan,
}

/// Acknowledgement carried back to the posting handler. Removed blocks
/// return to host ownership here.
pub(crate) struct CommandAck {
    pub command: Uuid,
    pub retired: Option<Retired>,
    pub removed_device: Option<Box<dyn Device>>,
    pub removed_thread: Option<Box<dyn Thread>>,
}

impl CommandAck {
    fn new(command: Uuid) -> Self {
        Self {
            command,
            retired: None,
            removed_device: None,
            removed_thread: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct Executor {
    devices: Vec<DeviceSlot>,
    threads: Vec<ThreadSlot>,
    plan: RoutePlan,
    cmd_rx: RingReceiver<Command>,
    telemetry_tx: RingSender<TelemetryRecord>,
    task: Arc<Task>,
    overflow: bool,
}

impl Executor {
    pub fn new(
        cmd_rx: RingReceiver<Command>,
        telemetry_tx: RingSender<TelemetryRecord>,
        task: Arc<Task>,
    ) -> Self {
        Self {
            devices: Vec::new(),
            threads: Vec::new(),
            plan: RoutePlan::empty(),
            cmd_rx,
            telemetry_tx,
            task,
            overflow: false,
        }
    }

    /// One period's worth of dataflow: device reads, compute blocks in
    /// topological order with their inputs propagated just before each
    /// `execute`, then device input propagation and writes.
    pub fn tick(&mut self) {
        for slot in &mut self.devices {
            if slot.active {
                slot.device.read();
            }
        }
        for index in 0..self.threads.len() {
            if !self.threads[index].active {
                continue;
            }
            self.propagate_thread(index);
            self.threads[index].thread.execute();
        }
        for index in 0..self.devices.len() {
            if !self.devices[index].active {
                continue;
            }
            self.propagate_device(index);
            self.devices[index].device.write();
        }
    }

    /// Pull fresh samples into compute block `index` along its incoming
    /// routes. Copies stage through the scratch buffer, which also
    /// makes a block tapping its own ports well-defined.
    fn propagate_thread(&mut self, index: usize) {
        let route_count = self.plan.thread_routes.get(index).map_or(0, Vec::len);
        for k in 0..route_count {
            let route = self.plan.thread_routes[index][k];
            let Self {
                devices,
                threads,
                plan,
                ..
            } = self;
            let staged = {
                let src_block = match route.src {
                    Slot::Device(i) => devices.get(i).map(|s| s.device.block()),
                    Slot::Thread(i) => threads.get(i).map(|s| s.thread.block()),
                };
                match src_block.and_then(|b| b.samples(route.src_direction, route.src_port)) {
                    Some(src) if src.len() >= route.width && plan.scratch.len() >= route.width => {
                        plan.scratch[..route.width].copy_from_slice(&src[..route.width]);
                        true
                    }
                    _ => false,
                }
            };
            if !staged {
                continue;
            }
            if let Some(slot) = threads.get_mut(index)
                && let Some(dest) = slot
                    .thread
                    .block_mut()
                    .samples_mut(Direction::Input, route.dest_port)
                && dest.len() >= route.width
            {
                dest[..route.width].copy_from_slice(&plan.scratch[..route.width]);
            }
        }
    }

    /// Pull fresh samples into device `index` before its `write`.
    fn propagate_device(&mut self, index: usize) {
        let route_count = self.plan.device_routes.get(index).map_or(0, Vec::len);
        for k in 0..route_count {
            let route = self.plan.device_routes[index][k];
            let Self {
                devices,
                threads,
                plan,
                ..
            } = self;
            let staged = {
                let src_block = match route.src {
                    Slot::Device(i) => devices.get(i).map(|s| s.device.block()),
                    Slot::Thread(i) => threads.get(i).map(|s| s.thread.block()),
                };
                match src_block.and_then(|b| b.samples(route.src_direction, route.src_port)) {
                    Some(src) if src.len() >= route.width && plan.scratch.len() >= route.width => {
                        plan.scratch[..route.width].copy_from_slice(&src[..route.width]);
                        true
                    }
                    _ => false,
                }
            };
            if !staged {
                continue;
            }
            if let Some(slot) = devices.get_mut(index)
                && let Some(dest) = slot
                    .device
                    .block_mut()
                    .samples_mut(Direction::Input, route.dest_port)
                && dest.len() >= route.width
            {
                dest[..route.width].copy_from_slice(&plan.scratch[..route.width]);
            }
        }
    }

    /// Drain every pending command. Returns `Flow::Shutdown` when the
    /// loop must exit.
    pub fn drain_commands(&mut self, pacer: &mut Pacer) -> Flow {
        while let Ok(command) = self.cmd_rx.try_recv() {
            if self.apply(command, pacer) == Flow::Shutdown {
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    fn apply(&mut self, command: Command, pacer: &mut Pacer) -> Flow {
        let Command { id, action, done } = command;
        let mut done = done;
        let mut ack = CommandAck::new(id);
        let mut flow = Flow::Continue;

        let kind = match action {
            CommandAction::SetPeriod { period_ns } => {
                pacer.set_period(period_ns);
                self.task.set_period(pacer.period_ns());
                TelemetryKind::PeriodUpdate
            }
            CommandAction::InsertDevice { device, update } => {
                self.apply_graph(update, Some(Incoming::Device(device)), None, &mut ack);
                TelemetryKind::DeviceListUpdate
            }
            CommandAction::RemoveDevice { block, update } => {
                self.apply_graph(update, None, Some(block), &mut ack);
                TelemetryKind::DeviceListUpdate
            }
            CommandAction::InsertThread { thread, update } => {
                self.apply_graph(update, Some(Incoming::Thread(thread)), None, &mut ack);
                TelemetryKind::ThreadListUpdate
            }
            CommandAction::RemoveThread { block, update } => {
                self.apply_graph(update, None, Some(block), &mut ack);
                TelemetryKind::ThreadListUpdate
            }
            CommandAction::SetActive { block, active } => {
                self.set_active(block, active);
                TelemetryKind::Noop
            }
            CommandAction::RefreshRoutes { update } => {
                self.apply_graph(update, None, None, &mut ack);
                TelemetryKind::Noop
            }
            CommandAction::Noop => TelemetryKind::Noop,
            CommandAction::Shutdown => {
                flow = Flow::Shutdown;
                TelemetryKind::Shutdown
            }
        };

        self.post_telemetry(kind, Some(id));
        let _ = done.try_send(ack);
        flow
    }

    /// Swap in the refreshed lists and plan. The rebuilt vectors come
    /// from the update's spare capacity; the retired ones leave through
    /// the ack, so this never allocates or frees.
    fn apply_graph(
        &mut self,
        update: GraphUpdate,
        insert: Option<Incoming>,
        remove: Option<BlockId>,
        ack: &mut CommandAck,
    ) {
        let GraphUpdate {
            plan,
            thread_order,
            spare_devices,
            spare_threads,
        } = update;
        let (mut incoming_device, mut incoming_thread) = match insert {
            Some(Incoming::Device(d)) => (Some(d), None),
            Some(Incoming::Thread(t)) => (None, Some(t)),
            None => (None, None),
        };

        let mut new_devices = spare_devices;
        for slot in self.devices.drain(..) {
            if Some(slot.id) == remove {
                ack.removed_device = Some(slot.device);
            } else {
                new_devices.push(slot);
            }
        }
        if let Some(device) = incoming_device.take() {
            let id = device.block().id();
            new_devices.push(DeviceSlot {
                id,
                active: false,
                device,
            });
        }
        let retired_devices = std::mem::replace(&mut self.devices, new_devices);

        let mut new_threads = spare_threads;
        let mut old_threads = std::mem::take(&mut self.threads);
        for id in &thread_order {
            if let Some(pos) = old_threads.iter().position(|s| s.id == *id) {
                new_threads.push(old_threads.remove(pos));
            } else if let Some(thread) = incoming_thread.take_if(|t| t.block().id() == *id) {
                new_threads.push(ThreadSlot {
                    id: *id,
                    active: false,
                    thread,
                });
            }
        }
        for slot in old_threads.drain(..) {
            if Some(slot.id) == remove {
                ack.removed_thread = Some(slot.thread);
            } else {
                // Not in the new order; keep it alive rather than drop
                // it on the RT side.
                new_threads.push(slot);
            }
        }
        let retired_threads = std::mem::replace(&mut self.threads, new_threads);
        let retired_plan = std::mem::replace(&mut self.plan, plan);

        ack.retired = Some(Retired {
            devices: retired_devices,
            threads: retired_threads,
            plan: retired_plan,
        });
    }

    fn set_active(&mut self, block: BlockId, active: bool) {
        for slot in &mut self.devices {
            if slot.id == block {
                slot.active = active;
                return;
            }
        }
        for slot in &mut self.threads {
            if slot.id == block {
                slot.active = active;
                return;
            }
        }
    }

    /// Non-blocking telemetry emission. A full ring drops the record
    /// and stamps an overflow error on the next successful write.
    fn post_telemetry(&mut self, kind: TelemetryKind, command: Option<Uuid>) {
        if self.overflow {
            let marker = TelemetryRecord {
                kind: TelemetryKind::Error(RtErrorKind::TelemetryOverflow),
                command: None,
            };
            if self.telemetry_tx.try_send(marker).is_ok() {
                self.overflow = false;
            }
        }
        if self
            .telemetry_tx
            .try_send(TelemetryRecord { kind, command })
            .is_err()
        {
            self.overflow = true;
        }
    }

    /// Final telemetry before the loop exits.
    pub fn emit_shutdown(&mut self) {
        self.post_telemetry(TelemetryKind::Shutdown, None);
    }
}

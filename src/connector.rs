//! Registry of blocks and the connection graph between them.
//!
//! The connector lives on the non-realtime side and holds metadata
//! only: stable ids, channel descriptors, and edges. The live block
//! objects are owned by the periodic executor; structural changes reach
//! it as swapped-in snapshots compiled here (see [`Connector::compile_plan`]).

use ahash::{AHashMap, AHashSet};

use crate::block::{Block, BlockId, Channel, Direction};
use crate::error::GraphError;

/// Which participant flavor a registered block is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Device,
    Thread,
}

/// Connector-side description of a registered block.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub id: BlockId,
    pub name: String,
    pub kind: BlockKind,
    pub inputs: Vec<Channel>,
    pub outputs: Vec<Channel>,
}

impl BlockMeta {
    /// Snapshot the descriptors of a live block.
    pub fn describe(block: &Block, kind: BlockKind) -> Self {
        Self {
            id: block.id(),
            name: block.name().to_string(),
            kind,
            inputs: block.channels(Direction::Input),
            outputs: block.channels(Direction::Output),
        }
    }

    fn channel(&self, direction: Direction, index: usize) -> Option<&Channel> {
        match direction {
            Direction::Input => self.inputs.get(index),
            Direction::Output => self.outputs.get(index),
        }
    }
}

/// Lightweight block listing handed to query events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub name: String,
    pub kind: BlockKind,
}

/// Directed edge from a source port to a destination input port.
///
/// `src_direction` is `Output` for a normal link. `Input` taps the
/// source's input buffer instead, observing it after upstream
/// propagation filled it in the same tick (instrumentation probes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub src: BlockId,
    pub src_direction: Direction,
    pub src_port: usize,
    pub dest: BlockId,
    pub dest_port: usize,
}

/// Where a route endpoint lives inside the executor's snapshot lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Device(usize),
    Thread(usize),
}

/// One index-resolved copy: source slot/port into a destination input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Route {
    pub src: Slot,
    pub src_direction: Direction,
    pub src_port: usize,
    pub dest_port: usize,
    pub width: usize,
}

/// Immutable routing snapshot consumed by the executor. Routes are
/// grouped per destination slot; `scratch` is preallocated to the
/// widest channel so per-tick copies never allocate.
#[derive(Debug)]
pub struct RoutePlan {
    pub(crate) device_routes: Vec<Vec<Route>>,
    pub(crate) thread_routes: Vec<Vec<Route>>,
    pub(crate) scratch: Vec<f64>,
}

impl RoutePlan {
    pub(crate) fn empty() -> Self {
        Self {
            device_routes: Vec::new(),
            thread_routes: Vec::new(),
            scratch: vec![0.0],
        }
    }
}

/// Copy one connection's samples from `src` into `dest`'s input port.
///
/// This is the push form of propagation for single-threaded use
/// (tools, offline pipelines). The live loop uses the pull form over a
/// compiled [`RoutePlan`] instead.
pub fn propagate(
    conn: &Connection,
    src: &Block,
    dest: &mut Block,
) -> Result<(), crate::error::BlockError> {
    let samples = match conn.src_direction {
        Direction::Output => src.read_output(conn.src_port)?,
        Direction::Input => src.read_input(conn.src_port)?,
    };
    dest.write_input(conn.dest_port, samples)
}

/// Central meeting point between blocks: registration, wiring, cycle
/// rejection, and the cached topological order of compute blocks.
#[derive(Default)]
pub struct Connector {
    blocks: AHashMap<BlockId, BlockMeta>,
    devices: Vec<BlockId>,
    threads: Vec<BlockId>,
    edges: AHashMap<BlockId, Vec<Connection>>,
    /// Edges preserved across removal, restored when the same id is
    /// registered again (hot-reload path).
    stash: AHashMap<BlockId, Vec<Connection>>,
    topo: Vec<BlockId>,
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block. Idempotent: re-registering a known id is a
    /// no-op. Returns the stashed connections that were restored for
    /// this id.
    pub fn insert_block(&mut self, meta: BlockMeta) -> Vec<Connection> {
        if self.blocks.contains_key(&meta.id) {
            return Vec::new();
        }
        let id = meta.id;
        match meta.kind {
            BlockKind::Device => self.devices.push(id),
            BlockKind::Thread => self.threads.push(id),
        }
        self.blocks.insert(id, meta);
        self.rebuild_topo();

        let mut restored = Vec::new();
        for conn in self.stash.remove(&id).unwrap_or_default() {
            if self.connect(conn).is_ok() {
                restored.push(conn);
            }
        }
        restored
    }

    /// Deregister a block, dropping every incident edge. The removed
    /// edges are returned and stashed for a later re-registration.
    pub fn remove_block(&mut self, id: BlockId) -> Vec<Connection> {
        if self.blocks.remove(&id).is_none() {
            return Vec::new();
        }
        self.devices.retain(|b| *b != id);
        self.threads.retain(|b| *b != id);

        let mut removed = self.edges.remove(&id).unwrap_or_default();
        for outgoing in self.edges.values_mut() {
            let mut kept = Vec::with_capacity(outgoing.len());
            for conn in outgoing.drain(..) {
                if conn.dest == id {
                    removed.push(conn);
                } else {
                    kept.push(conn);
                }
            }
            *outgoing = kept;
        }
        if !removed.is_empty() {
            self.stash.insert(id, removed.clone());
        }
        self.rebuild_topo();
        removed
    }

    pub fn is_registered(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Add an edge. Validates both endpoints, rejects width mismatches
    /// and compute-block cycles. Idempotent on duplicate edges.
    pub fn connect(&mut self, conn: Connection) -> Result<(), GraphError> {
        let src = self
            .blocks
            .get(&conn.src)
            .ok_or(GraphError::UnknownBlock(conn.src))?;
        let dest = self
            .blocks
            .get(&conn.dest)
            .ok_or(GraphError::UnknownBlock(conn.dest))?;

        let src_channel =
            src.channel(conn.src_direction, conn.src_port)
                .ok_or(GraphError::NoSuchPort {
                    block: conn.src,
                    direction: conn.src_direction,
                    index: conn.src_port,
                })?;
        let dest_channel =
            dest.channel(Direction::Input, conn.dest_port)
                .ok_or(GraphError::NoSuchPort {
                    block: conn.dest,
                    direction: Direction::Input,
                    index: conn.dest_port,
                })?;
        if src_channel.width != dest_channel.width {
            return Err(GraphError::WidthMismatch {
                src: src_channel.width,
                dest: dest_channel.width,
            });
        }

        if self.connected(conn) {
            return Ok(());
        }

        if src.kind == BlockKind::Thread
            && dest.kind == BlockKind::Thread
            && self.reachable(conn.dest, conn.src)
        {
            return Err(GraphError::Cycle);
        }

        self.edges.entry(conn.src).or_default().push(conn);
        self.rebuild_topo();
        Ok(())
    }

    /// Remove an edge. No-op if absent.
    pub fn disconnect(&mut self, conn: Connection) {
        if let Some(outgoing) = self.edges.get_mut(&conn.src) {
            outgoing.retain(|c| *c != conn);
            if outgoing.is_empty() {
                self.edges.remove(&conn.src);
            }
        }
        self.rebuild_topo();
    }

    pub fn connected(&self, conn: Connection) -> bool {
        self.edges
            .get(&conn.src)
            .is_some_and(|outgoing| outgoing.contains(&conn))
    }

    /// Edges leaving `id`.
    pub fn outputs(&self, id: BlockId) -> &[Connection] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge in the graph, grouped by source in registration order.
    pub fn all_connections(&self) -> Vec<Connection> {
        let mut out = Vec::new();
        for id in self.devices.iter().chain(self.threads.iter()) {
            out.extend_from_slice(self.outputs(*id));
        }
        out
    }

    /// Registered devices in insertion order.
    pub fn devices(&self) -> &[BlockId] {
        &self.devices
    }

    /// Registered compute blocks in topological order.
    pub fn threads(&self) -> &[BlockId] {
        &self.topo
    }

    /// Listing of every registered block, devices first.
    pub fn block_list(&self) -> Vec<BlockInfo> {
        self.devices
            .iter()
            .chain(self.threads.iter())
            .filter_map(|id| self.blocks.get(id))
            .map(|meta| BlockInfo {
                id: meta.id,
                name: meta.name.clone(),
                kind: meta.kind,
            })
            .collect()
    }

    /// True when `target` is reachable from `from` over compute-block
    /// edges. Used to reject a prospective cycle before inserting.
    fn reachable(&self, from: BlockId, target: BlockId) -> bool {
        if from == target {
            return true;
        }
        let mut visited = AHashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for conn in self.outputs(current) {
                if !self.is_thread(conn.dest) {
                    continue;
                }
                if conn.dest == target {
                    return true;
                }
                stack.push(conn.dest);
            }
        }
        false
    }

    fn is_thread(&self, id: BlockId) -> bool {
        self.blocks
            .get(&id)
            .is_some_and(|m| m.kind == BlockKind::Thread)
    }

    /// Kahn's algorithm over compute-block vertices, seeded in
    /// insertion order so the result is stable wherever no edge forces
    /// an ordering.
    fn rebuild_topo(&mut self) {
        let mut indegree: AHashMap<BlockId, usize> =
            self.threads.iter().map(|id| (*id, 0)).collect();
        for (src, outgoing) in self.edges.iter() {
            if !self.is_thread(*src) {
                continue;
            }
            for conn in outgoing {
                if let Some(d) = indegree.get_mut(&conn.dest) {
                    *d += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(self.threads.len());
        let mut placed: AHashSet<BlockId> = AHashSet::new();
        while order.len() < self.threads.len() {
            let next = self
                .threads
                .iter()
                .copied()
                .find(|id| !placed.contains(id) && indegree.get(id).copied() == Some(0));
            // The graph is kept acyclic by connect(), so a zero-indegree
            // vertex always exists here.
            let Some(next) = next else { break };
            placed.insert(next);
            order.push(next);
            for conn in self.edges.get(&next).cloned().unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&conn.dest)
                    && *d > 0
                {
                    *d -= 1;
                }
            }
        }
        self.topo = order;
    }

    /// Resolve the edge map against the given snapshot orders into the
    /// index-based plan the executor copies along each tick.
    pub fn compile_plan(&self, device_order: &[BlockId], thread_order: &[BlockId]) -> RoutePlan {
        let device_index: AHashMap<BlockId, usize> = device_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let thread_index: AHashMap<BlockId, usize> = thread_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut plan = RoutePlan {
            device_routes: vec![Vec::new(); device_order.len()],
            thread_routes: vec![Vec::new(); thread_order.len()],
            scratch: Vec::new(),
        };

        let mut max_width = 1usize;
        for meta in self.blocks.values() {
            for channel in meta.inputs.iter().chain(meta.outputs.iter()) {
                max_width = max_width.max(channel.width);
            }
        }
        plan.scratch = vec![0.0; max_width];

        for outgoing in self.edges.values() {
            for conn in outgoing {
                let src_slot = if let Some(i) = device_index.get(&conn.src) {
                    Slot::Device(*i)
                } else if let Some(i) = thread_index.get(&conn.src) {
                    Slot::Thread(*i)
                } else {
                    continue;
                };
                let Some(dest_meta) = self.blocks.get(&conn.dest) else {
                    continue;
                };
                let Some(dest_channel) = dest_meta.channel(Direction::Input, conn.dest_port)
                else {
                    continue;
                };
                let route = Route {
                    src: src_slot,
                    src_direction: conn.src_direction,
                    src_port: conn.src_port,
                    dest_port: conn.dest_port,
                    width: dest_channel.width,
                };
                if let Some(i) = device_index.get(&conn.dest) {
                    plan.device_routes[*i].push(route);
                } else if let Some(i) = thread_index.get(&conn.dest) {
                    plan.thread_routes[*i].push(route);
                }
            }
        }
        plan
    }
}

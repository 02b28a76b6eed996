//! Block and port model: the uniform I/O abstraction shared by
//! acquisition devices and compute blocks.
//!
//! A block owns two dense arrays of ports (inputs, outputs), each port
//! carrying a fixed-width `f64` sample buffer sized at construction and
//! never reallocated afterwards. Devices and compute blocks are the two
//! participant flavors; the periodic executor drives their hooks and is
//! the only writer of port buffers while a block is registered.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BlockError;

/// Whether a channel consumes or produces samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Input,
    Output,
}

/// Port descriptor supplied at block construction. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub description: String,
    pub direction: Direction,
    /// Number of `f64` samples carried per tick.
    pub width: usize,
}

impl Channel {
    pub fn input(name: impl Into<String>, description: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            direction: Direction::Input,
            width,
        }
    }

    pub fn output(name: impl Into<String>, description: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            direction: Direction::Output,
            width,
        }
    }
}

/// Stable block identifier, unique across the process. Assigned at
/// construction so a block keeps its identity across re-registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Port {
    channel: Channel,
    buffer: Vec<f64>,
}

/// A participant in the dataflow graph: named, identified, and holding
/// its port buffers.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
}

impl Block {
    /// Build a block from its channel descriptors. Channels are
    /// partitioned by direction; indices are dense per direction in
    /// declaration order. Zero-width channels are widened to one sample.
    pub fn new(name: impl Into<String>, channels: Vec<Channel>) -> Self {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for mut channel in channels {
            channel.width = channel.width.max(1);
            let buffer = vec![0.0; channel.width];
            match channel.direction {
                Direction::Input => inputs.push(Port { channel, buffer }),
                Direction::Output => outputs.push(Port { channel, buffer }),
            }
        }
        Self {
            id: BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            inputs,
            outputs,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ports in the given direction.
    pub fn count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.inputs.len(),
            Direction::Output => self.outputs.len(),
        }
    }

    fn port(&self, direction: Direction, index: usize) -> Result<&Port, BlockError> {
        let ports = match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        };
        ports
            .get(index)
            .ok_or(BlockError::NoSuchChannel { direction, index })
    }

    pub fn channel_name(&self, direction: Direction, index: usize) -> Result<&str, BlockError> {
        Ok(&self.port(direction, index)?.channel.name)
    }

    pub fn channel_description(
        &self,
        direction: Direction,
        index: usize,
    ) -> Result<&str, BlockError> {
        Ok(&self.port(direction, index)?.channel.description)
    }

    pub fn channel_width(&self, direction: Direction, index: usize) -> Result<usize, BlockError> {
        Ok(self.port(direction, index)?.channel.width)
    }

    /// Descriptors of all ports in the given direction, in index order.
    pub fn channels(&self, direction: Direction) -> Vec<Channel> {
        let ports = match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        };
        ports.iter().map(|p| p.channel.clone()).collect()
    }

    /// Replace the contents of input buffer `index`. The slice length
    /// must equal the declared channel width.
    pub fn write_input(&mut self, index: usize, samples: &[f64]) -> Result<(), BlockError> {
        let port = self
            .inputs
            .get_mut(index)
            .ok_or(BlockError::NoSuchChannel {
                direction: Direction::Input,
                index,
            })?;
        if samples.len() != port.channel.width {
            return Err(BlockError::WidthMismatch {
                expected: port.channel.width,
                got: samples.len(),
            });
        }
        port.buffer.copy_from_slice(samples);
        Ok(())
    }

    /// Read-only view of output buffer `index`.
    pub fn read_output(&self, index: usize) -> Result<&[f64], BlockError> {
        Ok(&self.port(Direction::Output, index)?.buffer)
    }

    /// Read-only view of input buffer `index`. Intended for device and
    /// compute-block implementations inside their hooks.
    pub fn read_input(&self, index: usize) -> Result<&[f64], BlockError> {
        Ok(&self.port(Direction::Input, index)?.buffer)
    }

    /// Replace the contents of output buffer `index`. Intended for
    /// device and compute-block implementations inside their hooks.
    pub fn write_output(&mut self, index: usize, samples: &[f64]) -> Result<(), BlockError> {
        let port = self
            .outputs
            .get_mut(index)
            .ok_or(BlockError::NoSuchChannel {
                direction: Direction::Output,
                index,
            })?;
        if samples.len() != port.channel.width {
            return Err(BlockError::WidthMismatch {
                expected: port.channel.width,
                got: samples.len(),
            });
        }
        port.buffer.copy_from_slice(samples);
        Ok(())
    }

    /// Buffer view used by route propagation. `None` on a bad index so
    /// the executor can skip a stale route instead of panicking.
    pub(crate) fn samples(&self, direction: Direction, index: usize) -> Option<&[f64]> {
        self.port(direction, index).ok().map(|p| p.buffer.as_slice())
    }

    /// Mutable buffer view used by route propagation.
    pub(crate) fn samples_mut(
        &mut self,
        direction: Direction,
        index: usize,
    ) -> Option<&mut [f64]> {
        let ports = match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        };
        ports.get_mut(index).map(|p| p.buffer.as_mut_slice())
    }
}

/// Uniform access to the block embedded in a device or compute block.
pub trait BlockIo: Send {
    fn block(&self) -> &Block;
    fn block_mut(&mut self) -> &mut Block;
}

/// Acquisition device: `read` runs at the top of every tick (hardware
/// into output ports), `write` at the bottom (input ports to hardware).
/// Both are gated by the registered slot's active flag.
pub trait Device: BlockIo {
    fn read(&mut self);
    fn write(&mut self);
}

/// Compute block, executed between device reads and writes, in
/// topological order, with fresh inputs propagated immediately before.
pub trait Thread: BlockIo {
    fn execute(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block::new(
            "probe",
            vec![
                Channel::input("in", "signal in", 1),
                Channel::output("out", "signal out", 2),
                Channel::input("gain", "scale factor", 3),
            ],
        )
    }

    #[test]
    fn ports_are_dense_per_direction() {
        let b = sample_block();
        assert_eq!(b.count(Direction::Input), 2);
        assert_eq!(b.count(Direction::Output), 1);
        assert_eq!(b.channel_name(Direction::Input, 0).unwrap(), "in");
        assert_eq!(b.channel_name(Direction::Input, 1).unwrap(), "gain");
        assert_eq!(b.channel_name(Direction::Output, 0).unwrap(), "out");
        assert_eq!(b.channel_width(Direction::Input, 1).unwrap(), 3);
    }

    #[test]
    fn out_of_range_index_is_invalid_argument() {
        let b = sample_block();
        assert_eq!(
            b.channel_name(Direction::Output, 1),
            Err(BlockError::NoSuchChannel {
                direction: Direction::Output,
                index: 1
            })
        );
        assert!(b.read_output(7).is_err());
    }

    #[test]
    fn write_input_checks_width() {
        let mut b = sample_block();
        assert_eq!(
            b.write_input(0, &[1.0, 2.0]),
            Err(BlockError::WidthMismatch {
                expected: 1,
                got: 2
            })
        );
        b.write_input(0, &[4.5]).unwrap();
        assert_eq!(b.read_input(0).unwrap(), &[4.5]);
    }

    #[test]
    fn output_round_trip() {
        let mut b = sample_block();
        b.write_output(0, &[1.0, -1.0]).unwrap();
        assert_eq!(b.read_output(0).unwrap(), &[1.0, -1.0]);
    }

    #[test]
    fn ids_are_unique_and_stable() {
        let a = sample_block();
        let b = sample_block();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.id());
    }
}

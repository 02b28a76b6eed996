use std::{error::Error, fmt};

use crate::block::{BlockId, Direction};

const ERR_MSG_QUEUE_FULL: &str = "queue is full";
const ERR_MSG_TRANSPORT_CLOSED: &str = "transport is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_DISCONNECTED: &str = "channel disconnected";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

/// Why a send failed. Carried inside [`SendError`] so callers can
/// distinguish back-pressure from a dead peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
        }
    }
}

/// Failed send. `value` hands the rejected element back to the caller
/// so nothing is lost on back-pressure.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Full,
        }
    }

    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
}

impl Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_DISCONNECTED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
        }
    }
}

/// Invalid-argument errors raised by [`crate::block::Block`] port accessors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockError {
    /// Port index out of range for the given direction.
    NoSuchChannel { direction: Direction, index: usize },
    /// Sample slice length does not match the declared channel width.
    WidthMismatch { expected: usize, got: usize },
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::NoSuchChannel { direction, index } => {
                write!(f, "no {direction:?} channel at index {index}")
            }
            BlockError::WidthMismatch { expected, got } => {
                write!(f, "channel width mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl Error for BlockError {}

/// Errors raised by [`crate::connector::Connector`] graph mutations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GraphError {
    /// The block is not registered with the connector.
    UnknownBlock(BlockId),
    /// The named port does not exist on the block.
    NoSuchPort {
        block: BlockId,
        direction: Direction,
        index: usize,
    },
    /// Source and destination channel widths differ.
    WidthMismatch { src: usize, dest: usize },
    /// The edge would close a cycle in the compute-block subgraph.
    Cycle,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::UnknownBlock(id) => write!(f, "block {} is not registered", id.0),
            GraphError::NoSuchPort {
                block,
                direction,
                index,
            } => write!(
                f,
                "block {} has no {direction:?} port at index {index}",
                block.0
            ),
            GraphError::WidthMismatch { src, dest } => {
                write!(f, "port width mismatch: source {src}, destination {dest}")
            }
            GraphError::Cycle => write!(f, "connection would create a cycle"),
        }
    }
}

impl Error for GraphError {}

/// OS-layer failures. Privilege problems are expected on developer
/// machines and downgrade the system to best-effort timing.
#[derive(Debug)]
pub enum OsError {
    /// Missing privileges (CAP_SYS_NICE / CAP_IPC_LOCK or root).
    Permission,
    /// The primitive is not available on this platform.
    Unsupported,
    Io(std::io::Error),
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::Permission => write!(f, "insufficient privileges"),
            OsError::Unsupported => write!(f, "not supported on this platform"),
            OsError::Io(e) => write!(f, "os error: {e}"),
        }
    }
}

impl Error for OsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OsError {
    fn from(e: std::io::Error) -> Self {
        OsError::Io(e)
    }
}

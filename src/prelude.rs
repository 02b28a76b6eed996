pub use crate::block::{Block, BlockId, BlockIo, Channel, Device, Direction, Thread};
pub use crate::config::SystemConfig;
pub use crate::connector::{BlockInfo, BlockKind, BlockMeta, Connection, Connector, propagate};
pub use crate::error::{BlockError, GraphError, OsError, RecvError, SendError, TryRecvError};
pub use crate::event::{Event, EventKind, Handler, Manager, Param};
pub use crate::io::base::{BaseRx, BaseTx};
pub use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
pub use crate::io::ringbuffer::{RingBuffer, RingReceiver, RingSender};
pub use crate::rt::os::{DEFAULT_PERIOD_NS, Pacer, Task};
pub use crate::rt::{RtErrorKind, System, TelemetryKind, TelemetryRecord};
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, try_pin_core};

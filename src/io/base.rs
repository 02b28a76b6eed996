use crate::error::{RecvError, SendError, TryRecvError};
use crate::utils::CancelToken;
use std::time::Duration;

/// Sending half of a typed transport.
pub trait BaseTx: Send + 'static {
    /// Element type carried by this transport.
    type EventType: Send + 'static;

    /// Non-blocking send. `Err` when the channel is full or closed;
    /// the element is handed back inside the error.
    fn try_send(&mut self, a: Self::EventType) -> Result<(), SendError<Self::EventType>>;

    /// Cooperative send with optional timeout and cancellation.
    fn send(
        &mut self,
        a: Self::EventType,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<Self::EventType>>;
}

/// Receiving half of a typed transport.
pub trait BaseRx: Send + 'static {
    /// Element type carried by this transport.
    type EventType: Send + 'static;

    /// Non-blocking receive. `Empty` when no data, `Disconnected` when
    /// the peer is gone.
    fn try_recv(&mut self) -> Result<Self::EventType, TryRecvError>;

    /// Cooperative receive with optional timeout and cancellation.
    fn recv(
        &mut self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Self::EventType, RecvError>;
}

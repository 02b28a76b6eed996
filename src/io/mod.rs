//! Transports between the non-realtime world and the RT task.
//!
//! Two flavors: the SPSC [`ringbuffer`] pair that crosses the RT
//! boundary (wait-free on the consumer side), and the general-purpose
//! [`mpmc`] channel used for the event queue and acknowledgements.

pub mod base;
pub mod mpmc;
pub mod ringbuffer;

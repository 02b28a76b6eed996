use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::base::{BaseRx, BaseTx};
use crate::utils::CancelToken;
use crossbeam::utils::Backoff;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::{Observer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::thread;
use std::time::{Duration, Instant};

/// Single-producer/single-consumer ring used across the RT boundary.
///
/// `try_send`/`try_recv` never block and never allocate, which is what
/// the RT side uses; the cooperative `send`/`recv` paths are for the
/// host side, which is allowed to spin and sleep on back-pressure.
pub struct RingBuffer;

impl RingBuffer {
    /// Create a bounded pair. Capacity is rounded up to a power of two.
    pub fn bounded<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
        let rb = HeapRb::<T>::new(capacity.max(2).next_power_of_two());
        let (prod, cons) = rb.split();
        (RingSender { prod }, RingReceiver { cons })
    }
}

pub struct RingSender<T> {
    prod: HeapProd<T>,
}

impl<T> RingSender<T> {
    /// Number of free slots currently visible to the producer.
    pub fn vacant(&self) -> usize {
        self.prod.vacant_len()
    }
}

impl<T: Send + 'static> BaseTx for RingSender<T> {
    type EventType = T;

    #[inline]
    fn try_send(&mut self, a: T) -> Result<(), SendError<T>> {
        self.prod.try_push(a).map_err(|v| SendError::full(Some(v)))
    }

    fn send(
        &mut self,
        mut a: T,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<T>> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(SendError::timeout(Some(a)));
            }

            match self.prod.try_push(a) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    a = rejected;
                    spins = spins.saturating_add(1);
                    if spins < 64 {
                        backoff.spin();
                    } else if spins < 256 {
                        backoff.snooze();
                    } else {
                        thread::sleep(Duration::from_micros(2));
                    }
                }
            }
        }
    }
}

pub struct RingReceiver<T> {
    cons: HeapCons<T>,
}

impl<T: Send + 'static> BaseRx for RingReceiver<T> {
    type EventType = T;

    #[inline]
    fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.cons.try_pop().ok_or(TryRecvError::Empty)
    }

    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<T, RecvError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(RecvError::Timeout);
            }

            match self.cons.try_pop() {
                Some(a) => return Ok(a),
                None => {
                    spins = spins.saturating_add(1);
                    if spins < 64 {
                        backoff.spin();
                    } else if spins < 256 {
                        backoff.snooze();
                    } else {
                        thread::sleep(Duration::from_micros(2));
                    }
                }
            }
        }
    }
}

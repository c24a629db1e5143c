//! Packet delivery: executor trampoline and bounded queues.
//!
//! Two disciplines exist, switchable at runtime via `ConfigFlag::ManualRead`:
//!
//! - **Pull**: packets land in the `manual` FIFO and the consumer drains it
//!   with `read_packet`.
//! - **Push**: packets are handed to the registered callback through the
//!   [`DeliveryExecutor`] captured when the connection was wrapped. Until a
//!   callback is registered, packets accumulate in the `pending` FIFO and
//!   are drained synchronously at registration.
//!
//! Both queues are bounded; a full queue stalls the reader thread, which
//! stops draining the socket. That stall is the channel's only form of
//! backpressure.

use std::collections::VecDeque;

use crate::core::packet::Packet;

/// Trampoline that runs delivery callbacks on the consumer's preferred
/// context.
///
/// Captured at wrap time. Callbacks must not assume thread identity: they
/// may run on the reader thread or wherever the executor schedules them.
pub trait DeliveryExecutor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Default executor: runs the job immediately on the invoking thread.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl DeliveryExecutor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

/// A received packet plus the number of bytes it occupied on the wire.
pub type Delivery = (Packet, usize);

/// The two bounded FIFOs behind both delivery disciplines.
///
/// Guarded by the connection lock of the owning connection; toggling the
/// discipline migrates entries between the queues without reordering.
#[derive(Debug)]
pub struct DeliveryQueues {
    manual: VecDeque<Delivery>,
    pending: VecDeque<Delivery>,
    capacity: usize,
}

impl DeliveryQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            manual: VecDeque::with_capacity(capacity),
            pending: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether the queue for the given discipline has room.
    pub fn has_room(&self, manual_read: bool) -> bool {
        let queue = if manual_read {
            &self.manual
        } else {
            &self.pending
        };
        queue.len() < self.capacity
    }

    /// Enqueue for the given discipline. Caller checked `has_room`.
    pub fn push(&mut self, manual_read: bool, delivery: Delivery) {
        if manual_read {
            self.manual.push_back(delivery);
        } else {
            self.pending.push_back(delivery);
        }
    }

    /// Pop the head of the manual FIFO.
    pub fn pop_manual(&mut self) -> Option<Delivery> {
        self.manual.pop_front()
    }

    /// Drain everything waiting for a late-registered callback, in order.
    pub fn drain_pending(&mut self) -> Vec<Delivery> {
        self.pending.drain(..).collect()
    }

    /// Move all entries to the queue matching the new discipline, FIFO
    /// preserved.
    pub fn migrate(&mut self, manual_read: bool) {
        if manual_read {
            self.manual.append(&mut self.pending);
        } else {
            self.pending.append(&mut self.manual);
        }
    }

    pub fn manual_len(&self) -> usize {
        self.manual.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

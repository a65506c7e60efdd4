//! Host-bus cycle service.
//!
//! [`BusResponder`] is the hot path: given the sampled address and
//! direction of a host cycle it either drives the data lines from the cell
//! map or latches the data lines into it, honouring the per-cell attribute
//! bits. Accesses that hit one of the controller's alias registers
//! additionally publish a [`BusEvent`] on the [`EventQueue`].
//!
//! The queue is single-producer (the bus lane) / single-consumer (the
//! controller thread). It never blocks the producer: each watched register
//! has one slot, and a newer unconsumed event for a register simply replaces
//! the older one. The controller is expected to drain between host accesses;
//! publication happens under the queue lock, so a consumed event's cell
//! value is always visible to the consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use memory::MemoryMap;
use tracing::trace;

/// Direction of the host cycle that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// One alias-register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusEvent {
    pub addr: u16,
    pub access: Access,
    /// For writes, the byte the host put on the bus; for reads, the byte
    /// driven back (0 when the cell did not drive).
    pub value: u8,
}

/// A watched register address with its host-write mask. Bits outside the
/// mask keep their controller-maintained cell value on host writes.
#[derive(Debug, Clone, Copy)]
pub struct Tap {
    pub addr: u16,
    pub write_mask: u8,
}

struct QueueState {
    events: VecDeque<BusEvent>,
    closed: bool,
}

/// Bounded alias-event channel.
///
/// When the channel is full, the incoming event replaces the oldest pending
/// event for the same register (or, with no pending event for that register,
/// the oldest event overall) rather than blocking the bus lane.
pub struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Deep enough that the longest command burst (9 UDR writes) never evicts
/// anything while the controller is catching up.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

impl EventQueue {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0);
        Arc::new(Self {
            capacity,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Publish an event without ever blocking the producer.
    pub fn push(&self, event: BusEvent) {
        let mut state = self.state.lock().expect("queue poisoned");
        if state.closed {
            return;
        }
        if state.events.len() == self.capacity {
            let evicted = match state.events.iter().position(|e| e.addr == event.addr) {
                Some(i) => state.events.remove(i),
                None => state.events.pop_front(),
            };
            if let Some(evicted) = evicted {
                trace!(addr = evicted.addr, "alias event dropped on overflow");
            }
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
    }

    /// Block until an event is available or the queue is closed.
    pub fn pop(&self) -> Option<BusEvent> {
        let mut state = self.state.lock().expect("queue poisoned");
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).expect("queue poisoned");
        }
    }

    /// Like [`EventQueue::pop`] but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<BusEvent> {
        let mut state = self.state.lock().expect("queue poisoned");
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            let (next, res) = self
                .ready
                .wait_timeout(state, timeout)
                .expect("queue poisoned");
            state = next;
            if res.timed_out() {
                return state.events.pop_front();
            }
        }
    }

    /// Take a pending event without blocking.
    pub fn try_pop(&self) -> Option<BusEvent> {
        self.state
            .lock()
            .expect("queue poisoned")
            .events
            .pop_front()
    }

    /// Unblock the consumer permanently.
    pub fn close(&self) {
        self.state.lock().expect("queue poisoned").closed = true;
        self.ready.notify_all();
    }
}

/// Services host bus cycles against the cell map.
pub struct BusResponder {
    mem: Arc<MemoryMap>,
    taps: Vec<Tap>,
    queue: Arc<EventQueue>,
}

impl BusResponder {
    pub fn new(mem: Arc<MemoryMap>, taps: Vec<Tap>, queue: Arc<EventQueue>) -> Self {
        Self { mem, taps, queue }
    }

    fn tap_of(&self, addr: u16) -> Option<&Tap> {
        self.taps.iter().find(|t| t.addr == addr)
    }

    /// A host read cycle. Returns the byte driven onto the bus, or `None`
    /// when the cell is disabled and the bus floats.
    pub fn read(&self, addr: u16) -> Option<u8> {
        let driven = if self.mem.is_enabled(addr) {
            Some(self.mem.data(addr))
        } else {
            None
        };
        if self.tap_of(addr).is_some() {
            self.queue.push(BusEvent {
                addr,
                access: Access::Read,
                value: driven.unwrap_or(0),
            });
        }
        driven
    }

    /// A host write cycle. Register cells latch through their write mask;
    /// plain cells latch only when enabled and writeable. Returns whether
    /// anything was latched.
    pub fn write(&self, addr: u16, value: u8) -> bool {
        let latched = if let Some(tap) = self.tap_of(addr) {
            if tap.write_mask != 0 {
                let kept = self.mem.data(addr) & !tap.write_mask;
                self.mem.write_cell(addr, kept | (value & tap.write_mask));
            }
            self.queue.push(BusEvent {
                addr,
                access: Access::Write,
                value,
            });
            tap.write_mask != 0
        } else if self.mem.is_enabled(addr) && self.mem.is_writeable(addr) {
            self.mem.write_cell(addr, value);
            true
        } else {
            false
        };
        latched
    }
}

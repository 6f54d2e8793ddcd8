//! Packet Rings
//!
//! Bounded FIFO transport between pipeline stages.
//!
//! The backing queue is a lock-free `ArrayQueue`; the declared mode records
//! the fan-in/fan-out degree the topology wired it for, and `validate`
//! rejects a ring whose attachments exceed that mode.

use crate::buffer::Packet;
use crate::error::{PipelineError, Result};
use crossbeam::queue::ArrayQueue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ring concurrency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingMode {
    /// Single producer, single consumer
    SpSc,
    /// Multi producer, single consumer
    MpSc,
    /// Single producer, multi consumer
    SpMc,
    /// Multi producer, multi consumer
    MpMc,
}

impl RingMode {
    /// Mode matching a producer/consumer degree
    pub fn for_degree(producers: usize, consumers: usize) -> Self {
        match (producers > 1, consumers > 1) {
            (false, false) => RingMode::SpSc,
            (true, false) => RingMode::MpSc,
            (false, true) => RingMode::SpMc,
            (true, true) => RingMode::MpMc,
        }
    }

    /// Whether more than one producer may attach
    pub fn multi_producer(&self) -> bool {
        matches!(self, RingMode::MpSc | RingMode::MpMc)
    }

    /// Whether more than one consumer may attach
    pub fn multi_consumer(&self) -> bool {
        matches!(self, RingMode::SpMc | RingMode::MpMc)
    }
}

impl fmt::Display for RingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RingMode::SpSc => "SP/SC",
            RingMode::MpSc => "MP/SC",
            RingMode::SpMc => "SP/MC",
            RingMode::MpMc => "MP/MC",
        };
        f.write_str(s)
    }
}

/// Result of one burst enqueue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Burst {
    /// Packets accepted
    pub packets: u64,
    /// Payload bytes accepted
    pub bytes: u64,
}

/// Bounded packet ring
pub struct Ring {
    name: String,
    mode: RingMode,
    queue: ArrayQueue<Packet>,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

impl Ring {
    /// Create a ring; capacity must be a non-zero power of two
    pub fn new(name: impl Into<String>, capacity: usize, mode: RingMode) -> Result<Self> {
        let name = name.into();
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(PipelineError::RingAlloc {
                name,
                reason: format!("capacity {} is not a non-zero power of two", capacity),
            });
        }

        Ok(Self {
            name,
            mode,
            queue: ArrayQueue::new(capacity),
            producers: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
        })
    }

    /// Ring name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared mode
    pub fn mode(&self) -> RingMode {
        self.mode
    }

    /// Capacity in packets
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Packets currently resident
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Register a producer side
    pub fn attach_producer(&self) {
        self.producers.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a consumer side
    pub fn attach_consumer(&self) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
    }

    /// Attached producers
    pub fn producers(&self) -> usize {
        self.producers.load(Ordering::Relaxed)
    }

    /// Attached consumers
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    /// Check the wiring against the declared mode
    pub fn validate(&self) -> Result<()> {
        let producers = self.producers();
        let consumers = self.consumers();
        let ok = producers >= 1
            && consumers >= 1
            && (producers == 1 || self.mode.multi_producer())
            && (consumers == 1 || self.mode.multi_consumer());

        if ok {
            Ok(())
        } else {
            Err(PipelineError::RingMode {
                name: self.name.clone(),
                mode: self.mode.to_string(),
                producers,
                consumers,
            })
        }
    }

    /// Move packets from the front of `pkts` onto the ring until it is full
    #[inline]
    pub fn enqueue_burst(&self, pkts: &mut VecDeque<Packet>) -> Burst {
        let mut burst = Burst::default();
        while let Some(pkt) = pkts.pop_front() {
            let len = pkt.len() as u64;
            match self.queue.push(pkt) {
                Ok(()) => {
                    burst.packets += 1;
                    burst.bytes += len;
                }
                Err(pkt) => {
                    pkts.push_front(pkt);
                    break;
                }
            }
        }
        burst
    }

    /// Dequeue up to `max` packets into `out`, returning the count
    #[inline]
    pub fn dequeue_burst(&self, out: &mut Vec<Packet>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.queue.pop() {
                Some(pkt) => {
                    out.push(pkt);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Remove and drop every resident packet, returning the count
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.queue.pop().is_some() {
            n += 1;
        }
        n
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

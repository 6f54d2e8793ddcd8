//! Reorder Buffer
//!
//! Sliding-window buffer that accepts sequenced packets in any order and
//! releases them in strictly ascending sequence order.
//!
//! # Layout
//!
//! ```text
//!   ready queue (≤ W)          order table (W slots, indexed by seqn & mask)
//! ┌───┬───┬───┐          ┌─────┬─────┬─────┬─────┬─────┬─────┐
//! │ 7 │ 8 │ 10│ ◀─slide─ │ min │     │ m+2 │ m+3 │     │ ... │
//! └───┴───┴───┘          └─────┴─────┴─────┴─────┴─────┴─────┘
//! ```
//!
//! Sequence numbers are compared modulo 2^32, so the window keeps working
//! across counter wraparound. A packet `W..2W` ahead of `min_seqn` slides
//! the window forward: present entries move to the ready queue in order,
//! missing ones are skipped and counted as lost.

use crate::buffer::Packet;
use std::collections::VecDeque;
use thiserror::Error;

/// Largest supported window
pub const MAX_WINDOW: usize = 1 << 30;

/// Why an insertion was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertErrorKind {
    /// Late packet, occupied slot, or no room to slide the window
    #[error("no space in reorder window")]
    NoSpace,
    /// Sequence number at or beyond `min_seqn + 2W`
    #[error("sequence number out of range")]
    OutOfRange,
}

/// Refused insertion; hands the packet back to the caller
#[derive(Debug, Error)]
#[error("{kind} (seqn {})", .packet.seqn())]
pub struct InsertError {
    /// Failure class
    pub kind: InsertErrorKind,
    /// The packet that could not be stored
    pub packet: Packet,
}

/// Reorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets stored
    pub inserted: u64,
    /// Packets released in order
    pub drained: u64,
    /// Insertions refused with no space
    pub no_space: u64,
    /// Insertions refused as out of range
    pub out_of_range: u64,
    /// Sequence numbers skipped by a window slide
    pub lost: u64,
    /// Gaps detected by drain verification
    pub order_errors: u64,
}

/// Reorder buffer
pub struct ReorderBuffer {
    size: usize,
    mask: u32,
    min_seqn: u32,
    order: Vec<Option<Packet>>,
    ready: VecDeque<Packet>,
    resident: usize,
    verify: bool,
    last_emitted: Option<u32>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    /// Create a window of `size` slots expecting `first_seqn` first
    pub fn new(size: usize, first_seqn: u32) -> Option<Self> {
        if size == 0 || !size.is_power_of_two() || size > MAX_WINDOW {
            return None;
        }

        let mut order = Vec::with_capacity(size);
        order.resize_with(size, || None);

        Some(Self {
            size,
            mask: (size - 1) as u32,
            min_seqn: first_seqn,
            order,
            ready: VecDeque::with_capacity(size),
            resident: 0,
            verify: false,
            last_emitted: None,
            stats: ReorderStats::default(),
        })
    }

    /// Enable drain verification
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Window size W
    pub fn size(&self) -> usize {
        self.size
    }

    /// Next sequence number eligible for the order table
    pub fn min_seqn(&self) -> u32 {
        self.min_seqn
    }

    /// Packets held (ready queue plus order table)
    pub fn len(&self) -> usize {
        self.resident
    }

    /// Check if nothing is held
    pub fn is_empty(&self) -> bool {
        self.resident == 0
    }

    /// Counters
    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Store a packet in its window slot
    pub fn insert(&mut self, pkt: Packet) -> Result<(), InsertError> {
        let distance = pkt.seqn().wrapping_sub(self.min_seqn);
        if (distance as i32) < 0 {
            return self.refuse(pkt, InsertErrorKind::NoSpace);
        }

        let offset = distance as usize;
        if offset >= 2 * self.size {
            return self.refuse(pkt, InsertErrorKind::OutOfRange);
        }

        if offset >= self.size && !self.slide(offset - self.size + 1) {
            return self.refuse(pkt, InsertErrorKind::NoSpace);
        }

        let slot = (pkt.seqn() & self.mask) as usize;
        if self.order[slot].is_some() {
            return self.refuse(pkt, InsertErrorKind::NoSpace);
        }

        self.order[slot] = Some(pkt);
        self.resident += 1;
        self.stats.inserted += 1;
        Ok(())
    }

    /// Release up to `max` in-order packets into `out`
    pub fn drain(&mut self, out: &mut Vec<Packet>, max: usize) -> usize {
        let start = out.len();

        while out.len() - start < max {
            match self.ready.pop_front() {
                Some(pkt) => out.push(pkt),
                None => break,
            }
        }

        while out.len() - start < max {
            let slot = (self.min_seqn & self.mask) as usize;
            match self.order[slot].take() {
                Some(pkt) => {
                    out.push(pkt);
                    self.min_seqn = self.min_seqn.wrapping_add(1);
                }
                None => break,
            }
        }

        let n = out.len() - start;
        self.resident -= n;
        self.stats.drained += n as u64;

        if self.verify {
            self.verify_drained(&out[start..]);
        }
        n
    }

    /// Remove every held packet regardless of order (teardown)
    pub fn drain_all(&mut self) -> Vec<Packet> {
        let mut out: Vec<Packet> = self.ready.drain(..).collect();
        out.extend(self.order.iter_mut().filter_map(Option::take));
        self.resident = 0;
        out
    }

    /// Advance `min_seqn` by `count` slots, moving present entries to the
    /// ready queue. Returns false, leaving the window untouched, if the
    /// ready queue cannot take every present entry.
    fn slide(&mut self, count: usize) -> bool {
        let present = (0..count as u32)
            .filter(|i| self.order[(self.min_seqn.wrapping_add(*i) & self.mask) as usize].is_some())
            .count();
        if self.ready.len() + present > self.size {
            return false;
        }

        for _ in 0..count {
            let slot = (self.min_seqn & self.mask) as usize;
            match self.order[slot].take() {
                Some(pkt) => self.ready.push_back(pkt),
                None => self.stats.lost += 1,
            }
            self.min_seqn = self.min_seqn.wrapping_add(1);
        }
        true
    }

    fn refuse(&mut self, packet: Packet, kind: InsertErrorKind) -> Result<(), InsertError> {
        match kind {
            InsertErrorKind::NoSpace => self.stats.no_space += 1,
            InsertErrorKind::OutOfRange => self.stats.out_of_range += 1,
        }
        Err(InsertError { kind, packet })
    }

    fn verify_drained(&mut self, drained: &[Packet]) {
        for pkt in drained {
            let seqn = pkt.seqn();
            if let Some(last) = self.last_emitted {
                let expected = last.wrapping_add(1);
                if seqn != expected {
                    self.stats.order_errors += 1;
                    tracing::error!(expected, got = seqn, "reorder output gap");
                }
            }
            self.last_emitted = Some(seqn);
        }
    }
}

impl std::fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("size", &self.size)
            .field("min_seqn", &self.min_seqn)
            .field("resident", &self.resident)
            .field("ready", &self.ready.len())
            .finish()
    }
}

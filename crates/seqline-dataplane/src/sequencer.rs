//! Ingress Sequencer
//!
//! Stamps a contiguous sequence number onto every packet entering the
//! pipeline. The counter wraps modulo 2^32; the reorder buffer compares
//! sequence numbers with the same modular arithmetic.

use crate::buffer::Packet;

/// First sequence number issued by a fresh sequencer
pub const SEQN_START: u32 = 0;

/// Per-pipeline sequence counter
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: u32,
    issued: u64,
}

impl Sequencer {
    /// Create a sequencer starting at zero
    pub fn new() -> Self {
        Self::starting_at(SEQN_START)
    }

    /// Create a sequencer starting at `first`
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: first,
            issued: 0,
        }
    }

    /// Stamp `pkts` with `next, next+1, ...` in arrival order
    #[inline]
    pub fn stamp(&mut self, pkts: &mut [Packet]) {
        for pkt in pkts.iter_mut() {
            pkt.set_seqn(self.next);
            self.next = self.next.wrapping_add(1);
        }
        self.issued += pkts.len() as u64;
    }

    /// Next sequence number to be issued
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Total numbers issued since creation
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Vec<Packet> {
        (0..n).map(|_| Packet::new(b"payload")).collect()
    }

    #[test]
    fn test_contiguous_batches() {
        let mut seq = Sequencer::new();
        let mut a = batch(5);
        let mut b = batch(3);

        seq.stamp(&mut a);
        seq.stamp(&mut b);

        let got: Vec<u32> = a.iter().chain(b.iter()).map(|p| p.seqn()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(seq.peek(), 8);
        assert_eq!(seq.issued(), 8);
    }

    #[test]
    fn test_empty_batch() {
        let mut seq = Sequencer::starting_at(10);
        seq.stamp(&mut []);
        assert_eq!(seq.peek(), 10);
        assert_eq!(seq.issued(), 0);
    }

    #[test]
    fn test_wraparound() {
        let mut seq = Sequencer::starting_at(u32::MAX - 1);
        let mut pkts = batch(4);
        seq.stamp(&mut pkts);

        let got: Vec<u32> = pkts.iter().map(|p| p.seqn()).collect();
        assert_eq!(got, vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(seq.peek(), 2);
    }
}

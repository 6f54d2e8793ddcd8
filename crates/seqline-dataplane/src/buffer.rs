//! Packet Buffers
//!
//! Owned packet handles moved between rings, stages and the accelerator.
//!
//! # Design
//!
//! - `Packet` is not `Clone`: exactly one owner at any instant
//! - Enqueue moves the handle, so a buffer can never sit on two rings
//! - Dropping the handle releases the payload back to the allocator
//! - A filtered packet is marked, not removed, so its sequence number still
//!   reaches the reorder buffer and the egress core frees it in order

use bytes::{Bytes, BytesMut};
use std::time::Instant;

/// Largest payload accepted from an ingress source (jumbo frame)
pub const MAX_PACKET_SIZE: usize = 9216;

/// Packet handle
#[derive(Debug)]
pub struct Packet {
    /// Sequence number assigned on ingress
    seqn: u32,
    /// Arrival time (set by the ingress source or a timestamp stage)
    rx_timestamp: Option<Instant>,
    /// Release time (set on egress)
    tx_timestamp: Option<Instant>,
    /// Marked for discard by a stage
    dropped: bool,
    /// Payload
    data: BytesMut,
}

impl Packet {
    /// Create a packet owning a copy of `payload`
    pub fn new(payload: &[u8]) -> Self {
        Self::from_bytes(BytesMut::from(payload))
    }

    /// Create a packet from an already owned buffer
    pub fn from_bytes(data: BytesMut) -> Self {
        Self {
            seqn: 0,
            rx_timestamp: None,
            tx_timestamp: None,
            dropped: false,
            data,
        }
    }

    /// Get packet data slice
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable packet data
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Get data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sequence number
    #[inline(always)]
    pub fn seqn(&self) -> u32 {
        self.seqn
    }

    /// Overwrite the sequence number
    #[inline(always)]
    pub fn set_seqn(&mut self, seqn: u32) {
        self.seqn = seqn;
    }

    /// Arrival timestamp
    pub fn rx_timestamp(&self) -> Option<Instant> {
        self.rx_timestamp
    }

    /// Stamp arrival time
    pub fn stamp_rx(&mut self, at: Instant) {
        self.rx_timestamp = Some(at);
    }

    /// Release timestamp
    pub fn tx_timestamp(&self) -> Option<Instant> {
        self.tx_timestamp
    }

    /// Stamp release time
    pub fn stamp_tx(&mut self, at: Instant) {
        self.tx_timestamp = Some(at);
    }

    /// Mark for discard at egress
    #[inline(always)]
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    /// Whether a stage marked this packet for discard
    #[inline(always)]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Time spent between arrival and release, if both are known
    pub fn latency(&self) -> Option<std::time::Duration> {
        match (self.rx_timestamp, self.tx_timestamp) {
            (Some(rx), Some(tx)) => Some(tx.saturating_duration_since(rx)),
            _ => None,
        }
    }

    /// Consume the handle and freeze the payload
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

/// Total payload bytes in a burst
#[inline]
pub fn burst_bytes(pkts: &[Packet]) -> u64 {
    pkts.iter().map(|p| p.len() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_packet_fields() {
        let mut pkt = Packet::new(b"GET /index.html");
        assert_eq!(pkt.len(), 15);
        assert!(!pkt.is_empty());
        assert_eq!(pkt.seqn(), 0);

        pkt.set_seqn(42);
        assert_eq!(pkt.seqn(), 42);

        assert!(!pkt.is_dropped());
        pkt.mark_dropped();
        assert!(pkt.is_dropped());
    }

    #[test]
    fn test_in_place_transform() {
        let mut pkt = Packet::new(b"abc");
        pkt.data_mut().make_ascii_uppercase();
        pkt.data_mut().extend_from_slice(b"!");
        assert_eq!(pkt.data(), b"ABC!");
        assert_eq!(pkt.into_bytes().as_ref(), b"ABC!");
    }

    #[test]
    fn test_latency() {
        let mut pkt = Packet::new(b"x");
        assert!(pkt.latency().is_none());

        let rx = Instant::now();
        pkt.stamp_rx(rx);
        pkt.stamp_tx(rx + Duration::from_micros(5));
        assert_eq!(pkt.latency(), Some(Duration::from_micros(5)));
    }

    #[test]
    fn test_burst_bytes() {
        let pkts = vec![Packet::new(&[0u8; 64]), Packet::new(&[0u8; 100])];
        assert_eq!(burst_bytes(&pkts), 164);
    }
}

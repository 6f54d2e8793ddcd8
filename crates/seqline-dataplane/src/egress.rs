//! Egress Sinks
//!
//! Receive packets in restored order from the ingress core.

use crate::buffer::Packet;
use crate::error::Result;

/// Consumer of in-order packets
pub trait EgressSink: Send {
    /// Sink name for logs
    fn name(&self) -> &str;

    /// Take ownership of a burst, already in sequence order
    fn tx_burst(&mut self, pkts: &mut Vec<Packet>) -> Result<usize>;
}

/// Frees everything it receives
#[derive(Debug, Default)]
pub struct DiscardSink {
    packets: u64,
    bytes: u64,
}

impl DiscardSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets freed
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Payload bytes freed
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl EgressSink for DiscardSink {
    fn name(&self) -> &str {
        "discard"
    }

    fn tx_burst(&mut self, pkts: &mut Vec<Packet>) -> Result<usize> {
        let n = pkts.len();
        self.packets += n as u64;
        self.bytes += crate::buffer::burst_bytes(pkts);
        pkts.clear();
        Ok(n)
    }
}

/// Keeps every packet it receives
#[derive(Debug, Default)]
pub struct CollectSink {
    packets: Vec<Packet>,
}

impl CollectSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets collected so far
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Sequence numbers in arrival order
    pub fn seqns(&self) -> Vec<u32> {
        self.packets.iter().map(Packet::seqn).collect()
    }

    /// Take the collected packets
    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

impl EgressSink for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn tx_burst(&mut self, pkts: &mut Vec<Packet>) -> Result<usize> {
        let n = pkts.len();
        self.packets.append(pkts);
        Ok(n)
    }
}

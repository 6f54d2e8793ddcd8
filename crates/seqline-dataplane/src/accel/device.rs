//! Regex device contract
//!
//! What a matching backend (hardware or software) must provide. Ops carry
//! their packet; the device hands both back in the response, possibly in a
//! different order than they were submitted.

use crate::buffer::Packet;
use std::collections::VecDeque;

/// Rule groups an op can select
pub const MAX_GROUPS: usize = 4;

bitflags::bitflags! {
    /// Response flag bits
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct RspFlags: u16 {
        /// Scan exceeded its time budget
        const MAX_SCAN_TIMEOUT = 1 << 0;
        /// More matches than the configured limit
        const MAX_MATCH = 1 << 1;
        /// Prefix table exhausted
        const MAX_PREFIX = 1 << 2;
        /// Device resources exceeded (e.g. oversized payload)
        const RESOURCE_LIMIT = 1 << 3;
    }
}

/// In-flight matching request
#[derive(Debug)]
pub struct RegexOp {
    /// Tag identifying the op within its queue
    pub user_id: u64,
    /// Selected rule groups (0 = unused slot)
    pub group_ids: [u16; MAX_GROUPS],
    /// Packet being scanned
    pub packet: Packet,
}

impl RegexOp {
    /// Whether rules of `group` apply to this op
    #[inline]
    pub fn selects(&self, group: u16) -> bool {
        group != 0 && self.group_ids.contains(&group)
    }
}

/// One rule hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegexMatch {
    /// Matching rule
    pub rule_id: u32,
    /// Byte offset of the match
    pub start: u32,
    /// Match length in bytes
    pub len: u32,
}

/// Completed op
#[derive(Debug)]
pub struct RegexResponse {
    /// The submitted op, packet included
    pub op: RegexOp,
    /// Error flags
    pub flags: RspFlags,
    /// Matches found, at most the device limit
    pub matches: Vec<RegexMatch>,
}

/// Completion classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Scan finished; number of matches
    Valid(usize),
    /// Scan time budget exceeded
    Timeout,
    /// Match limit exceeded
    MaxMatch,
    /// Prefix table exhausted
    MaxPrefix,
    /// Payload too large for the device
    ResourceLimit,
}

impl RegexResponse {
    /// Classify by flag priority: timeout, max-match, max-prefix, resource
    pub fn completion(&self) -> Completion {
        if self.flags.contains(RspFlags::MAX_SCAN_TIMEOUT) {
            Completion::Timeout
        } else if self.flags.contains(RspFlags::MAX_MATCH) {
            Completion::MaxMatch
        } else if self.flags.contains(RspFlags::MAX_PREFIX) {
            Completion::MaxPrefix
        } else if self.flags.contains(RspFlags::RESOURCE_LIMIT) {
            Completion::ResourceLimit
        } else {
            Completion::Valid(self.matches.len())
        }
    }
}

/// Static device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend name
    pub name: &'static str,
    /// Queue pairs available
    pub max_queue_pairs: usize,
    /// Matches reported per op at most
    pub max_matches: usize,
    /// Largest payload scanned
    pub max_payload: usize,
}

/// Matching backend
///
/// One producer and one consumer per queue id: the worker owning that
/// queue.
pub trait RegexDevice: Send + Sync {
    /// Capabilities
    fn info(&self) -> DeviceInfo;

    /// Hand ops from the front of `ops` to queue `qid`; returns the number
    /// accepted. Never blocks.
    fn enqueue_burst(&self, qid: usize, ops: &mut VecDeque<RegexOp>) -> usize;

    /// Move up to `max` completed ops of queue `qid` into `out`. Never
    /// blocks.
    fn dequeue_burst(&self, qid: usize, out: &mut Vec<RegexResponse>, max: usize) -> usize;

    /// Stop processing and release device resources
    fn stop(&self);
}

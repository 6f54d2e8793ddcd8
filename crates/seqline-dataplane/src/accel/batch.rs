//! Accelerator batch engine
//!
//! Per-worker submission/completion bookkeeping for one device queue.
//!
//! ```text
//!   submit ──▶ Filling ──(batch full)──▶ Pushing ⇄ Pulling ──▶ Idle
//! ```
//!
//! Callers follow one rule: after `submit` returns `BatchFull`, call
//! `force_push`; otherwise call `pull` so completions keep flowing while
//! the local batch fills.

use super::device::{Completion, RegexDevice, RegexOp, RegexResponse, MAX_GROUPS};
use crate::buffer::Packet;
use crate::stats::RegexStats;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Batch queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// No ops pending or being pushed
    Idle,
    /// Local batch holds unsubmitted ops
    Filling,
    /// Handing the batch to the device
    Pushing,
    /// Collecting completions
    Pulling,
}

/// Result of `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitSignal {
    /// Op stored, batch not yet full
    Queued,
    /// Batch reached its size; caller must `force_push`
    BatchFull,
}

/// Result of `drain_on_shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every submitted op completed
    Complete,
    /// Watchdog fired before every op completed
    WatchdogExpired {
        /// Ops accepted by the device and never completed
        outstanding: u64,
        /// Ops the device never accepted; their packets were returned
        unsubmitted: u64,
    },
}

/// Submission batch bound to one device queue
pub struct BatchQueue {
    qid: usize,
    device: Arc<dyn RegexDevice>,
    batch_size: usize,
    group_ids: [u16; MAX_GROUPS],
    pending: VecDeque<RegexOp>,
    responses: Vec<RegexResponse>,
    buf_id: u64,
    total_enqueued: u64,
    total_dequeued: u64,
    state: BatchState,
    stats: RegexStats,
    waiting_since: Option<Instant>,
}

impl BatchQueue {
    /// Create a queue submitting in batches of `batch_size`
    pub fn new(
        qid: usize,
        device: Arc<dyn RegexDevice>,
        batch_size: usize,
        group_ids: [u16; MAX_GROUPS],
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            qid,
            device,
            batch_size,
            group_ids,
            pending: VecDeque::with_capacity(batch_size),
            responses: Vec::with_capacity(batch_size),
            buf_id: 0,
            total_enqueued: 0,
            total_dequeued: 0,
            state: BatchState::Idle,
            stats: RegexStats::default(),
            waiting_since: None,
        }
    }

    /// Device queue id
    pub fn qid(&self) -> usize {
        self.qid
    }

    /// Ops per submission batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Current state
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Ops waiting in the local batch
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Ops handed to the device and not yet completed
    pub fn in_flight(&self) -> u64 {
        self.total_enqueued - self.total_dequeued
    }

    /// Ops accepted by the device so far
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    /// Ops completed so far
    pub fn total_dequeued(&self) -> u64 {
        self.total_dequeued
    }

    /// Completion counters
    pub fn stats(&self) -> RegexStats {
        self.stats
    }

    /// Add a packet to the local batch
    pub fn submit(&mut self, packet: Packet) -> SubmitSignal {
        self.buf_id += 1;
        self.pending.push_back(RegexOp {
            user_id: self.buf_id,
            group_ids: self.group_ids,
            packet,
        });
        self.state = BatchState::Filling;

        if self.pending.len() >= self.batch_size {
            SubmitSignal::BatchFull
        } else {
            SubmitSignal::Queued
        }
    }

    /// Hand the whole local batch to the device, pulling completions into
    /// `completed` whenever the device pushes back. Returns ops accepted.
    pub fn force_push(&mut self, completed: &mut Vec<Packet>) -> usize {
        self.force_push_while(completed, || true)
    }

    /// `force_push` that stops retrying once `keep_going` returns false.
    /// Ops the device refused stay pending.
    pub fn force_push_while(
        &mut self,
        completed: &mut Vec<Packet>,
        mut keep_going: impl FnMut() -> bool,
    ) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let mut accepted = 0;
        let mut busy_since: Option<Instant> = None;

        loop {
            self.state = BatchState::Pushing;
            let n = self.device.enqueue_burst(self.qid, &mut self.pending);
            accepted += n;
            self.total_enqueued += n as u64;

            if self.pending.is_empty() {
                break;
            }

            busy_since.get_or_insert_with(Instant::now);
            self.pull(completed);
            if !keep_going() {
                tracing::debug!(
                    qid = self.qid,
                    pending = self.pending.len(),
                    "push abandoned with ops still pending"
                );
                break;
            }
            std::hint::spin_loop();
        }

        if let Some(since) = busy_since {
            self.stats.tx_busy += since.elapsed();
        }
        self.state = if self.pending.is_empty() {
            BatchState::Idle
        } else {
            BatchState::Filling
        };
        accepted
    }

    /// Collect ready completions without blocking; returns ops completed
    pub fn pull(&mut self, completed: &mut Vec<Packet>) -> usize {
        let resume = self.state;
        self.state = BatchState::Pulling;

        let mut responses = std::mem::take(&mut self.responses);
        let n = self.device.dequeue_burst(self.qid, &mut responses, self.batch_size);
        self.track_waiting(n);

        for rsp in responses.drain(..) {
            self.record(&rsp);
            completed.push(rsp.op.packet);
        }
        self.responses = responses;
        self.total_dequeued += n as u64;

        self.state = match resume {
            BatchState::Pushing => BatchState::Pushing,
            _ if !self.pending.is_empty() => BatchState::Filling,
            _ => BatchState::Idle,
        };
        n
    }

    /// Push what is left and poll until every op has completed or the
    /// watchdog expires. The watchdog covers the push too; on expiry ops
    /// the device never accepted are handed back through `completed`.
    pub fn drain_on_shutdown(
        &mut self,
        watchdog: Duration,
        completed: &mut Vec<Packet>,
    ) -> DrainOutcome {
        let deadline = Instant::now() + watchdog;
        self.force_push_while(completed, || Instant::now() < deadline);

        while self.total_enqueued > self.total_dequeued || !self.pending.is_empty() {
            if Instant::now() >= deadline {
                let outstanding = self.in_flight();
                let unsubmitted = self.pending.len() as u64;
                completed.extend(self.pending.drain(..).map(|op| op.packet));
                self.state = BatchState::Idle;
                tracing::error!(
                    alert = true,
                    qid = self.qid,
                    outstanding,
                    unsubmitted,
                    "accelerator drain watchdog expired after {:?}, abandoning outstanding ops",
                    watchdog
                );
                return DrainOutcome::WatchdogExpired { outstanding, unsubmitted };
            }
            self.pull(completed);
            std::hint::spin_loop();
        }

        self.state = BatchState::Idle;
        DrainOutcome::Complete
    }

    fn record(&mut self, rsp: &RegexResponse) {
        let stats = &mut self.stats;
        match rsp.completion() {
            Completion::Valid(matches) => {
                stats.rx_valid += 1;
                if matches > 0 {
                    stats.rx_buf_match_cnt += 1;
                    stats.rx_total_match += matches as u64;
                    tracing::trace!(qid = self.qid, user_id = rsp.op.user_id, matches, "regex match");
                }
            }
            Completion::Timeout => {
                stats.rx_invalid += 1;
                stats.rx_timeout += 1;
            }
            Completion::MaxMatch => {
                stats.rx_invalid += 1;
                stats.rx_max_match += 1;
            }
            Completion::MaxPrefix => {
                stats.rx_invalid += 1;
                stats.rx_max_prefix += 1;
            }
            Completion::ResourceLimit => {
                stats.rx_invalid += 1;
                stats.rx_resource_limit += 1;
            }
        }
    }

    /// Accumulate time spent polling with ops outstanding but none ready
    fn track_waiting(&mut self, dequeued: usize) {
        if dequeued > 0 {
            if let Some(since) = self.waiting_since.take() {
                self.stats.rx_idle += since.elapsed();
            }
        } else if self.in_flight() > 0 {
            self.waiting_since.get_or_insert_with(Instant::now);
        }
    }
}

impl std::fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue")
            .field("qid", &self.qid)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("total_enqueued", &self.total_enqueued)
            .field("total_dequeued", &self.total_dequeued)
            .finish()
    }
}

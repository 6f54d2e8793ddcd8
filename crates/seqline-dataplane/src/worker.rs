//! Stage Worker Runtime
//!
//! One pinned thread per stage instance, run-to-completion:
//!
//! 1. Dequeue a burst from the next input ring (round-robin)
//! 2. Run `process` on every packet
//! 3. Stage forwarded, dropped and completed-offload packets for the
//!    next output ring (round-robin per burst)
//! 4. Flush, spinning while downstream is full
//!
//! Dropped packets are marked, not freed, so the reorder buffer never
//! waits on a missing sequence number. Once the stop flag is seen the
//! worker gives each full output ring a bounded number of retries and
//! hands whatever is left back to the orchestrator.

use crate::accel::SubmitSignal;
use crate::buffer::{burst_bytes, Packet};
use crate::error::{PipelineError, Result};
use crate::stage::{Dataplane, Verdict};
use crate::stats::{AggregateStats, CoreStats};
use crate::topology::StageInstance;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Enqueue retries per ring once stopping
const STOP_SPIN_BUDGET: usize = 1 << 16;

/// What a worker hands back when it exits
#[derive(Debug)]
pub struct WorkerExit {
    /// The instance, with its stage and accelerator queue
    pub instance: StageInstance,
    /// Packets that could not be flushed before stopping
    pub residue: Vec<Packet>,
}

/// Worker bound to one stage instance
pub struct StageWorker {
    instance: StageInstance,
    running: Arc<AtomicBool>,
    stats: Arc<AggregateStats>,
    pin: bool,
}

impl StageWorker {
    /// Worker for `instance`; `pin` binds it to `instance.core`
    pub fn new(
        instance: StageInstance,
        running: Arc<AtomicBool>,
        stats: Arc<AggregateStats>,
        pin: bool,
    ) -> Self {
        Self {
            instance,
            running,
            stats,
            pin,
        }
    }

    /// Start the worker on its own thread
    pub fn spawn(self) -> Result<JoinHandle<WorkerExit>> {
        thread::Builder::new()
            .name(format!("seqline-worker-{}", self.instance.worker_id))
            .spawn(move || self.run())
            .map_err(|e| PipelineError::SpawnFailed(e.to_string()))
    }

    /// Main loop; returns when the stop flag is cleared
    pub fn run(mut self) -> WorkerExit {
        tracing::debug!(
            "Worker {} ({} {}) starting on core {}",
            self.instance.worker_id,
            self.instance.stage_type,
            self.instance.id,
            self.instance.core
        );

        if self.pin {
            self.pin_to_core();
        }

        let batch_size = self.instance.batch_size.max(1);
        let mut dp = Dataplane::new(self.instance.worker_id, self.instance.accel.is_some());
        let mut rx: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut completed: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut outs: Vec<VecDeque<Packet>> = self
            .instance
            .rings_out
            .iter()
            .map(|_| VecDeque::with_capacity(batch_size))
            .collect();
        let mut next_in = 0;
        let mut next_out = 0;
        let nb_out = outs.len();

        while self.running.load(Ordering::Relaxed) {
            let n = self.poll(&mut rx, &mut next_in, batch_size);

            if n > 0 {
                dp.begin_burst();
                for pkt in rx.drain(..) {
                    self.handle(pkt, &mut dp, &mut completed, &mut outs, next_out);
                }
            } else {
                self.service_accelerator(&mut completed);
            }

            let routed = n > 0 || !completed.is_empty();
            for pkt in completed.drain(..) {
                route(pkt, &mut outs, next_out);
            }

            if !self.flush(&mut outs) {
                break;
            }
            if routed {
                next_out = (next_out + 1) % nb_out;
            } else {
                std::hint::spin_loop();
            }
        }

        self.flush(&mut outs);
        let residue: Vec<Packet> = outs.into_iter().flatten().chain(rx).collect();
        if !residue.is_empty() {
            tracing::warn!(
                worker = self.instance.worker_id,
                packets = residue.len(),
                "worker stopped with unflushed packets"
            );
        }

        tracing::debug!("Worker {} stopped", self.instance.worker_id);
        WorkerExit {
            instance: self.instance,
            residue,
        }
    }

    fn stats(&self) -> &CoreStats {
        self.stats.core(self.instance.worker_id + 1)
    }

    /// Dequeue one burst, trying each input ring once starting at `next`
    fn poll(&self, rx: &mut Vec<Packet>, next: &mut usize, max: usize) -> usize {
        let rings = &self.instance.rings_in;
        for _ in 0..rings.len() {
            let ring = &rings[*next];
            *next = (*next + 1) % rings.len();
            let n = ring.dequeue_burst(rx, max);
            if n > 0 {
                self.stats().record_rx(n as u64, burst_bytes(rx));
                return n;
            }
        }
        0
    }

    fn handle(
        &mut self,
        mut pkt: Packet,
        dp: &mut Dataplane,
        completed: &mut Vec<Packet>,
        outs: &mut [VecDeque<Packet>],
        next_out: usize,
    ) {
        // Already discarded upstream: carry it to reorder untouched
        if pkt.is_dropped() {
            route(pkt, outs, next_out);
            return;
        }

        let running = &self.running;
        let instance = &mut self.instance;
        let stats = self.stats.core(instance.worker_id + 1);

        match instance.stage.process(&mut pkt, dp) {
            Ok(Verdict::Forward) => route(pkt, outs, next_out),
            Ok(Verdict::Drop) => {
                stats.record_filtered();
                pkt.mark_dropped();
                route(pkt, outs, next_out);
            }
            Ok(Verdict::Offload) => match instance.accel.as_mut() {
                Some(queue) => {
                    stats.record_offload();
                    if queue.submit(pkt) == SubmitSignal::BatchFull {
                        queue.force_push_while(completed, || running.load(Ordering::Relaxed));
                    } else {
                        queue.pull(completed);
                    }
                }
                None => {
                    stats.record_stage_error();
                    pkt.mark_dropped();
                    route(pkt, outs, next_out);
                }
            },
            Err(e) => {
                tracing::debug!(
                    worker = instance.worker_id,
                    seqn = pkt.seqn(),
                    error = %e,
                    "stage error, packet dropped"
                );
                stats.record_stage_error();
                pkt.mark_dropped();
                route(pkt, outs, next_out);
            }
        }
    }

    /// With no input, push a partial batch or collect completions. Pushes
    /// give up after stop; teardown drains whatever is left.
    fn service_accelerator(&mut self, completed: &mut Vec<Packet>) {
        let running = &self.running;
        if let Some(queue) = self.instance.accel.as_mut() {
            if queue.pending() > 0 {
                queue.force_push_while(completed, || running.load(Ordering::Relaxed));
            } else if queue.in_flight() > 0 {
                queue.pull(completed);
            }
        }
    }

    /// Enqueue everything staged for output. Spins while a ring is full;
    /// after stop, gives up on a ring once the retry budget is spent and
    /// returns false.
    fn flush(&self, outs: &mut [VecDeque<Packet>]) -> bool {
        let stats = self.stats();
        let mut flushed = true;

        for (ring, pending) in self.instance.rings_out.iter().zip(outs.iter_mut()) {
            let mut retries = 0;
            while !pending.is_empty() {
                let burst = ring.enqueue_burst(pending);
                if burst.packets > 0 {
                    stats.record_tx(burst.packets, burst.bytes);
                    stats.record_tx_batch();
                }
                if pending.is_empty() {
                    break;
                }
                if !self.running.load(Ordering::Relaxed) {
                    retries += 1;
                    if retries >= STOP_SPIN_BUDGET {
                        flushed = false;
                        break;
                    }
                }
                std::hint::spin_loop();
            }
        }
        flushed
    }

    fn pin_to_core(&self) {
        let core = self.instance.core;
        match core_affinity::get_core_ids() {
            Some(ids) if !ids.is_empty() => {
                let id = ids[core % ids.len()];
                if core_affinity::set_for_current(id) {
                    tracing::debug!("Pinned worker {} to core {}", self.instance.worker_id, id.id);
                } else {
                    tracing::warn!(worker = self.instance.worker_id, core, "failed to pin worker");
                }
            }
            _ => tracing::warn!(worker = self.instance.worker_id, "core ids unavailable, not pinning"),
        }
    }
}

#[inline]
fn route(pkt: Packet, outs: &mut [VecDeque<Packet>], next: usize) {
    outs[next].push_back(pkt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::device::{DeviceInfo, RegexDevice, RegexOp, RegexResponse};
    use crate::accel::{Accelerator, BatchQueue, DrainOutcome};
    use crate::config::AcceleratorConfig;
    use crate::ring::{Ring, RingMode};
    use crate::stage::{Stage, StageRegistry};
    use crate::topology::InstanceId;
    use std::time::{Duration, Instant};

    fn instance(stage: Box<dyn Stage>, ring_in: &Arc<Ring>, ring_out: &Arc<Ring>) -> StageInstance {
        StageInstance {
            id: InstanceId { layer: 0, index: 0 },
            stage_type: stage.name().to_string(),
            stage,
            batch_size: 8,
            rings_in: vec![ring_in.clone()],
            rings_out: vec![ring_out.clone()],
            worker_id: 0,
            core: 1,
            accel: None,
        }
    }

    fn rings(size: usize) -> (Arc<Ring>, Arc<Ring>) {
        (
            Arc::new(Ring::new("in", size, RingMode::SpSc).unwrap()),
            Arc::new(Ring::new("out", size, RingMode::SpSc).unwrap()),
        )
    }

    fn feed(ring: &Ring, payloads: &[&[u8]]) {
        let mut pkts: VecDeque<Packet> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut pkt = Packet::new(p);
                pkt.set_seqn(i as u32);
                pkt
            })
            .collect();
        ring.enqueue_burst(&mut pkts);
        assert!(pkts.is_empty());
    }

    fn collect(ring: &Ring, expected: usize) -> Vec<Packet> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut out = Vec::new();
        while out.len() < expected && Instant::now() < deadline {
            ring.dequeue_burst(&mut out, expected);
            std::thread::yield_now();
        }
        out
    }

    fn start(inst: StageInstance) -> (Arc<AtomicBool>, Arc<AggregateStats>, JoinHandle<WorkerExit>) {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(AggregateStats::new(2));
        let handle = StageWorker::new(inst, running.clone(), stats.clone(), false)
            .spawn()
            .unwrap();
        (running, stats, handle)
    }

    #[test]
    fn test_forwarding_and_filtering() {
        let (ring_in, ring_out) = rings(64);
        let mut params = crate::config::StageParams::new();
        params.insert("min_len".into(), 4.into());
        let mut stage = StageRegistry::with_builtins().create("min_len").unwrap();
        stage
            .init(&crate::stage::StageContext {
                layer: 0,
                index: 0,
                worker_id: 0,
                batch_size: 8,
                accelerated: false,
                params: &params,
            })
            .unwrap();

        let (running, stats, handle) = start(instance(stage, &ring_in, &ring_out));
        feed(&ring_in, &[b"long packet", b"ab", b"another one"]);

        let out = collect(&ring_out, 3);
        running.store(false, Ordering::Release);
        let exit = handle.join().unwrap();

        assert_eq!(out.len(), 3);
        let dropped: Vec<u32> = out.iter().filter(|p| p.is_dropped()).map(|p| p.seqn()).collect();
        assert_eq!(dropped, vec![1]);
        assert!(exit.residue.is_empty());

        let snap = stats.core(1).snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.tx_packets, 3);
        assert_eq!(snap.filtered, 1);
    }

    struct Failing;

    impl Stage for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn process(&mut self, pkt: &mut Packet, _dp: &mut Dataplane) -> Result<Verdict> {
            if pkt.seqn() % 2 == 0 {
                Err(PipelineError::stage("failing", "even seqn"))
            } else {
                Ok(Verdict::Forward)
            }
        }
    }

    #[test]
    fn test_stage_error_marks_packet() {
        let (ring_in, ring_out) = rings(64);
        let (running, stats, handle) = start(instance(Box::new(Failing), &ring_in, &ring_out));
        feed(&ring_in, &[b"a", b"b", b"c", b"d"]);

        let out = collect(&ring_out, 4);
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(out.iter().filter(|p| p.is_dropped()).count(), 2);
        assert_eq!(stats.core(1).snapshot().stage_errors, 2);
    }

    #[test]
    fn test_already_dropped_bypasses_stage() {
        let (ring_in, ring_out) = rings(64);
        let (running, stats, handle) = start(instance(Box::new(Failing), &ring_in, &ring_out));

        let mut pkt = Packet::new(b"x");
        pkt.mark_dropped();
        let mut pkts: VecDeque<Packet> = VecDeque::from(vec![pkt]);
        ring_in.enqueue_burst(&mut pkts);

        let out = collect(&ring_out, 1);
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(stats.core(1).snapshot().stage_errors, 0);
    }

    #[test]
    fn test_offload_completes_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.txt");
        std::fs::write(&rules, "1,1,passwd\n").unwrap();
        let accel = Accelerator::init(
            &AcceleratorConfig {
                rules_file: Some(rules),
                batch_size: 16,
                ..Default::default()
            },
            1,
        )
        .unwrap();

        let (ring_in, ring_out) = rings(64);
        let mut inst = instance(Box::new(crate::stages::RegexStage), &ring_in, &ring_out);
        inst.accel = Some(accel.queue(0).unwrap());
        let (running, stats, handle) = start(inst);

        // Fewer than one batch: only the idle path pushes them
        feed(&ring_in, &[b"/etc/passwd", b"index.html", b"passwd", b"x", b"y"]);
        let out = collect(&ring_out, 5);
        running.store(false, Ordering::Release);
        let exit = handle.join().unwrap();
        accel.teardown();

        let mut seqns: Vec<u32> = out.iter().map(|p| p.seqn()).collect();
        seqns.sort_unstable();
        assert_eq!(seqns, vec![0, 1, 2, 3, 4]);
        assert_eq!(stats.core(1).snapshot().offloaded, 5);

        let queue = exit.instance.accel.unwrap();
        assert_eq!(queue.total_enqueued(), 5);
        assert_eq!(queue.total_dequeued(), 5);
        assert_eq!(queue.stats().rx_buf_match_cnt, 2);
    }

    #[test]
    fn test_full_output_returns_residue() {
        let ring_in = Arc::new(Ring::new("in", 64, RingMode::SpSc).unwrap());
        let ring_out = Arc::new(Ring::new("out", 4, RingMode::SpSc).unwrap());
        let (running, _stats, handle) = start(instance(
            StageRegistry::with_builtins().create("echo").unwrap(),
            &ring_in,
            &ring_out,
        ));

        feed(&ring_in, &[b"1", b"2", b"3", b"4", b"5", b"6"]);
        let deadline = Instant::now() + Duration::from_secs(10);
        while ring_out.len() < 4 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        running.store(false, Ordering::Release);
        let exit = handle.join().unwrap();

        assert_eq!(ring_out.len(), 4);
        assert_eq!(exit.residue.len() + ring_in.len(), 2);
    }

    /// Device that never accepts an op
    struct Wedged;

    impl RegexDevice for Wedged {
        fn info(&self) -> DeviceInfo {
            DeviceInfo { name: "wedged", max_queue_pairs: 1, max_matches: 1, max_payload: 64 }
        }

        fn enqueue_burst(&self, _qid: usize, _ops: &mut VecDeque<RegexOp>) -> usize {
            0
        }

        fn dequeue_burst(&self, _qid: usize, _out: &mut Vec<RegexResponse>, _max: usize) -> usize {
            0
        }

        fn stop(&self) {}
    }

    #[test]
    fn test_stop_while_device_refuses() {
        let (ring_in, ring_out) = rings(64);
        let mut inst = instance(Box::new(crate::stages::RegexStage), &ring_in, &ring_out);
        inst.accel = Some(BatchQueue::new(0, Arc::new(Wedged), 2, [1, 0, 0, 0]));
        let (running, stats, handle) = start(inst);

        feed(&ring_in, &[b"a", b"b", b"c", b"d"]);
        let deadline = Instant::now() + Duration::from_secs(10);
        while stats.core(1).snapshot().offloaded < 2 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        running.store(false, Ordering::Release);
        let exit = handle.join().unwrap();

        let mut queue = exit.instance.accel.unwrap();
        assert!(queue.pending() >= 2);
        assert_eq!(queue.total_enqueued(), 0);

        let mut recovered = Vec::new();
        let outcome = queue.drain_on_shutdown(Duration::from_millis(20), &mut recovered);
        assert_eq!(
            outcome,
            DrainOutcome::WatchdogExpired { outstanding: 0, unsubmitted: recovered.len() as u64 }
        );
        assert_eq!(recovered.len() + exit.residue.len() + ring_in.len(), 4);
    }
}

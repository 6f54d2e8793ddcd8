//! Pipeline Orchestrator
//!
//! Owns the run: builds the accelerator and topology, launches one pinned
//! worker per stage instance, drives ingress and egress on the calling
//! thread, and tears everything down in a fixed order.
//!
//! ```text
//! ingress loop (core 0)
//!   read burst ─▶ stamp seqn ─▶ backlog ─▶ head rings (round-robin)
//!   tail rings ─▶ reorder insert ─▶ reorder drain ─▶ egress sink
//! ```
//!
//! Shutdown order: stop flag, join workers, free residue and ring
//! contents, drain accelerator queues under the watchdog, free what the
//! reorder buffer still holds, `free` every stage, stop the device.

use crate::accel::{Accelerator, DrainOutcome};
use crate::buffer::{burst_bytes, Packet};
use crate::config::{PipelineConfig, Warnings};
use crate::egress::{DiscardSink, EgressSink};
use crate::error::{PipelineError, Result};
use crate::ingress::{self, IngressSource};
use crate::reorder::{ReorderBuffer, ReorderStats};
use crate::sequencer::{Sequencer, SEQN_START};
use crate::stage::StageRegistry;
use crate::stats::{AggregateStats, CoreStatsSnapshot, LatencyStats, LatencySummary, RegexStats};
use crate::topology::{free_instance, StageInstance, TopologyBuilder, TopologyRings};
use crate::worker::{StageWorker, WorkerExit};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Why the ingress loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finite input fully processed
    InputComplete,
    /// Stop requested through the stop handle
    Stopped,
    /// Configured run duration reached
    DurationElapsed,
    /// Input ended but packets were still missing when the flush timeout hit
    FlushTimeout,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::InputComplete => "input complete",
            RunOutcome::Stopped => "stopped",
            RunOutcome::DurationElapsed => "duration elapsed",
            RunOutcome::FlushTimeout => "flush timeout",
        };
        f.write_str(s)
    }
}

/// Final statistics of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Why the run ended
    pub outcome: RunOutcome,
    /// Ingress loop wall time
    pub elapsed: Duration,
    /// Packets read from the source and sequenced
    pub received: u64,
    /// Packets accepted by a head ring
    pub injected: u64,
    /// Packets handed to the egress sink
    pub egressed: u64,
    /// Payload bytes handed to the sink
    pub egress_bytes: u64,
    /// Packets marked dropped by a stage and freed at egress
    pub discarded: u64,
    /// Packets refused by the reorder buffer
    pub reorder_dropped: u64,
    /// Reorder buffer counters
    pub reorder: ReorderStats,
    /// Packets freed during shutdown
    pub freed_on_shutdown: u64,
    /// Accelerator ops abandoned when the drain watchdog fired
    pub abandoned_ops: u64,
    /// Ingress core counters (egress side included)
    pub ingress: CoreStatsSnapshot,
    /// Per-worker counters, by worker id
    pub workers: Vec<CoreStatsSnapshot>,
    /// Accelerator counters summed over queues
    pub regex: Option<RegexStats>,
    /// Egress latency of packets carrying an arrival stamp
    pub latency: Option<LatencySummary>,
    /// Buffered configuration warnings
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Sum of all worker counters
    pub fn workers_total(&self) -> CoreStatsSnapshot {
        let mut total = CoreStatsSnapshot::default();
        for w in &self.workers {
            total += *w;
        }
        total
    }

    /// Egress throughput over the run
    pub fn throughput_gbps(&self) -> f64 {
        self.ingress.throughput_gbps(self.elapsed.as_secs_f64())
    }

    /// Egress packet rate over the run
    pub fn packet_rate_mpps(&self) -> f64 {
        self.ingress.packet_rate_mpps(self.elapsed.as_secs_f64())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run: {} after {:.3}s", self.outcome, self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Packets: received {} injected {} egressed {} discarded {} reorder-dropped {}",
            self.received, self.injected, self.egressed, self.discarded, self.reorder_dropped
        )?;
        writeln!(
            f,
            "Egress: {:.3} Gbps, {:.3} Mpps in {} bursts",
            self.throughput_gbps(),
            self.packet_rate_mpps(),
            self.ingress.tx_batches
        )?;
        writeln!(
            f,
            "Reorder: inserted {} drained {} lost {} no-space {} out-of-range {} order-errors {}",
            self.reorder.inserted,
            self.reorder.drained,
            self.reorder.lost,
            self.reorder.no_space,
            self.reorder.out_of_range,
            self.reorder.order_errors
        )?;
        for (id, w) in self.workers.iter().enumerate() {
            writeln!(
                f,
                "  worker {}: rx {} tx {} ({} bursts) filtered {} errors {} offloaded {}",
                id, w.rx_packets, w.tx_packets, w.tx_batches, w.filtered, w.stage_errors, w.offloaded
            )?;
        }
        if let Some(rx) = &self.regex {
            writeln!(
                f,
                "Regex: valid {} matched-bufs {} matches {} invalid {} (timeout {} max-match {} max-prefix {} resource {})",
                rx.rx_valid,
                rx.rx_buf_match_cnt,
                rx.rx_total_match,
                rx.rx_invalid,
                rx.rx_timeout,
                rx.rx_max_match,
                rx.rx_max_prefix,
                rx.rx_resource_limit
            )?;
            writeln!(f, "  tx busy {:?} rx idle {:?}", rx.tx_busy, rx.rx_idle)?;
        }
        if let Some(lat) = &self.latency {
            let us = |d: Duration| d.as_secs_f64() * 1_000_000.0;
            writeln!(
                f,
                "Latency (us): packets {} min {:.3} mean {:.3} max {:.3}",
                lat.packets,
                us(lat.min),
                us(lat.mean),
                us(lat.max)
            )?;
            writeln!(
                f,
                "  p90 {:.3} p95 {:.3} p99 {:.3} p99.9 {:.3} ({} samples)",
                us(lat.p90),
                us(lat.p95),
                us(lat.p99),
                us(lat.p999),
                lat.samples
            )?;
        }
        if self.freed_on_shutdown > 0 || self.abandoned_ops > 0 {
            writeln!(
                f,
                "Shutdown: freed {} abandoned ops {}",
                self.freed_on_shutdown, self.abandoned_ops
            )?;
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for w in &self.warnings {
                writeln!(f, "  - {}", w)?;
            }
        }
        Ok(())
    }
}

/// Ingress-side counters while running
#[derive(Debug, Default)]
struct Flow {
    injected: u64,
    egressed: u64,
    egress_bytes: u64,
    discarded: u64,
    reorder_dropped: u64,
    latency: LatencyStats,
}

impl Flow {
    fn accounted(&self) -> u64 {
        self.egressed + self.discarded + self.reorder_dropped
    }
}

/// Pipeline orchestrator
pub struct Orchestrator {
    config: PipelineConfig,
    warnings: Warnings,
    registry: StageRegistry,
    stop: Arc<AtomicBool>,
    started: bool,
}

impl Orchestrator {
    /// Validate `config` against the cores of this machine
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_available_cores(config, crate::config::available_cores())
    }

    /// Validate `config` against an explicit core count
    pub fn with_available_cores(mut config: PipelineConfig, available: usize) -> Result<Self> {
        let warnings = config.validate_with_cores(available)?;
        Ok(Self {
            config,
            warnings,
            registry: StageRegistry::with_builtins(),
            stop: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// Validated configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register custom stage types before `run`
    pub fn registry_mut(&mut self) -> &mut StageRegistry {
        &mut self.registry
    }

    /// Storing `true` ends the run
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run with the configured source, discarding egress
    pub fn run(&mut self) -> Result<RunReport> {
        let mut source = ingress::from_config(&self.config.input)?;
        let mut sink = DiscardSink::new();
        self.run_with(source.as_mut(), &mut sink)
    }

    /// Run with an explicit source and sink
    pub fn run_with(
        &mut self,
        source: &mut dyn IngressSource,
        sink: &mut dyn EgressSink,
    ) -> Result<RunReport> {
        if self.started {
            return Err(PipelineError::AlreadyRunning);
        }
        self.started = true;

        let config = &self.config;
        let nb_workers = config.total_instances();
        let stats = Arc::new(AggregateStats::new(nb_workers + 1));

        let accel = match &config.accelerator {
            Some(cfg) => Some(Accelerator::init(cfg, nb_workers)?),
            None => None,
        };

        let topology = match TopologyBuilder::from_config(config).build(&self.registry, accel.as_ref()) {
            Ok(t) => t,
            Err(e) => {
                if let Some(a) = &accel {
                    a.teardown();
                }
                return Err(e);
            }
        };

        let reorder = ReorderBuffer::new(config.reorder_window, SEQN_START)
            .ok_or_else(|| {
                PipelineError::Config(format!("invalid reorder window {}", config.reorder_window))
            });
        let mut reorder = match reorder {
            Ok(r) => r.with_verification(config.verify_order),
            Err(e) => {
                topology.teardown();
                if let Some(a) = &accel {
                    a.teardown();
                }
                return Err(e);
            }
        };

        let (instances, rings) = topology.into_parts();
        let capacity: usize = rings.all().iter().map(|r| r.capacity()).sum();
        if capacity > config.reorder_window {
            self.warnings.record(format!(
                "ring capacity {} exceeds reorder window {}, late packets may be dropped",
                capacity, config.reorder_window
            ));
        }
        let running = Arc::new(AtomicBool::new(true));
        let handles = match launch(instances, &running, &stats, config.pin_cores) {
            Ok(h) => h,
            Err(e) => {
                if let Some(a) = &accel {
                    a.teardown();
                }
                return Err(e);
            }
        };

        tracing::info!(
            workers = nb_workers,
            source = source.name(),
            sink = sink.name(),
            "pipeline started"
        );

        if config.pin_cores {
            pin_ingress();
        }

        let mut sequencer = Sequencer::new();
        let mut flow = Flow::default();
        let mut backlog: VecDeque<Packet> = VecDeque::with_capacity(config.batch_size);
        let started = Instant::now();

        let outcome = self.ingress_loop(
            source,
            sink,
            &rings,
            &mut sequencer,
            &mut reorder,
            &mut backlog,
            &mut flow,
            &stats,
        );
        let elapsed = started.elapsed();

        let teardown = Teardown::run(
            &running,
            handles,
            &rings,
            accel.as_ref(),
            &mut reorder,
            backlog,
        );

        let outcome = outcome?;
        tracing::info!(
            %outcome,
            egressed = flow.egressed,
            discarded = flow.discarded,
            reorder_dropped = flow.reorder_dropped,
            "pipeline stopped"
        );

        Ok(RunReport {
            outcome,
            elapsed,
            received: sequencer.issued(),
            injected: flow.injected,
            egressed: flow.egressed,
            egress_bytes: flow.egress_bytes,
            discarded: flow.discarded,
            reorder_dropped: flow.reorder_dropped,
            reorder: reorder.stats(),
            freed_on_shutdown: teardown.freed,
            abandoned_ops: teardown.abandoned_ops,
            ingress: stats.ingress().snapshot(),
            workers: (1..stats.num_cores()).map(|i| stats.core(i).snapshot()).collect(),
            regex: accel.as_ref().map(|_| teardown.regex),
            latency: flow.latency.summary(),
            warnings: self.warnings.clone().into_vec(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn ingress_loop(
        &self,
        source: &mut dyn IngressSource,
        sink: &mut dyn EgressSink,
        rings: &TopologyRings,
        sequencer: &mut Sequencer,
        reorder: &mut ReorderBuffer,
        backlog: &mut VecDeque<Packet>,
        flow: &mut Flow,
        stats: &AggregateStats,
    ) -> Result<RunOutcome> {
        let config = &self.config;
        let batch_size = config.batch_size;
        let ingress = stats.ingress();
        let deadline = config
            .duration_secs
            .map(|s| Instant::now() + Duration::from_secs(s));
        let flush_timeout = Duration::from_millis(config.flush_timeout_ms);

        let mut rx: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut tail: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut ordered: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut egress: Vec<Packet> = Vec::with_capacity(batch_size);
        let mut next_head = 0;
        let mut exhausted_at: Option<Instant> = None;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(RunOutcome::Stopped);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(RunOutcome::DurationElapsed);
            }

            let mut progress = false;

            // Read only once the previous burst is fully injected
            if backlog.is_empty() && !source.is_exhausted() {
                let n = source.rx_burst(&mut rx, batch_size)?;
                if n > 0 {
                    if config.latency_mode {
                        let now = Instant::now();
                        for pkt in rx.iter_mut() {
                            pkt.stamp_rx(now);
                        }
                    }
                    sequencer.stamp(&mut rx);
                    ingress.record_rx(n as u64, burst_bytes(&rx));
                    backlog.extend(rx.drain(..));
                }
            }

            for _ in 0..rings.head.len() {
                if backlog.is_empty() {
                    break;
                }
                let ring = &rings.head[next_head];
                next_head = (next_head + 1) % rings.head.len();
                let burst = ring.enqueue_burst(backlog);
                if burst.packets > 0 {
                    flow.injected += burst.packets;
                    progress = true;
                    break;
                }
            }

            for ring in &rings.tail {
                ring.dequeue_burst(&mut tail, batch_size);
            }
            if !tail.is_empty() {
                progress = true;
            }
            for pkt in tail.drain(..) {
                if let Err(e) = reorder.insert(pkt) {
                    tracing::debug!(error = %e, "reorder insert failed, packet dropped");
                    flow.reorder_dropped += 1;
                }
            }

            reorder.drain(&mut ordered, usize::MAX);
            if !ordered.is_empty() {
                let now = Instant::now();
                for mut pkt in ordered.drain(..) {
                    if pkt.is_dropped() {
                        flow.discarded += 1;
                    } else {
                        pkt.stamp_tx(now);
                        if let Some(latency) = pkt.latency() {
                            flow.latency.record(latency);
                        }
                        egress.push(pkt);
                    }
                }
            }
            if !egress.is_empty() {
                let n = egress.len() as u64;
                let bytes = burst_bytes(&egress);
                sink.tx_burst(&mut egress)?;
                egress.clear();
                ingress.record_tx(n, bytes);
                ingress.record_tx_batch();
                flow.egressed += n;
                flow.egress_bytes += bytes;
            }

            if source.is_exhausted() && backlog.is_empty() {
                if flow.accounted() >= flow.injected {
                    return Ok(RunOutcome::InputComplete);
                }
                let since = *exhausted_at.get_or_insert_with(Instant::now);
                if since.elapsed() >= flush_timeout {
                    tracing::warn!(
                        missing = flow.injected - flow.accounted(),
                        "flush timeout with packets still in flight"
                    );
                    return Ok(RunOutcome::FlushTimeout);
                }
            }

            if !progress {
                std::hint::spin_loop();
            }
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("started", &self.started)
            .finish()
    }
}

/// Spawn one worker per instance; on failure stop the ones already running
fn launch(
    instances: Vec<StageInstance>,
    running: &Arc<AtomicBool>,
    stats: &Arc<AggregateStats>,
    pin: bool,
) -> Result<Vec<JoinHandle<WorkerExit>>> {
    let mut handles = Vec::with_capacity(instances.len());
    let mut instances = instances.into_iter();

    while let Some(instance) = instances.next() {
        match StageWorker::new(instance, running.clone(), stats.clone(), pin).spawn() {
            Ok(h) => handles.push(h),
            Err(e) => {
                running.store(false, Ordering::Release);
                for h in handles {
                    if let Ok(exit) = h.join() {
                        free_instance(exit.instance);
                    }
                }
                instances.for_each(free_instance);
                return Err(e);
            }
        }
    }
    Ok(handles)
}

fn pin_ingress() {
    match core_affinity::get_core_ids().and_then(|ids| ids.first().copied()) {
        Some(id) if core_affinity::set_for_current(id) => {
            tracing::debug!("Pinned ingress to core {}", id.id);
        }
        _ => tracing::warn!("failed to pin ingress to core 0"),
    }
}

/// Shutdown results
struct Teardown {
    freed: u64,
    abandoned_ops: u64,
    regex: RegexStats,
}

impl Teardown {
    fn run(
        running: &AtomicBool,
        handles: Vec<JoinHandle<WorkerExit>>,
        rings: &TopologyRings,
        accel: Option<&Accelerator>,
        reorder: &mut ReorderBuffer,
        backlog: VecDeque<Packet>,
    ) -> Self {
        let mut freed = backlog.len() as u64;
        drop(backlog);

        running.store(false, Ordering::Release);
        let mut instances = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(exit) => {
                    freed += exit.residue.len() as u64;
                    instances.push(exit.instance);
                }
                Err(_) => tracing::error!("worker thread panicked"),
            }
        }

        freed += rings.all().iter().map(|r| r.drain() as u64).sum::<u64>();

        let mut regex = RegexStats::default();
        let mut abandoned_ops = 0;
        if let Some(accel) = accel {
            let mut recovered = Vec::new();
            for instance in instances.iter_mut() {
                if let Some(queue) = instance.accel.as_mut() {
                    if let DrainOutcome::WatchdogExpired { outstanding, unsubmitted } =
                        queue.drain_on_shutdown(accel.watchdog(), &mut recovered)
                    {
                        abandoned_ops += outstanding + unsubmitted;
                    }
                    regex += queue.stats();
                }
            }
            freed += recovered.len() as u64;
        }

        freed += reorder.drain_all().len() as u64;

        for instance in instances {
            free_instance(instance);
        }
        if let Some(accel) = accel {
            accel.teardown();
        }

        if freed > 0 {
            tracing::info!(packets = freed, "freed packets on shutdown");
        }
        Self {
            freed,
            abandoned_ops,
            regex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcceleratorConfig, LayerConfig};
    use crate::egress::CollectSink;
    use crate::ingress::{SyntheticSource, VecSource};
    use crate::topology::LinkMode;

    fn config(layers: Vec<LayerConfig>) -> PipelineConfig {
        PipelineConfig {
            pin_cores: false,
            ring_size: 1024,
            batch_size: 32,
            reorder_window: 1 << 16,
            verify_order: true,
            layers,
            flush_timeout_ms: 10_000,
            ..Default::default()
        }
    }

    fn numbered(n: usize) -> VecSource {
        VecSource::from_payloads((0..n).map(|i| format!("packet-{:04}", i)))
    }

    #[test]
    fn test_jittered_workers_preserve_order() {
        let cfg = config(vec![LayerConfig::new("jitter", 2).param("max_delay_us", 5)]);
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(1000), &mut sink).unwrap();

        assert_eq!(report.outcome, RunOutcome::InputComplete);
        assert_eq!(sink.seqns(), (0..1000).collect::<Vec<u32>>());
        assert_eq!(sink.packets()[7].data(), b"packet-0007");
        assert_eq!(report.egressed, 1000);
        assert_eq!(report.reorder.order_errors, 0);
        assert_eq!(report.workers_total().rx_packets, 1000);
    }

    #[test]
    fn test_two_layer_bipartite() {
        let cfg = config(vec![
            LayerConfig::new("jitter", 3).param("max_delay_us", 2),
            LayerConfig::new("echo", 2),
        ]);
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        orch.run_with(&mut numbered(2000), &mut sink).unwrap();
        assert_eq!(sink.seqns(), (0..2000).collect::<Vec<u32>>());
    }

    #[test]
    fn test_shared_links_preserve_order() {
        let mut cfg = config(vec![
            LayerConfig::new("jitter", 3).param("max_delay_us", 5),
            LayerConfig::new("jitter", 2).param("max_delay_us", 5),
        ]);
        cfg.link_mode = LinkMode::Shared;
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(3000), &mut sink).unwrap();

        assert_eq!(report.outcome, RunOutcome::InputComplete);
        assert_eq!(sink.seqns(), (0..3000).collect::<Vec<u32>>());
        assert_eq!(report.reorder_dropped, 0);
        assert_eq!(report.reorder.order_errors, 0);
        // Every packet crossed both layers
        assert_eq!(report.workers_total().rx_packets, 6000);
    }

    #[test]
    fn test_latency_mode_reports_latency() {
        let mut cfg = config(vec![LayerConfig::new("jitter", 2).param("max_delay_us", 5)]);
        cfg.latency_mode = true;
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(1000), &mut sink).unwrap();

        let lat = report.latency.unwrap();
        assert_eq!(lat.packets, 1000);
        assert_eq!(lat.samples, 1000);
        assert!(lat.min <= lat.mean && lat.mean <= lat.max);
        assert!(lat.p90 <= lat.p99 && lat.p99 <= lat.max);
        assert!(sink.packets().iter().all(|p| p.latency().is_some()));
        assert!(report.to_string().contains("Latency (us)"));
    }

    #[test]
    fn test_latency_off_without_stamps() {
        let mut orch =
            Orchestrator::with_available_cores(config(vec![LayerConfig::new("echo", 1)]), 4).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(100), &mut sink).unwrap();
        assert!(report.latency.is_none());
        assert!(sink.packets().iter().all(|p| p.rx_timestamp().is_none()));
    }

    #[test]
    fn test_timestamp_stage_starts_clock() {
        let cfg = config(vec![LayerConfig::new("echo", 1), LayerConfig::new("timestamp", 2)]);
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(200), &mut sink).unwrap();
        assert_eq!(sink.seqns(), (0..200).collect::<Vec<u32>>());
        assert_eq!(report.latency.unwrap().packets, 200);
    }

    #[test]
    fn test_regex_offload_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.txt");
        std::fs::write(&rules, "1,1,packet-00[0-9]{2}\n").unwrap();

        let mut cfg = config(vec![LayerConfig::new("regex", 2), LayerConfig::new("echo", 1)]);
        cfg.accelerator = Some(AcceleratorConfig {
            rules_file: Some(rules),
            batch_size: 8,
            ..Default::default()
        });
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(500), &mut sink).unwrap();

        assert_eq!(sink.seqns(), (0..500).collect::<Vec<u32>>());
        let regex = report.regex.unwrap();
        assert_eq!(regex.rx_valid, 500);
        assert_eq!(regex.rx_buf_match_cnt, 100);
        assert_eq!(report.workers_total().offloaded, 500);
        assert_eq!(report.abandoned_ops, 0);
    }

    #[test]
    fn test_filtered_packets_accounted() {
        let cfg = config(vec![LayerConfig::new("min_len", 2).param("min_len", 5)]);
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let mut sink = CollectSink::new();
        let mut source =
            VecSource::from_payloads((0..600).map(|i| if i % 2 == 0 { "abc" } else { "abcdef" }));

        let report = orch.run_with(&mut source, &mut sink).unwrap();

        assert_eq!(report.outcome, RunOutcome::InputComplete);
        assert_eq!(report.egressed + report.discarded, 600);
        assert_eq!(report.discarded, 300);
        assert_eq!(report.workers_total().filtered, 300);
        let seqns = sink.seqns();
        assert!(seqns.windows(2).all(|w| w[0] < w[1]));
        assert!(sink.packets().iter().all(|p| p.len() >= 5 && p.tx_timestamp().is_some()));
    }

    #[test]
    fn test_zero_layers_pass_through() {
        let mut orch = Orchestrator::with_available_cores(config(Vec::new()), 2).unwrap();
        let mut sink = CollectSink::new();

        let report = orch.run_with(&mut numbered(300), &mut sink).unwrap();
        assert_eq!(sink.seqns(), (0..300).collect::<Vec<u32>>());
        assert!(report.workers.is_empty());
    }

    #[test]
    fn test_stop_handle() {
        let cfg = config(vec![LayerConfig::new("echo", 2)]);
        let mut orch = Orchestrator::with_available_cores(cfg, 8).unwrap();
        let stop = orch.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::Release);
        });

        let mut source = SyntheticSource::new(b"GET /", 64, 0).unwrap();
        let mut sink = DiscardSink::new();
        let report = orch.run_with(&mut source, &mut sink).unwrap();
        stopper.join().unwrap();

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert!(report.egressed > 0);
        assert_eq!(report.reorder.order_errors, 0);
        assert_eq!(sink.packets(), report.egressed);
    }

    #[test]
    fn test_duration_limit() {
        let mut cfg = config(vec![LayerConfig::new("echo", 1)]);
        cfg.duration_secs = Some(1);
        let mut orch = Orchestrator::with_available_cores(cfg, 4).unwrap();

        let mut source = SyntheticSource::new(b"x", 16, 0).unwrap();
        let report = orch.run_with(&mut source, &mut DiscardSink::new()).unwrap();
        assert_eq!(report.outcome, RunOutcome::DurationElapsed);
        assert!(report.elapsed >= Duration::from_secs(1));
    }

    #[test]
    fn test_insufficient_cores() {
        let cfg = config(vec![LayerConfig::new("echo", 4)]);
        let mut orch = Orchestrator::with_available_cores(cfg, 3).unwrap();
        let err = orch.run_with(&mut numbered(10), &mut DiscardSink::new()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCores { required: 5, available: 3 }
        ));
    }

    #[test]
    fn test_runs_once() {
        let mut orch = Orchestrator::with_available_cores(config(vec![LayerConfig::new("echo", 1)]), 4).unwrap();
        orch.run_with(&mut numbered(10), &mut DiscardSink::new()).unwrap();
        assert!(matches!(
            orch.run_with(&mut numbered(10), &mut DiscardSink::new()),
            Err(PipelineError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_report_carries_warnings() {
        let mut cfg = config(vec![LayerConfig::new("echo", 1)]);
        cfg.cores = 64;
        let mut orch = Orchestrator::with_available_cores(cfg, 4).unwrap();
        assert_eq!(orch.config().cores, 4);

        let report = orch.run_with(&mut numbered(10), &mut DiscardSink::new()).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.to_string().contains("Warnings:"));
    }

    #[test]
    fn test_custom_stage() {
        use crate::stage::{Dataplane, Stage, Verdict};

        struct Tag;
        impl Stage for Tag {
            fn name(&self) -> &'static str {
                "tag"
            }
            fn process(&mut self, pkt: &mut Packet, _dp: &mut Dataplane) -> Result<Verdict> {
                pkt.data_mut().extend_from_slice(b"!");
                Ok(Verdict::Forward)
            }
        }

        let mut orch =
            Orchestrator::with_available_cores(config(vec![LayerConfig::new("tag", 1)]), 4).unwrap();
        orch.registry_mut().register("tag", || Box::new(Tag));
        let mut sink = CollectSink::new();
        orch.run_with(&mut VecSource::from_payloads(["a", "b"]), &mut sink).unwrap();
        assert_eq!(sink.packets()[1].data(), b"b!");
    }
}

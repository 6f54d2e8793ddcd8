//! Software regex device
//!
//! Stands in for a hardware matcher. Each queue pair has a bounded number
//! of descriptors and its own engine thread; completions are shuffled
//! within a small window so callers see the same out-of-order behaviour a
//! hardware matcher produces.

use super::device::{
    DeviceInfo, RegexDevice, RegexMatch, RegexOp, RegexResponse, RspFlags,
};
use super::rules::RuleDatabase;
use crate::error::{PipelineError, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::bytes::{Regex, RegexSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Queue pairs the software device exposes
pub const SOFT_MAX_QUEUE_PAIRS: usize = 64;

/// Matches reported per op at most
pub const SOFT_MAX_MATCHES: usize = 255;

/// Largest payload scanned
pub const SOFT_MAX_PAYLOAD: usize = 16 * 1024;

/// Software device parameters
#[derive(Debug, Clone)]
pub struct SoftDeviceConfig {
    /// Queue pairs to open
    pub nb_queues: usize,
    /// Descriptors per queue
    pub nb_desc: usize,
    /// 0 selects `SOFT_MAX_MATCHES`
    pub max_matches: usize,
    /// Per-op scan time budget
    pub max_scan_time: Option<Duration>,
    /// Completions are shuffled in groups of this size (1 = in order)
    pub completion_window: usize,
}

/// Rules compiled for scanning
struct Matcher {
    set: RegexSet,
    regexes: Vec<Regex>,
    ids: Vec<u32>,
    groups: Vec<u16>,
}

impl Matcher {
    fn new(db: &RuleDatabase) -> Result<Self> {
        let patterns: Vec<&str> = db.rules.iter().map(|r| r.pattern.as_str()).collect();
        let set = RegexSet::new(&patterns).map_err(|e| PipelineError::Rules(e.to_string()))?;
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| PipelineError::Rules(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            set,
            regexes,
            ids: db.rules.iter().map(|r| r.id).collect(),
            groups: db.rules.iter().map(|r| r.group).collect(),
        })
    }

    fn scan(&self, op: RegexOp, max_matches: usize, max_scan_time: Option<Duration>) -> RegexResponse {
        let started = Instant::now();
        let mut flags = RspFlags::empty();
        let mut matches = Vec::new();
        let data = op.packet.data();

        if data.len() > SOFT_MAX_PAYLOAD {
            flags.insert(RspFlags::RESOURCE_LIMIT);
        } else {
            'rules: for idx in self.set.matches(data).iter() {
                if !op.selects(self.groups[idx]) {
                    continue;
                }
                for m in self.regexes[idx].find_iter(data) {
                    if matches.len() == max_matches {
                        flags.insert(RspFlags::MAX_MATCH);
                        break 'rules;
                    }
                    matches.push(RegexMatch {
                        rule_id: self.ids[idx],
                        start: m.start() as u32,
                        len: m.len() as u32,
                    });
                }
            }

            if max_scan_time.map_or(false, |limit| started.elapsed() > limit) {
                flags.insert(RspFlags::MAX_SCAN_TIMEOUT);
            }
        }

        RegexResponse { op, flags, matches }
    }
}

/// One submission/completion queue pair
struct QueuePair {
    submit: ArrayQueue<RegexOp>,
    complete: ArrayQueue<RegexResponse>,
    in_flight: AtomicUsize,
    nb_desc: usize,
}

/// Software regex device
pub struct SoftRegexDevice {
    queues: Vec<Arc<QueuePair>>,
    engines: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl SoftRegexDevice {
    /// Static capabilities
    pub fn capabilities() -> DeviceInfo {
        DeviceInfo {
            name: "soft-regex",
            max_queue_pairs: SOFT_MAX_QUEUE_PAIRS,
            max_matches: SOFT_MAX_MATCHES,
            max_payload: SOFT_MAX_PAYLOAD,
        }
    }

    /// Compile `rules` and start one engine per queue
    pub fn open(config: &SoftDeviceConfig, rules: &RuleDatabase) -> Result<Self> {
        if config.nb_queues == 0 || config.nb_queues > SOFT_MAX_QUEUE_PAIRS {
            return Err(PipelineError::DeviceCapability(format!(
                "{} queues requested, soft-regex supports 1 to {}",
                config.nb_queues, SOFT_MAX_QUEUE_PAIRS
            )));
        }
        if config.nb_desc == 0 {
            return Err(PipelineError::Accelerator("zero descriptors per queue".into()));
        }

        let matcher = Arc::new(Matcher::new(rules)?);
        let running = Arc::new(AtomicBool::new(true));
        let max_matches = match config.max_matches {
            0 => SOFT_MAX_MATCHES,
            n => n.min(SOFT_MAX_MATCHES),
        };
        let window = config.completion_window.max(1);

        let mut queues = Vec::with_capacity(config.nb_queues);
        let mut engines = Vec::with_capacity(config.nb_queues);

        for qid in 0..config.nb_queues {
            let qp = Arc::new(QueuePair {
                submit: ArrayQueue::new(config.nb_desc),
                complete: ArrayQueue::new(config.nb_desc),
                in_flight: AtomicUsize::new(0),
                nb_desc: config.nb_desc,
            });

            let engine = Engine {
                qp: qp.clone(),
                matcher: matcher.clone(),
                running: running.clone(),
                max_matches,
                max_scan_time: config.max_scan_time,
                window,
            };

            let spawned = thread::Builder::new()
                .name(format!("soft-regex-{}", qid))
                .spawn(move || engine.run());

            match spawned {
                Ok(handle) => engines.push(handle),
                Err(e) => {
                    running.store(false, Ordering::Release);
                    join_engines(engines);
                    return Err(PipelineError::Accelerator(format!(
                        "failed to start engine {}: {}",
                        qid, e
                    )));
                }
            }
            queues.push(qp);
        }

        tracing::info!(
            queues = config.nb_queues,
            nb_desc = config.nb_desc,
            rules = rules.len(),
            "soft-regex device started"
        );

        Ok(Self {
            queues,
            engines: Mutex::new(engines),
            running,
        })
    }
}

impl RegexDevice for SoftRegexDevice {
    fn info(&self) -> DeviceInfo {
        Self::capabilities()
    }

    fn enqueue_burst(&self, qid: usize, ops: &mut VecDeque<RegexOp>) -> usize {
        let Some(qp) = self.queues.get(qid) else {
            return 0;
        };

        let free = qp.nb_desc.saturating_sub(qp.in_flight.load(Ordering::Acquire));
        let mut accepted = 0;
        while accepted < free {
            let Some(op) = ops.pop_front() else {
                break;
            };
            if let Err(op) = qp.submit.push(op) {
                ops.push_front(op);
                break;
            }
            accepted += 1;
        }
        qp.in_flight.fetch_add(accepted, Ordering::AcqRel);
        accepted
    }

    fn dequeue_burst(&self, qid: usize, out: &mut Vec<RegexResponse>, max: usize) -> usize {
        let Some(qp) = self.queues.get(qid) else {
            return 0;
        };

        let mut n = 0;
        while n < max {
            match qp.complete.pop() {
                Some(rsp) => {
                    out.push(rsp);
                    n += 1;
                }
                None => break,
            }
        }
        qp.in_flight.fetch_sub(n, Ordering::AcqRel);
        n
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let engines: Vec<_> = self.engines.lock().drain(..).collect();
        if engines.is_empty() {
            return;
        }
        join_engines(engines);
        tracing::info!("soft-regex device stopped");
    }
}

impl Drop for SoftRegexDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_engines(engines: Vec<JoinHandle<()>>) {
    for handle in engines {
        let name = handle.thread().name().unwrap_or("soft-regex").to_string();
        if handle.join().is_err() {
            tracing::error!(engine = %name, "regex engine thread panicked");
        }
    }
}

/// Per-queue scanning loop
struct Engine {
    qp: Arc<QueuePair>,
    matcher: Arc<Matcher>,
    running: Arc<AtomicBool>,
    max_matches: usize,
    max_scan_time: Option<Duration>,
    window: usize,
}

impl Engine {
    fn run(self) {
        let mut rng = rand::thread_rng();
        let mut done: Vec<RegexResponse> = Vec::with_capacity(self.window);

        while self.running.load(Ordering::Acquire) {
            while done.len() < self.window {
                match self.qp.submit.pop() {
                    Some(op) => done.push(self.matcher.scan(op, self.max_matches, self.max_scan_time)),
                    None => break,
                }
            }

            if done.is_empty() {
                thread::park_timeout(Duration::from_micros(50));
                continue;
            }

            if self.window > 1 {
                done.shuffle(&mut rng);
            }

            for mut rsp in done.drain(..) {
                // Completion slots never run out: responses ≤ in-flight ≤ nb_desc
                while let Err(back) = self.qp.complete.push(rsp) {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    rsp = back;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

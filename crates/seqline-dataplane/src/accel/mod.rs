//! Regex Accelerator
//!
//! Offloaded pattern matching with asynchronous, out-of-order completion.
//!
//! - `device`: the backend contract and op/response types
//! - `soft`: a regex-crate backend with per-queue engine threads
//! - `rules`: raw rule compilation and the compiled database
//! - `batch`: the per-worker submit / force-push / pull protocol

pub mod batch;
pub mod device;
pub mod rules;
pub mod soft;

pub use batch::{BatchQueue, BatchState, DrainOutcome, SubmitSignal};
pub use device::{Completion, DeviceInfo, RegexDevice, RegexMatch, RegexOp, RegexResponse, RspFlags};
pub use rules::{Rule, RuleDatabase};

use crate::config::AcceleratorConfig;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use soft::{SoftDeviceConfig, SoftRegexDevice};
use std::sync::Arc;
use std::time::Duration;

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorKind {
    /// Software matcher built on the `regex` crate
    #[default]
    Soft,
}

impl AcceleratorKind {
    /// Capabilities of the backend before it is opened
    pub fn capabilities(&self) -> DeviceInfo {
        match self {
            AcceleratorKind::Soft => SoftRegexDevice::capabilities(),
        }
    }

    fn open(
        &self,
        config: &AcceleratorConfig,
        nb_queues: usize,
        rules: &RuleDatabase,
    ) -> Result<Arc<dyn RegexDevice>> {
        match self {
            AcceleratorKind::Soft => {
                let soft = SoftDeviceConfig {
                    nb_queues,
                    nb_desc: config.nb_desc,
                    max_matches: config.max_matches,
                    max_scan_time: match config.max_scan_time_us {
                        0 => None,
                        us => Some(Duration::from_micros(us)),
                    },
                    completion_window: config.completion_window,
                };
                Ok(Arc::new(SoftRegexDevice::open(&soft, rules)?))
            }
        }
    }
}

/// Initialized accelerator shared by all workers
pub struct Accelerator {
    kind: AcceleratorKind,
    device: Arc<dyn RegexDevice>,
    nb_queues: usize,
    batch_size: usize,
    group_ids: [u16; device::MAX_GROUPS],
    watchdog: Duration,
}

impl Accelerator {
    /// Compile the raw rules file, writing the compiled database if a path
    /// is configured
    pub fn compile_rules(config: &AcceleratorConfig) -> Result<RuleDatabase> {
        let raw = config
            .rules_file
            .as_ref()
            .ok_or_else(|| PipelineError::Rules("no raw rules file configured".into()))?;

        let db = RuleDatabase::compile_file(raw)?;
        if let Some(out) = &config.compiled_rules_file {
            db.save(out)?;
            tracing::info!(rules = db.len(), path = %out.display(), "compiled rules written");
        }
        Ok(db)
    }

    /// Load rules, check capabilities and open `nb_queues` device queues
    pub fn init(config: &AcceleratorConfig, nb_queues: usize) -> Result<Self> {
        let info = config.kind.capabilities();
        if nb_queues > info.max_queue_pairs {
            return Err(PipelineError::DeviceCapability(format!(
                "{} queues requested, {} supports {}",
                nb_queues, info.name, info.max_queue_pairs
            )));
        }
        if config.max_matches > info.max_matches {
            return Err(PipelineError::DeviceCapability(format!(
                "max matches {} above {} limit {}",
                config.max_matches, info.name, info.max_matches
            )));
        }

        let rules = match (&config.rules_file, &config.compiled_rules_file) {
            (Some(_), _) => Self::compile_rules(config)?,
            (None, Some(compiled)) => RuleDatabase::load(compiled)?,
            (None, None) => return Err(PipelineError::Rules("no rules file configured".into())),
        };

        let mut group_ids = [0u16; device::MAX_GROUPS];
        for (slot, group) in group_ids.iter_mut().zip(&config.group_ids) {
            *slot = *group;
        }

        let device = config.kind.open(config, nb_queues.max(1), &rules)?;
        tracing::info!(device = info.name, queues = nb_queues, rules = rules.len(), "accelerator ready");

        Ok(Self {
            kind: config.kind,
            device,
            nb_queues,
            batch_size: config.batch_size,
            group_ids,
            watchdog: config.drain_watchdog(),
        })
    }

    /// Selected backend
    pub fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    /// Device capabilities
    pub fn info(&self) -> DeviceInfo {
        self.device.info()
    }

    /// Queue pairs opened
    pub fn nb_queues(&self) -> usize {
        self.nb_queues
    }

    /// Shutdown drain bound
    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    /// Batch queue for worker `qid`
    pub fn queue(&self, qid: usize) -> Result<BatchQueue> {
        if qid >= self.nb_queues {
            return Err(PipelineError::Accelerator(format!(
                "queue {} out of range ({} allocated)",
                qid, self.nb_queues
            )));
        }
        Ok(BatchQueue::new(qid, self.device.clone(), self.batch_size, self.group_ids))
    }

    /// Stop the device
    pub fn teardown(&self) {
        self.device.stop();
    }
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("kind", &self.kind)
            .field("nb_queues", &self.nb_queues)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Packet;

    fn config(dir: &tempfile::TempDir) -> AcceleratorConfig {
        let rules = dir.path().join("rules.txt");
        std::fs::write(&rules, "1,1,attack\n2,1,/etc/passwd\n").unwrap();
        AcceleratorConfig {
            rules_file: Some(rules),
            compiled_rules_file: Some(dir.path().join("rules.json")),
            batch_size: 4,
            completion_window: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_then_load_compiled() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let db = Accelerator::compile_rules(&cfg).unwrap();
        assert_eq!(db.len(), 2);

        let compiled_only = AcceleratorConfig {
            rules_file: None,
            ..cfg
        };
        let accel = Accelerator::init(&compiled_only, 1).unwrap();
        assert_eq!(accel.nb_queues(), 1);
        accel.teardown();
    }

    #[test]
    fn test_capability_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let too_many = cfg.kind.capabilities().max_queue_pairs + 1;
        assert!(matches!(
            Accelerator::init(&cfg, too_many),
            Err(PipelineError::DeviceCapability(_))
        ));

        let greedy = AcceleratorConfig {
            max_matches: 10_000,
            ..cfg
        };
        assert!(matches!(
            Accelerator::init(&greedy, 1),
            Err(PipelineError::DeviceCapability(_))
        ));
    }

    #[test]
    fn test_queue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let accel = Accelerator::init(&config(&dir), 2).unwrap();
        assert!(accel.queue(2).is_err());

        let mut q = accel.queue(1).unwrap();
        let mut completed = Vec::new();
        for i in 0..10u32 {
            let mut p = Packet::new(b"GET /etc/passwd attack");
            p.set_seqn(i);
            if q.submit(p) == SubmitSignal::BatchFull {
                q.force_push(&mut completed);
            } else {
                q.pull(&mut completed);
            }
        }

        let outcome = q.drain_on_shutdown(accel.watchdog(), &mut completed);
        assert_eq!(outcome, DrainOutcome::Complete);
        assert_eq!(completed.len(), 10);
        assert_eq!(q.stats().rx_buf_match_cnt, 10);
        assert_eq!(q.stats().rx_total_match, 20);
        accel.teardown();
    }
}

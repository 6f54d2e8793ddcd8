//! Pipeline Stages
//!
//! A stage type supplies `init`, `process` and `free`, and is registered by
//! name before the topology is built. Each instance runs on its own worker
//! core and sees one packet at a time.

use crate::buffer::Packet;
use crate::config::StageParams;
use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// What the worker does with a packet after `process`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue to the next layer
    Forward,
    /// Mark for discard; still travels to the reorder stage
    Drop,
    /// Hand to the accelerator; returns to the pipeline on completion
    Offload,
}

/// Where an instance sits, handed to `init`
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    /// Layer index
    pub layer: usize,
    /// Instance index within the layer
    pub index: usize,
    /// Global worker index (also the accelerator queue id)
    pub worker_id: usize,
    /// Burst size
    pub batch_size: usize,
    /// Whether this instance owns an accelerator queue
    pub accelerated: bool,
    /// Layer parameters
    pub params: &'a StageParams,
}

impl StageContext<'_> {
    /// Unsigned integer parameter with a default
    pub fn param_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.params.get(key) {
            None => Ok(default),
            Some(v) => v.as_u64().ok_or_else(|| {
                PipelineError::Config(format!("stage parameter {} must be an unsigned integer", key))
            }),
        }
    }
}

/// Stage capability contract
pub trait Stage: Send {
    /// Stage type name
    fn name(&self) -> &'static str;

    /// Prepare private state; failure aborts startup
    fn init(&mut self, _ctx: &StageContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Handle one packet
    fn process(&mut self, pkt: &mut Packet, dp: &mut Dataplane) -> Result<Verdict>;

    /// Release private state at teardown
    fn free(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Primitives available inside `process`
#[derive(Debug, Clone)]
pub struct Dataplane {
    worker_id: usize,
    accelerated: bool,
    burst_time: Instant,
}

impl Dataplane {
    /// Surface for one worker
    pub fn new(worker_id: usize, accelerated: bool) -> Self {
        Self {
            worker_id,
            accelerated,
            burst_time: Instant::now(),
        }
    }

    /// Refresh the burst timestamp (once per dequeued burst)
    #[inline]
    pub fn begin_burst(&mut self) {
        self.burst_time = Instant::now();
    }

    /// Time the current burst was dequeued
    #[inline]
    pub fn now(&self) -> Instant {
        self.burst_time
    }

    /// Owning worker
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Run `predicate`; a true result drops the packet
    #[inline]
    pub fn filter<F>(&self, pkt: &Packet, predicate: F) -> Verdict
    where
        F: FnOnce(&Packet) -> bool,
    {
        if predicate(pkt) {
            Verdict::Drop
        } else {
            Verdict::Forward
        }
    }

    /// Run `mutator` on the packet in place
    #[inline]
    pub fn transform<F>(&self, pkt: &mut Packet, mutator: F) -> Verdict
    where
        F: FnOnce(&mut Packet),
    {
        mutator(pkt);
        Verdict::Forward
    }

    /// Submit the packet to the accelerator
    #[inline]
    pub fn offload(&self) -> Result<Verdict> {
        if self.accelerated {
            Ok(Verdict::Offload)
        } else {
            Err(PipelineError::Accelerator(format!(
                "worker {} has no accelerator queue",
                self.worker_id
            )))
        }
    }
}

/// Builds a fresh stage instance
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Stage types by name
#[derive(Clone)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    /// Registry with no stage types
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in stage types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::stages::register_builtins(&mut registry);
        registry
    }

    /// Register a stage type, replacing any previous one of that name
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(stage = %name, "stage type re-registered");
        }
    }

    /// Instantiate a registered stage type
    pub fn create(&self, name: &str) -> Result<Box<dyn Stage>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingStage {
        seen: u64,
    }

    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn process(&mut self, _pkt: &mut Packet, _dp: &mut Dataplane) -> Result<Verdict> {
            self.seen += 1;
            Ok(Verdict::Forward)
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = StageRegistry::new();
        assert!(!registry.contains("counting"));

        registry.register("counting", || Box::new(CountingStage { seen: 0 }));
        let mut stage = registry.create("counting").unwrap();
        assert_eq!(stage.name(), "counting");

        let mut dp = Dataplane::new(0, false);
        let mut pkt = Packet::new(b"x");
        assert_eq!(stage.process(&mut pkt, &mut dp).unwrap(), Verdict::Forward);
    }

    #[test]
    fn test_unknown_stage() {
        let registry = StageRegistry::new();
        assert!(matches!(
            registry.create("nope"),
            Err(PipelineError::UnknownStage(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_builtins_present() {
        let registry = StageRegistry::with_builtins();
        for name in ["echo", "timestamp", "min_len", "normalize", "regex", "jitter"] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_dataplane_primitives() {
        let dp = Dataplane::new(3, false);
        let mut pkt = Packet::new(b"short");

        assert_eq!(dp.filter(&pkt, |p| p.len() < 10), Verdict::Drop);
        assert_eq!(dp.filter(&pkt, |p| p.len() < 2), Verdict::Forward);

        let verdict = dp.transform(&mut pkt, |p| p.data_mut().make_ascii_uppercase());
        assert_eq!(verdict, Verdict::Forward);
        assert_eq!(pkt.data(), b"SHORT");

        assert!(dp.offload().is_err());
        assert_eq!(Dataplane::new(0, true).offload().unwrap(), Verdict::Offload);
    }

    #[test]
    fn test_context_params() {
        let mut params = StageParams::new();
        params.insert("min_len".into(), 64.into());
        params.insert("bad".into(), "x".into());
        let ctx = StageContext {
            layer: 0,
            index: 0,
            worker_id: 0,
            batch_size: 64,
            accelerated: false,
            params: &params,
        };
        assert_eq!(ctx.param_u64("min_len", 0).unwrap(), 64);
        assert_eq!(ctx.param_u64("missing", 7).unwrap(), 7);
        assert!(ctx.param_u64("bad", 0).is_err());
    }
}

//! Topology Builder
//!
//! Turns a layered stage list into stage instances connected by rings.
//!
//! ```text
//!  Bipartite (3 → 2)                    Shared (3 → 2)
//!
//!  head_0 ─▶ L0.0 ─┬─▶ L1.0 ─▶ tail_0   head ─▶ L0.0 ─┐          ┌─▶ L1.0 ─┐
//!  head_1 ─▶ L0.1 ─┼─▶ L1.1 ─▶ tail_1       ├─▶ L0.1 ─┼─▶ link_0_1 ┤        ├─▶ tail
//!  head_2 ─▶ L0.2 ─┘   (6 link rings)       └─▶ L0.2 ─┘          └─▶ L1.1 ─┘
//! ```
//!
//! Every ring's mode is derived from the number of producers and consumers
//! actually attached, then checked once wiring is complete. Any failure
//! frees the stages already initialized and aborts before a worker starts.

use crate::accel::{Accelerator, BatchQueue};
use crate::config::{LayerConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::ring::{Ring, RingMode};
use crate::stage::{Stage, StageContext, StageRegistry};
use crate::{DEFAULT_BATCH_SIZE, DEFAULT_RING_SIZE, MAX_INSTANCES_PER_LAYER, MAX_LAYERS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Wiring between adjacent layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// A dedicated SP/SC ring per (producer, consumer) pair
    #[default]
    Bipartite,
    /// One ring per layer boundary shared by every instance
    Shared,
}

/// Layer and position of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId {
    /// Layer index
    pub layer: usize,
    /// Index within the layer
    pub index: usize,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}.{}", self.layer, self.index)
    }
}

/// One stage running on one worker core
pub struct StageInstance {
    /// Position in the graph
    pub id: InstanceId,
    /// Registered stage type
    pub stage_type: String,
    /// Stage implementation
    pub stage: Box<dyn Stage>,
    /// Burst size
    pub batch_size: usize,
    /// Rings this instance dequeues from
    pub rings_in: Vec<Arc<Ring>>,
    /// Rings this instance enqueues to
    pub rings_out: Vec<Arc<Ring>>,
    /// Global worker index; also the accelerator queue id
    pub worker_id: usize,
    /// Logical core (0 is reserved for ingress)
    pub core: usize,
    /// Accelerator queue, when offloading
    pub accel: Option<BatchQueue>,
}

impl fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageInstance")
            .field("id", &self.id)
            .field("stage_type", &self.stage_type)
            .field("rings_in", &self.rings_in.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("rings_out", &self.rings_out.iter().map(|r| r.name()).collect::<Vec<_>>())
            .field("core", &self.core)
            .finish()
    }
}

/// Rings the ingress core and teardown need after workers own the instances
#[derive(Debug, Clone, Default)]
pub struct TopologyRings {
    /// Fed by ingress
    pub head: Vec<Arc<Ring>>,
    /// Drained by ingress into the reorder buffer
    pub tail: Vec<Arc<Ring>>,
    /// Between layers
    pub links: Vec<Arc<Ring>>,
}

impl TopologyRings {
    /// Every distinct ring
    pub fn all(&self) -> Vec<Arc<Ring>> {
        let mut all: Vec<Arc<Ring>> = Vec::new();
        for ring in self.head.iter().chain(&self.tail).chain(&self.links) {
            if !all.iter().any(|r| Arc::ptr_eq(r, ring)) {
                all.push(ring.clone());
            }
        }
        all
    }
}

/// Built pipeline graph
#[derive(Debug)]
pub struct Topology {
    layers: Vec<Vec<StageInstance>>,
    rings: TopologyRings,
    link_mode: LinkMode,
}

impl Topology {
    /// Layer count
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Total stage instances
    pub fn num_instances(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Instances of layer `idx`
    pub fn layer(&self, idx: usize) -> &[StageInstance] {
        &self.layers[idx]
    }

    /// Every ring of the graph
    pub fn rings(&self) -> &TopologyRings {
        &self.rings
    }

    /// Wiring between layers
    pub fn link_mode(&self) -> LinkMode {
        self.link_mode
    }

    /// Hand out instances for launching
    pub fn into_parts(self) -> (Vec<StageInstance>, TopologyRings) {
        (self.layers.into_iter().flatten().collect(), self.rings)
    }

    /// Call `free` on every stage (used when the graph is never launched)
    pub fn teardown(self) {
        for instance in self.layers.into_iter().flatten() {
            free_instance(instance);
        }
    }
}

/// Builder for `Topology`
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    layers: Vec<LayerConfig>,
    link_mode: LinkMode,
    ring_size: usize,
    batch_size: usize,
    max_layers: usize,
    max_instances: usize,
    cores: usize,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            link_mode: LinkMode::Bipartite,
            ring_size: DEFAULT_RING_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_layers: MAX_LAYERS,
            max_instances: MAX_INSTANCES_PER_LAYER,
            cores: crate::config::available_cores(),
        }
    }
}

impl TopologyBuilder {
    /// Builder sized for this machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder mirroring a validated configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            layers: config.layers.clone(),
            link_mode: config.link_mode,
            ring_size: config.ring_size,
            batch_size: config.batch_size,
            max_layers: config.max_layers,
            max_instances: config.max_instances_per_layer,
            cores: config.cores,
        }
    }

    /// Append a layer of `instances` copies of `stage`
    pub fn layer(mut self, stage: impl Into<String>, instances: usize) -> Self {
        self.layers.push(LayerConfig::new(stage, instances));
        self
    }

    /// Append a fully specified layer
    pub fn layer_config(mut self, layer: LayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    /// Wiring between adjacent layers
    pub fn link_mode(mut self, mode: LinkMode) -> Self {
        self.link_mode = mode;
        self
    }

    /// Ring capacity
    pub fn ring_size(mut self, size: usize) -> Self {
        self.ring_size = size;
        self
    }

    /// Default burst size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Override topology limits
    pub fn limits(mut self, max_layers: usize, max_instances: usize) -> Self {
        self.max_layers = max_layers;
        self.max_instances = max_instances;
        self
    }

    /// Cores available, ingress core included
    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Total stage instances requested
    pub fn total_instances(&self) -> usize {
        self.layers.iter().map(|l| l.instances).sum()
    }

    /// Check counts and stage names without building anything
    pub fn validate(&self, registry: &StageRegistry) -> Result<()> {
        if self.layers.len() > self.max_layers {
            return Err(PipelineError::Topology(format!(
                "{} layers requested, maximum is {}",
                self.layers.len(),
                self.max_layers
            )));
        }

        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.instances == 0 {
                return Err(PipelineError::Topology(format!("layer {} has no instances", idx)));
            }
            if layer.instances > self.max_instances {
                return Err(PipelineError::Topology(format!(
                    "layer {} has {} instances, maximum is {}",
                    idx, layer.instances, self.max_instances
                )));
            }
            if !registry.contains(&layer.stage) {
                return Err(PipelineError::UnknownStage(layer.stage.clone()));
            }
        }

        let required = self.total_instances() + 1;
        if required > self.cores {
            return Err(PipelineError::InsufficientCores {
                required,
                available: self.cores,
            });
        }
        Ok(())
    }

    /// Create, initialize and wire every stage instance
    pub fn build(self, registry: &StageRegistry, accel: Option<&Accelerator>) -> Result<Topology> {
        self.validate(registry)?;

        if self.layers.is_empty() {
            return self.build_passthrough();
        }

        let mut layers = self.create_instances(registry, accel)?;
        match self.wire(&mut layers) {
            Ok(rings) => {
                tracing::info!(
                    layers = layers.len(),
                    instances = self.total_instances(),
                    rings = rings.all().len(),
                    mode = ?self.link_mode,
                    "topology built"
                );
                Ok(Topology {
                    layers,
                    rings,
                    link_mode: self.link_mode,
                })
            }
            Err(e) => {
                for instance in layers.into_iter().flatten() {
                    free_instance(instance);
                }
                Err(e)
            }
        }
    }

    /// No stages: ingress feeds the tail directly
    fn build_passthrough(&self) -> Result<Topology> {
        let ring = Arc::new(Ring::new("head_tail", self.ring_size, RingMode::SpSc)?);
        ring.attach_producer();
        ring.attach_consumer();
        ring.validate()?;

        Ok(Topology {
            layers: Vec::new(),
            rings: TopologyRings {
                head: vec![ring.clone()],
                tail: vec![ring],
                links: Vec::new(),
            },
            link_mode: self.link_mode,
        })
    }

    fn create_instances(
        &self,
        registry: &StageRegistry,
        accel: Option<&Accelerator>,
    ) -> Result<Vec<Vec<StageInstance>>> {
        let mut layers: Vec<Vec<StageInstance>> = Vec::with_capacity(self.layers.len());
        let mut worker_id = 0;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let mut instances = Vec::with_capacity(layer.instances);
            for index in 0..layer.instances {
                let id = InstanceId { layer: layer_idx, index };
                match self.create_instance(registry, accel, layer, id, worker_id) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => {
                        tracing::error!(instance = %id, stage = %layer.stage, error = %e, "stage init failed");
                        for instance in layers.into_iter().flatten().chain(instances) {
                            free_instance(instance);
                        }
                        return Err(e);
                    }
                }
                worker_id += 1;
            }
            layers.push(instances);
        }
        Ok(layers)
    }

    fn create_instance(
        &self,
        registry: &StageRegistry,
        accel: Option<&Accelerator>,
        layer: &LayerConfig,
        id: InstanceId,
        worker_id: usize,
    ) -> Result<StageInstance> {
        let batch_size = layer.batch_size.unwrap_or(self.batch_size);
        let accel = accel.map(|a| a.queue(worker_id)).transpose()?;

        let mut stage = registry.create(&layer.stage)?;
        let ctx = StageContext {
            layer: id.layer,
            index: id.index,
            worker_id,
            batch_size,
            accelerated: accel.is_some(),
            params: &layer.params,
        };
        stage.init(&ctx)?;

        Ok(StageInstance {
            id,
            stage_type: layer.stage.clone(),
            stage,
            batch_size,
            rings_in: Vec::new(),
            rings_out: Vec::new(),
            worker_id,
            core: worker_id + 1,
            accel,
        })
    }

    fn wire(&self, layers: &mut [Vec<StageInstance>]) -> Result<TopologyRings> {
        let mut rings = TopologyRings::default();
        let last = layers.len() - 1;

        // Head: ingress is the only producer
        let first = layers[0].len();
        let nb_head = match self.link_mode {
            LinkMode::Bipartite => first,
            LinkMode::Shared => 1,
        };
        for r in 0..nb_head {
            let consumers = (r..first).step_by(nb_head).count();
            let ring = self.ring(format!("head_{}", r), 1, consumers)?;
            ring.attach_producer();
            rings.head.push(ring);
        }
        for (j, instance) in layers[0].iter_mut().enumerate() {
            let ring = &rings.head[j % nb_head];
            ring.attach_consumer();
            instance.rings_in.push(ring.clone());
        }

        // Links between adjacent layers
        for i in 0..last {
            let (left, right) = layers.split_at_mut(i + 1);
            let (producers, consumers) = (&mut left[i], &mut right[0]);

            match self.link_mode {
                LinkMode::Bipartite => {
                    for (j, producer) in producers.iter_mut().enumerate() {
                        for (k, consumer) in consumers.iter_mut().enumerate() {
                            let ring = self.ring(format!("link_{}_{}_{}_{}", i, i + 1, j, k), 1, 1)?;
                            connect(producer, consumer, &ring);
                            rings.links.push(ring);
                        }
                    }
                }
                LinkMode::Shared => {
                    let ring = self.ring(
                        format!("link_{}_{}", i, i + 1),
                        producers.len(),
                        consumers.len(),
                    )?;
                    for producer in producers.iter_mut() {
                        ring.attach_producer();
                        producer.rings_out.push(ring.clone());
                    }
                    for consumer in consumers.iter_mut() {
                        ring.attach_consumer();
                        consumer.rings_in.push(ring.clone());
                    }
                    rings.links.push(ring);
                }
            }
        }

        // Tail: ingress is the only consumer
        match self.link_mode {
            LinkMode::Bipartite => {
                for (k, instance) in layers[last].iter_mut().enumerate() {
                    let ring = self.ring(format!("tail_{}", k), 1, 1)?;
                    ring.attach_producer();
                    ring.attach_consumer();
                    instance.rings_out.push(ring.clone());
                    rings.tail.push(ring);
                }
            }
            LinkMode::Shared => {
                let ring = self.ring("tail".to_string(), layers[last].len(), 1)?;
                for instance in layers[last].iter_mut() {
                    ring.attach_producer();
                    instance.rings_out.push(ring.clone());
                }
                ring.attach_consumer();
                rings.tail.push(ring);
            }
        }

        for ring in rings.all() {
            ring.validate()?;
        }
        Ok(rings)
    }

    fn ring(&self, name: String, producers: usize, consumers: usize) -> Result<Arc<Ring>> {
        let mode = RingMode::for_degree(producers, consumers);
        Ok(Arc::new(Ring::new(name, self.ring_size, mode)?))
    }
}

fn connect(producer: &mut StageInstance, consumer: &mut StageInstance, ring: &Arc<Ring>) {
    ring.attach_producer();
    ring.attach_consumer();
    producer.rings_out.push(ring.clone());
    consumer.rings_in.push(ring.clone());
}

/// Run a stage's `free`, logging failures
pub(crate) fn free_instance(mut instance: StageInstance) {
    if let Err(e) = instance.stage.free() {
        tracing::warn!(instance = %instance.id, error = %e, "stage free failed");
    }
}

//! Seqline Ordered Dataplane
//!
//! Multi-core packet pipeline that fans packets out across pinned worker
//! cores and restores their arrival order before egress.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          SEQLINE PIPELINE                            │
//! │                                                                      │
//! │  Core 0 (ingress)            Cores 1..N (stage workers)              │
//! │                                                                      │
//! │  ┌───────────┐   head     ┌──────────┐  link  ┌──────────┐   tail    │
//! │  │ Ingress   │──rings───▶ │ Layer 0  │──────▶ │ Layer 1  │──rings─┐  │
//! │  │ Source    │            │ inst 0..j│  rings │ inst 0..k│        │  │
//! │  └─────┬─────┘            └────┬─────┘        └──────────┘        │  │
//! │        ▼                       │ offload                          │  │
//! │  ┌───────────┐            ┌────▼──────────────┐                   │  │
//! │  │ Sequencer │            │ Accelerator Batch │ (out of order     │  │
//! │  └───────────┘            │ Engine            │  completions)     │  │
//! │                           └───────────────────┘                   │  │
//! │  ┌───────────┐   ┌─────────────┐                                  │  │
//! │  │ Egress    │◀──│ Reorder     │◀─────────────────────────────────┘  │
//! │  │ Sink      │   │ Buffer      │                                     │
//! │  └───────────┘   └─────────────┘                                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering Model
//!
//! 1. **Sequence on ingress**: every packet gets a contiguous `u32` tag
//! 2. **No ordering across rings**: FIFO holds only within one ring
//! 3. **Reorder at egress**: a single-consumer sliding window is the sole
//!    authority for total order
//! 4. **Owned packets**: a packet has exactly one owner and moves on enqueue

#![warn(missing_docs)]

pub mod accel;
pub mod buffer;
pub mod config;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod orchestrator;
pub mod reorder;
pub mod ring;
pub mod sequencer;
pub mod stage;
pub mod stages;
pub mod stats;
pub mod topology;
pub mod worker;

pub use accel::{Accelerator, AcceleratorKind, BatchQueue, RegexDevice};
pub use buffer::Packet;
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use orchestrator::{Orchestrator, RunReport};
pub use reorder::ReorderBuffer;
pub use ring::{Ring, RingMode};
pub use sequencer::Sequencer;
pub use stage::{Dataplane, Stage, StageRegistry, Verdict};
pub use topology::{LinkMode, Topology, TopologyBuilder};

/// Default packets per burst
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default ring capacity (packets)
pub const DEFAULT_RING_SIZE: usize = 8192;

/// Default reorder window (must be a power of two)
pub const DEFAULT_REORDER_WINDOW: usize = 1 << 16;

/// Default maximum number of stage layers
pub const MAX_LAYERS: usize = 8;

/// Default maximum instances in one layer
pub const MAX_INSTANCES_PER_LAYER: usize = 8;

//! Pipeline errors

use thiserror::Error;

/// Result alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fatal pipeline errors
///
/// Everything here aborts startup. Per-packet conditions (reorder drops,
/// accelerator completion flags) are counted instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Layer list breaks a topology limit
    #[error("invalid topology: {0}")]
    Topology(String),

    /// More workers than cores
    #[error("insufficient cores: {required} required, {available} available")]
    InsufficientCores {
        /// Workers plus the ingress core
        required: usize,
        /// Cores usable by the pipeline
        available: usize,
    },

    /// Ring could not be created
    #[error("ring allocation failed for {name}: {reason}")]
    RingAlloc {
        /// Ring name
        name: String,
        /// What was wrong
        reason: String,
    },

    /// Ring attachments do not fit its declared mode
    #[error("ring {name} declared {mode} but wired with {producers} producer(s) and {consumers} consumer(s)")]
    RingMode {
        /// Ring name
        name: String,
        /// Declared mode
        mode: String,
        /// Attached producers
        producers: usize,
        /// Attached consumers
        consumers: usize,
    },

    /// No stage registered under this name
    #[error("unknown stage type: {0}")]
    UnknownStage(String),

    /// Stage `init` or `process` failed
    #[error("stage {stage} failed: {reason}")]
    Stage {
        /// Stage type
        stage: String,
        /// Failure detail
        reason: String,
    },

    /// Accelerator setup or use failed
    #[error("accelerator error: {0}")]
    Accelerator(String),

    /// Requested more than the device offers
    #[error("device capability mismatch: {0}")]
    DeviceCapability(String),

    /// Rules file unreadable or invalid
    #[error("rule error: {0}")]
    Rules(String),

    /// Ingress source failure
    #[error("ingress error: {0}")]
    Ingress(String),

    /// Worker thread could not be started
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// `run` called twice on one orchestrator
    #[error("pipeline already running")]
    AlreadyRunning,

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a stage failure
    pub fn stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

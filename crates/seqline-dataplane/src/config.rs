//! Pipeline Configuration
//!
//! Loaded from TOML or JSON, validated once at startup. Problems that can be
//! corrected (too many cores requested, settings that do not apply to the
//! chosen input mode) become buffered warnings shown in the final report;
//! everything else is a startup error.

use crate::accel::AcceleratorKind;
use crate::buffer::MAX_PACKET_SIZE;
use crate::error::{PipelineError, Result};
use crate::reorder::MAX_WINDOW;
use crate::topology::LinkMode;
use crate::{
    DEFAULT_BATCH_SIZE, DEFAULT_REORDER_WINDOW, DEFAULT_RING_SIZE, MAX_INSTANCES_PER_LAYER,
    MAX_LAYERS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Warnings kept for the final report
pub const MAX_WARNINGS: usize = 10;

/// Free-form stage parameters
pub type StageParams = BTreeMap<String, serde_json::Value>;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cores available to the pipeline, ingress core included (0 = all)
    pub cores: usize,
    /// Pin each worker thread to its core
    pub pin_cores: bool,
    /// Ring capacity in packets
    pub ring_size: usize,
    /// Default burst size for ingress and stages
    pub batch_size: usize,
    /// Reorder window W
    pub reorder_window: usize,
    /// Check reorder output contiguity on every drain
    pub verify_order: bool,
    /// Stamp packets on ingress and report per-packet latency at egress
    pub latency_mode: bool,
    /// Wiring between adjacent layers
    pub link_mode: LinkMode,
    /// Layer count limit
    pub max_layers: usize,
    /// Instance limit per layer
    pub max_instances_per_layer: usize,
    /// Stage layers, in order
    pub layers: Vec<LayerConfig>,
    /// Regex accelerator, if any stage offloads
    pub accelerator: Option<AcceleratorConfig>,
    /// Ingress source
    pub input: InputConfig,
    /// Stop after this many seconds
    pub duration_secs: Option<u64>,
    /// After input ends, give up waiting for in-flight packets after this long
    pub flush_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cores: 0,
            pin_cores: true,
            ring_size: DEFAULT_RING_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            reorder_window: DEFAULT_REORDER_WINDOW,
            verify_order: false,
            latency_mode: false,
            link_mode: LinkMode::Bipartite,
            max_layers: MAX_LAYERS,
            max_instances_per_layer: MAX_INSTANCES_PER_LAYER,
            layers: vec![LayerConfig::new("echo", 1)],
            accelerator: None,
            input: InputConfig::default(),
            duration_secs: None,
            flush_timeout_ms: 5_000,
        }
    }
}

/// One layer of identical stage instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Registered stage type
    pub stage: String,
    /// Parallel instances
    pub instances: usize,
    /// Burst size override
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Stage-specific parameters
    #[serde(default)]
    pub params: StageParams,
}

impl LayerConfig {
    /// Layer with default batch size and no parameters
    pub fn new(stage: impl Into<String>, instances: usize) -> Self {
        Self {
            stage: stage.into(),
            instances,
            batch_size: None,
            params: StageParams::new(),
        }
    }

    /// Add a stage parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Regex accelerator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Device backend
    pub kind: AcceleratorKind,
    /// Raw rules file, compiled at startup
    pub rules_file: Option<PathBuf>,
    /// Compiled rules database (written when `rules_file` is set)
    pub compiled_rules_file: Option<PathBuf>,
    /// Ops per submission batch
    pub batch_size: usize,
    /// Descriptors per device queue
    pub nb_desc: usize,
    /// Matches reported per op (0 = device maximum)
    pub max_matches: usize,
    /// Scan time budget per op in microseconds (0 = unlimited)
    pub max_scan_time_us: u64,
    /// Completions are shuffled within windows of this many ops
    pub completion_window: usize,
    /// Rule groups selected by every op
    pub group_ids: Vec<u16>,
    /// Bound on the shutdown drain
    pub drain_watchdog_secs: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            kind: AcceleratorKind::Soft,
            rules_file: None,
            compiled_rules_file: None,
            batch_size: DEFAULT_BATCH_SIZE,
            nb_desc: 1024,
            max_matches: 0,
            max_scan_time_us: 0,
            completion_window: 16,
            group_ids: vec![1],
            drain_watchdog_secs: 10,
        }
    }
}

impl AcceleratorConfig {
    /// Shutdown drain bound
    pub fn drain_watchdog(&self) -> Duration {
        Duration::from_secs(self.drain_watchdog_secs)
    }
}

/// Ingress source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Generated packets with a fixed payload
    #[default]
    Synthetic,
    /// A text file cut into fixed-size buffers
    TextFile,
}

/// Ingress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Source kind
    pub mode: InputMode,
    /// Input file for file-backed modes
    pub file: Option<PathBuf>,
    /// Synthetic packets to generate (0 = unbounded)
    pub packets: u64,
    /// Synthetic payload; repeated up to `packet_size`
    pub payload: String,
    /// Synthetic payload size in bytes
    pub packet_size: usize,
    /// Text file buffer length
    pub buf_len: usize,
    /// Bytes re-read from the previous buffer
    pub overlap: usize,
    /// Passes over the text file (0 = unbounded)
    pub iterations: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            mode: InputMode::Synthetic,
            file: None,
            packets: 0,
            payload: "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n".into(),
            packet_size: 64,
            buf_len: 1024,
            overlap: 0,
            iterations: 1,
        }
    }
}

/// Buffered configuration warnings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warnings {
    entries: Vec<String>,
}

impl Warnings {
    /// Record a warning; the last slot becomes a suppression marker
    pub fn record(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("{}", warning);
        match self.entries.len() {
            n if n >= MAX_WARNINGS => {}
            n if n == MAX_WARNINGS - 1 => self.entries.push("-- warnings suppressed --".into()),
            _ => self.entries.push(warning),
        }
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded warnings, in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Take the recorded warnings
    pub fn into_vec(self) -> Vec<String> {
        self.entries
    }
}

/// Cores usable by this process
pub fn available_cores() -> usize {
    core_affinity::get_core_ids()
        .map(|ids| ids.len())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
}

impl PipelineConfig {
    /// Load from a TOML or JSON file (chosen by extension)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content)
                .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
        }
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Total stage instances across layers
    pub fn total_instances(&self) -> usize {
        self.layers.iter().map(|l| l.instances).sum()
    }

    /// Check settings, clamping what can be clamped
    pub fn validate(&mut self) -> Result<Warnings> {
        self.validate_with_cores(available_cores())
    }

    /// Same as `validate` against an explicit core count
    pub fn validate_with_cores(&mut self, available: usize) -> Result<Warnings> {
        let mut warnings = Warnings::default();

        if self.cores == 0 {
            self.cores = available;
        } else if self.cores > available {
            warnings.record(format!(
                "{} cores requested but only {} available, clamping",
                self.cores, available
            ));
            self.cores = available;
        }

        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(PipelineError::Config(format!(
                "ring size {} is not a power of two",
                self.ring_size
            )));
        }
        if self.batch_size == 0 || self.batch_size > self.ring_size {
            return Err(PipelineError::Config(format!(
                "batch size {} must be between 1 and ring size {}",
                self.batch_size, self.ring_size
            )));
        }
        if !self.reorder_window.is_power_of_two() || self.reorder_window > MAX_WINDOW {
            return Err(PipelineError::Config(format!(
                "reorder window {} must be a power of two no larger than {}",
                self.reorder_window, MAX_WINDOW
            )));
        }
        for layer in &self.layers {
            if let Some(batch) = layer.batch_size {
                if batch == 0 || batch > self.ring_size {
                    return Err(PipelineError::Config(format!(
                        "layer {} batch size {} must be between 1 and ring size {}",
                        layer.stage, batch, self.ring_size
                    )));
                }
            }
        }

        self.validate_input(&mut warnings)?;
        if let Some(accel) = &self.accelerator {
            accel.validate(&mut warnings)?;
        }

        Ok(warnings)
    }

    fn validate_input(&self, warnings: &mut Warnings) -> Result<()> {
        let input = &self.input;
        match input.mode {
            InputMode::TextFile => {
                if input.file.is_none() {
                    return Err(PipelineError::Config("input file not specified".into()));
                }
                if input.buf_len == 0 {
                    return Err(PipelineError::Config("buf-length must be non-zero".into()));
                }
                if input.overlap >= input.buf_len {
                    return Err(PipelineError::Config("buf-overlap >= buf-length".into()));
                }
                if input.buf_len > MAX_PACKET_SIZE {
                    return Err(PipelineError::Config(format!(
                        "buf-length {} exceeds max packet size {}",
                        input.buf_len, MAX_PACKET_SIZE
                    )));
                }
                if input.packets != 0 {
                    warnings.record("packets not applicable to text_file mode");
                }
                if self.duration_secs.is_some() && input.iterations != 0 {
                    warnings.record("conflicting iteration and time limits");
                }
            }
            InputMode::Synthetic => {
                if input.file.is_some() {
                    warnings.record("file not applicable to synthetic mode");
                }
                if input.overlap != 0 {
                    warnings.record("buf-overlap not applicable to synthetic mode");
                }
                if input.packet_size == 0 || input.packet_size > MAX_PACKET_SIZE {
                    return Err(PipelineError::Config(format!(
                        "packet size {} must be between 1 and {}",
                        input.packet_size, MAX_PACKET_SIZE
                    )));
                }
            }
        }
        Ok(())
    }
}

impl AcceleratorConfig {
    fn validate(&self, warnings: &mut Warnings) -> Result<()> {
        if self.rules_file.is_none() && self.compiled_rules_file.is_none() {
            return Err(PipelineError::Config("accelerator requires a rules file".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("accelerator batch size must be non-zero".into()));
        }
        if self.nb_desc == 0 {
            return Err(PipelineError::Config("accelerator descriptors must be non-zero".into()));
        }
        if self.group_ids.is_empty() || self.group_ids.len() > 4 || self.group_ids.contains(&0) {
            return Err(PipelineError::Config(
                "accelerator needs 1 to 4 non-zero rule groups".into(),
            ));
        }
        if self.nb_desc < self.batch_size {
            warnings.record(format!(
                "accelerator descriptors ({}) smaller than batch size ({})",
                self.nb_desc, self.batch_size
            ));
        }
        if self.completion_window > 1 && self.kind != AcceleratorKind::Soft {
            warnings.record("completion-window not applicable to this regex device");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = PipelineConfig::default();
        let warnings = config.validate_with_cores(4).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.cores, 4);
    }

    #[test]
    fn test_cores_clamped_with_warning() {
        let mut config = PipelineConfig {
            cores: 64,
            ..Default::default()
        };
        let warnings = config.validate_with_cores(8).unwrap();
        assert_eq!(config.cores, 8);
        assert_eq!(warnings.iter().count(), 1);
    }

    #[test]
    fn test_bad_sizes_rejected() {
        let mut config = PipelineConfig {
            ring_size: 1000,
            ..Default::default()
        };
        assert!(config.validate_with_cores(4).is_err());

        let mut config = PipelineConfig {
            reorder_window: 3,
            ..Default::default()
        };
        assert!(config.validate_with_cores(4).is_err());

        let mut config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate_with_cores(4).is_err());

        let mut config = PipelineConfig::default();
        config.input.packet_size = MAX_PACKET_SIZE + 1;
        let err = config.validate_with_cores(4).unwrap_err();
        assert!(err.to_string().contains("packet size"));
    }

    #[test]
    fn test_text_file_overlap() {
        let mut config = PipelineConfig::default();
        config.input.mode = InputMode::TextFile;
        config.input.file = Some("input.txt".into());
        config.input.buf_len = 100;
        config.input.overlap = 100;
        let err = config.validate_with_cores(4).unwrap_err();
        assert!(err.to_string().contains("buf-overlap"));
    }

    #[test]
    fn test_warnings_suppressed_after_limit() {
        let mut warnings = Warnings::default();
        for i in 0..25 {
            warnings.record(format!("warning {}", i));
        }
        let all = warnings.into_vec();
        assert_eq!(all.len(), MAX_WARNINGS);
        assert_eq!(all[MAX_WARNINGS - 1], "-- warnings suppressed --");
        assert_eq!(all[0], "warning 0");
    }

    #[test]
    fn test_parse_toml() {
        let config = PipelineConfig::from_toml(
            r#"
            cores = 4
            ring_size = 1024
            link_mode = "shared"

            [[layers]]
            stage = "echo"
            instances = 2

            [[layers]]
            stage = "min_len"
            instances = 1
            params = { min_len = 32 }

            [input]
            mode = "synthetic"
            packets = 1000

            [accelerator]
            rules_file = "rules.txt"
            batch_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.cores, 4);
        assert_eq!(config.link_mode, LinkMode::Shared);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.total_instances(), 3);
        assert_eq!(config.layers[1].params["min_len"], 32);
        assert_eq!(config.input.packets, 1000);
        let accel = config.accelerator.unwrap();
        assert_eq!(accel.batch_size, 8);
        assert_eq!(accel.nb_desc, 1024);
        assert_eq!(accel.group_ids, vec![1]);
    }

    #[test]
    fn test_shipped_config_parses() {
        let mut config =
            PipelineConfig::from_toml(include_str!("../../../config/pipeline.toml")).unwrap();
        assert_eq!(config.total_instances(), 4);
        assert!(config.accelerator.is_some());
        assert!(config.validate_with_cores(8).unwrap().is_empty());
    }

    #[test]
    fn test_load_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{ "batch_size": 32, "layers": [{ "stage": "echo", "instances": 3 }] }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.total_instances(), 3);
    }

    #[test]
    fn test_accelerator_groups_validated() {
        let mut config = PipelineConfig {
            accelerator: Some(AcceleratorConfig {
                rules_file: Some("rules.txt".into()),
                group_ids: vec![1, 0],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate_with_cores(4).is_err());
    }
}

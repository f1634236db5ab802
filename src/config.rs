//! Run configuration.
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it changes. The defaults reproduce the WRN-28-2 CIFAR-10 run from the
//! Wide-ResNet paper:
//!
//! ```json
//! {
//!   "model": { "depth": 28, "widen_factor": 10 },
//!   "training": { "epochs": 200, "device": "cuda" }
//! }
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingConfig,
    pub augmentation: AugmentationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_classes: usize,
    /// Total depth `d`; must satisfy `(d - 4) % 6 == 0`.
    pub depth: usize,
    /// Widening factor `k`.
    pub widen_factor: usize,
    pub dropout_rate: f64,
    /// Coefficient of the L2 penalty added to the loss.
    pub weight_decay: f64,
    /// Running-statistics momentum in the torch convention (`1 - keras_momentum`).
    pub bn_momentum: f64,
    pub bn_eps: f64,
    /// Side length of the square input images; the classifier's dense layer
    /// is sized from the final `input_size / 4` feature map.
    pub input_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_classes: 10,
            depth: 28,
            widen_factor: 2,
            dropout_rate: 0.2,
            weight_decay: 5e-4,
            bn_momentum: 0.01,
            bn_eps: 1e-3,
            input_size: 32,
        }
    }
}

impl ModelConfig {
    /// Residual units in each of the three groups.
    pub fn blocks_per_group(&self) -> usize {
        self.depth.saturating_sub(4) / 6
    }

    /// Channel counts of the stem and of the three groups.
    pub fn widths(&self) -> [i64; 4] {
        let k = self.widen_factor as i64;
        [16, 16 * k, 32 * k, 64 * k]
    }

    pub fn name(&self) -> String {
        format!("WRN-{}-{}", self.depth, self.widen_factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth < 10 || (self.depth - 4) % 6 != 0 {
            return Err(Error::config(format!(
                "depth {} must be of the form 6n + 4 with n >= 1",
                self.depth
            )));
        }
        if self.widen_factor == 0 {
            return Err(Error::config("widen_factor must be at least 1"));
        }
        if self.n_classes < 2 {
            return Err(Error::config("n_classes must be at least 2"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::config("dropout_rate must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(Error::config("bn_momentum must be in [0, 1]"));
        }
        if self.bn_eps <= 0.0 {
            return Err(Error::config("bn_eps must be positive"));
        }
        if self.input_size == 0 || self.input_size % 4 != 0 {
            return Err(Error::config(format!(
                "input_size {} must be a positive multiple of 4",
                self.input_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    /// 1-based epochs at which the learning rate is multiplied by `decay_ratio`.
    pub milestones: Vec<usize>,
    pub decay_ratio: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            nesterov: true,
            milestones: vec![60, 120, 160],
            decay_ratio: 0.2,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lr <= 0.0 {
            return Err(Error::config("lr must be positive"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::config("momentum must be in [0, 1)"));
        }
        if self.nesterov && self.momentum == 0.0 {
            return Err(Error::config("nesterov requires a non-zero momentum"));
        }
        if self.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::config("milestones must be strictly increasing"));
        }
        if self.decay_ratio <= 0.0 || self.decay_ratio > 1.0 {
            return Err(Error::config("decay_ratio must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
    pub data_dir: String,
    pub log_dir: String,
    pub checkpoint_dir: String,
    /// Save a numbered checkpoint every this many epochs, 0 disables it.
    pub checkpoint_every: usize,
    /// Batches between two TensorBoard batch summaries.
    pub tensorboard_update_freq: usize,
    /// Epochs between two sets of weight histograms, 0 disables them.
    pub histogram_freq: usize,
    pub device: String,
    pub test_statistics: TestStatistics,
}

/// Which per-pixel statistics standardize the test split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatistics {
    /// Mean and std of the training split.
    #[default]
    Train,
    /// The test split's own mean and std.
    Own,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            epochs: 200,
            seed: 0,
            data_dir: "data".into(),
            log_dir: "logs/fit".into(),
            checkpoint_dir: "checkpoints".into(),
            checkpoint_every: 10,
            tensorboard_update_freq: 5,
            histogram_freq: 1,
            device: "auto".into(),
            test_statistics: TestStatistics::Train,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.epochs == 0 {
            return Err(Error::config("epochs must be positive"));
        }
        if self.tensorboard_update_freq == 0 {
            return Err(Error::config("tensorboard_update_freq must be positive"));
        }
        parse_device(&self.device)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub enabled: bool,
    /// Maximum rotation in degrees, either direction.
    pub rotation_range: f64,
    /// Maximum horizontal shift as a fraction of the image width.
    pub width_shift_range: f64,
    /// Maximum vertical shift as a fraction of the image height.
    pub height_shift_range: f64,
    pub horizontal_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_range: 10.0,
            width_shift_range: 5.0 / 32.0,
            height_shift_range: 5.0 / 32.0,
            horizontal_flip: false,
        }
    }
}

impl AugmentationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=180.0).contains(&self.rotation_range) {
            return Err(Error::config("rotation_range must be in [0, 180]"));
        }
        for (name, v) in [
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
        ] {
            if !(0.0..1.0).contains(&v) {
                return Err(Error::config(format!("{name} must be in [0, 1)")));
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.optimizer.validate()?;
        self.training.validate()?;
        self.augmentation.validate()
    }
}

/// Parses `auto`, `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(s: &str) -> Result<Device> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        other => other
            .strip_prefix("cuda:")
            .and_then(|idx| idx.parse::<usize>().ok())
            .map(Device::Cuda)
            .ok_or_else(|| Error::Device(s.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_wrn_28_2() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.model.name(), "WRN-28-2");
        assert_eq!(config.model.blocks_per_group(), 4);
        assert_eq!(config.model.widths(), [16, 32, 64, 128]);
        assert_eq!(config.optimizer.milestones, vec![60, 120, 160]);
        assert_eq!(config.training.batch_size, 100);
    }

    #[test]
    fn rejects_bad_depth() {
        let model = ModelConfig {
            depth: 27,
            ..Default::default()
        };
        assert!(matches!(model.validate(), Err(Error::Config(_))));

        let model = ModelConfig {
            depth: 4,
            ..Default::default()
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn rejects_unsorted_milestones() {
        let optimizer = OptimizerConfig {
            milestones: vec![60, 60, 160],
            ..Default::default()
        };
        assert!(optimizer.validate().is_err());
    }

    #[test]
    fn nesterov_needs_momentum() {
        let optimizer = OptimizerConfig {
            momentum: 0.0,
            ..Default::default()
        };
        assert!(optimizer.validate().is_err());

        let optimizer = OptimizerConfig {
            momentum: 0.0,
            nesterov: false,
            ..Default::default()
        };
        assert!(optimizer.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "model": { "widen_factor": 10 } }"#).unwrap();
        assert_eq!(config.model.widen_factor, 10);
        assert_eq!(config.model.depth, 28);
        assert_eq!(config.training.epochs, 200);
        assert!(config.augmentation.enabled);
    }

    #[test]
    fn shallow_depth_has_no_blocks() {
        let model = ModelConfig {
            depth: 2,
            ..Default::default()
        };
        assert_eq!(model.blocks_per_group(), 0);
        assert!(matches!(model.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn input_size_must_divide_by_four() {
        let model = ModelConfig {
            input_size: 30,
            ..Default::default()
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_statistics_parse_lowercase() {
        let config: Config =
            serde_json::from_str(r#"{ "training": { "test_statistics": "own" } }"#).unwrap();
        assert_eq!(config.training.test_statistics, TestStatistics::Own);
        assert_eq!(Config::default().training.test_statistics, TestStatistics::Train);
        assert!(serde_json::from_str::<Config>(r#"{ "training": { "test_statistics": "mine" } }"#).is_err());
    }

    #[test]
    fn devices() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("CUDA").unwrap(), Device::Cuda(0));
        assert_eq!(parse_device("cuda:3").unwrap(), Device::Cuda(3));
        assert!(matches!(parse_device("tpu"), Err(Error::Device(_))));
        assert!(parse_device("cuda:x").is_err());
    }
}

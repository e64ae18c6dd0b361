use crate::encoder::SampleCnnConfig;
use crate::error::{Result, TaggerError};
use crate::vocab::Task;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// AdamW hyper-parameters. With `weight_decay` 0 this is plain Adam.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn to_params(&self) -> candle_nn::ParamsAdamW {
        candle_nn::ParamsAdamW {
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    /// Run directory: checkpoints, metrics and the run log land here.
    pub ckpt_path: PathBuf,
    /// Save a head checkpoint every this many epochs.
    pub ckpt_every_n_epochs: usize,
    /// Skip `fit` and only run the test pass.
    pub test_only: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            batch_size: 32,
            ckpt_path: PathBuf::from("checkpoints"),
            ckpt_every_n_epochs: 200,
            test_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    pub train: Option<PathBuf>,
    pub val: Option<PathBuf>,
    pub test: Option<PathBuf>,
}

/// Finetuning run description, read from JSON.
///
/// ```json
/// {
///   "task": "mtat_top50",
///   "freeze_encoder": true,
///   "mlp_head": true,
///   "checkpoint": "pretrained/encoder.safetensors",
///   "trainer": { "max_epochs": 50, "ckpt_path": "runs/mtat" },
///   "data": { "train": "data/train.safetensors", "test": "data/test.safetensors" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FinetuneConfig {
    pub task: Task,
    pub freeze_encoder: bool,
    pub mlp_head: bool,
    /// Encoder warm start.
    pub checkpoint: Option<PathBuf>,
    /// Head warm start.
    pub checkpoint_head: Option<PathBuf>,
    pub encoder: SampleCnnConfig,
    pub optimizer: OptimizerConfig,
    pub trainer: TrainerConfig,
    pub data: DataConfig,
    /// Parameter initialisation seed.
    pub seed: u64,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            task: Task::MtatTop50,
            freeze_encoder: true,
            mlp_head: true,
            checkpoint: None,
            checkpoint_head: None,
            encoder: SampleCnnConfig::default(),
            optimizer: OptimizerConfig::default(),
            trainer: TrainerConfig::default(),
            data: DataConfig::default(),
            seed: 123,
        }
    }
}

impl FinetuneConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TaggerError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: FinetuneConfig =
            serde_json::from_str(json).map_err(|e| TaggerError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the resolved config as pretty JSON, creating the parent directory.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(TaggerError::Config(msg.to_string()));

        if self.trainer.batch_size == 0 {
            return fail("trainer.batch_size must be positive");
        }
        if self.trainer.ckpt_every_n_epochs == 0 {
            return fail("trainer.ckpt_every_n_epochs must be positive");
        }
        if self.optimizer.lr.is_nan() || self.optimizer.lr <= 0.0 {
            return fail("optimizer.lr must be positive");
        }
        if !(0.0..1.0).contains(&self.optimizer.beta1) || !(0.0..1.0).contains(&self.optimizer.beta2) {
            return fail("optimizer betas must lie in [0, 1)");
        }
        if self.encoder.block_channels.is_empty() || self.encoder.pool == 0 || self.encoder.stem_stride == 0 {
            return fail("encoder needs at least one block and non-zero stride and pool");
        }
        if self.trainer.test_only {
            if self.data.test.is_none() {
                return fail("test_only run needs data.test");
            }
        } else if self.data.train.is_none() {
            return fail("training run needs data.train");
        }
        Ok(())
    }
}

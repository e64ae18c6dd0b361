use crate::error::{Result, TaggerError};
use crate::head::EMBEDDING_DIM;
use crate::weights::{LoadReport, load_weights};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Linear, ModuleT, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Raw-waveform CNN layout.
///
/// The default is the 3^10 sample layout: a stride-3 stem followed by nine
/// pooled blocks reduces 59049 samples to a single frame.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SampleCnnConfig {
    pub stem_channels: usize,
    pub stem_stride: usize,
    pub block_channels: Vec<usize>,
    pub pool: usize,
    pub bn_eps: f64,
}

impl Default for SampleCnnConfig {
    fn default() -> Self {
        Self {
            stem_channels: 128,
            stem_stride: 3,
            block_channels: vec![128, 128, 256, 256, 256, 256, 256, 256, 512],
            pool: 3,
            bn_eps: 1e-5,
        }
    }
}

impl SampleCnnConfig {
    /// Shortest waveform that survives every pooling stage.
    pub fn min_samples(&self) -> usize {
        self.stem_stride * self.pool.pow(self.block_channels.len() as u32)
    }
}

/// Conv1d + BatchNorm + ReLU, optionally max-pooled along time
#[derive(Debug)]
struct ConvBlock {
    conv: Conv1d,
    bn: BatchNorm,
    pool: Option<usize>,
}

impl ConvBlock {
    fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        stride: usize,
        padding: usize,
        pool: Option<usize>,
        bn_eps: f64,
    ) -> candle_core::Result<Self> {
        let conv = candle_nn::conv1d(
            c1,
            c2,
            3,
            Conv1dConfig {
                stride,
                padding,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let bn = candle_nn::batch_norm(c2, bn_eps, vb.pp("bn"))?;
        Ok(Self { conv, bn, pool })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = xs.apply(&self.conv)?.apply_t(&self.bn, train)?.relu()?;
        match self.pool {
            // [b, c, t] -> [b, c, 1, t] so the 2d pool only runs along time
            Some(k) => xs
                .unsqueeze(2)?
                .max_pool2d_with_stride((1, k), (1, k))?
                .squeeze(2),
            None => Ok(xs),
        }
    }
}

/// Sample-level CNN producing one 512-wide embedding per waveform.
#[derive(Debug)]
pub struct SampleCnn {
    stem: ConvBlock,
    blocks: Vec<ConvBlock>,
    proj: Linear,
    min_samples: usize,
}

impl SampleCnn {
    pub fn load(vb: VarBuilder, config: &SampleCnnConfig) -> candle_core::Result<Self> {
        let stem = ConvBlock::load(
            vb.pp("stem"),
            1,
            config.stem_channels,
            config.stem_stride,
            0,
            None,
            config.bn_eps,
        )?;

        let mut blocks = Vec::with_capacity(config.block_channels.len());
        let mut c_in = config.stem_channels;
        for (i, &c_out) in config.block_channels.iter().enumerate() {
            blocks.push(ConvBlock::load(
                vb.pp(format!("blocks.{i}")),
                c_in,
                c_out,
                1,
                1,
                Some(config.pool),
                config.bn_eps,
            )?);
            c_in = c_out;
        }

        let proj = candle_nn::linear(c_in, EMBEDDING_DIM, vb.pp("proj"))?;

        Ok(Self {
            stem,
            blocks,
            proj,
            min_samples: config.min_samples(),
        })
    }
}

impl ModuleT for SampleCnn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        // accept [b, t] or [b, 1, t]
        let xs = match xs.rank() {
            2 => xs.unsqueeze(1)?,
            3 => xs.clone(),
            r => candle_core::bail!("SampleCnn expects [b, t] or [b, 1, t], got rank {r}"),
        };
        let samples = xs.dim(2)?;
        if samples < self.min_samples {
            candle_core::bail!(
                "SampleCnn needs at least {} samples per segment, got {}",
                self.min_samples,
                samples
            );
        }

        let mut xs = self.stem.forward_t(&xs, train)?;
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }

        // global mean over whatever time steps remain
        xs.mean(2)?.apply(&self.proj)
    }
}

/// The pretrained encoder plus its freezing policy.
///
/// A frozen encoder always runs in inference mode, so batch-norm running
/// statistics never move, and its output is detached from the graph so no
/// gradient reaches its variables. Both hold even while the rest of the
/// predictor trains.
pub struct EncoderAdapter {
    encoder: Box<dyn ModuleT + Send + Sync>,
    varmap: VarMap,
    frozen: bool,
}

impl EncoderAdapter {
    /// Wrap an encoder whose variables live in `varmap`.
    pub fn new(encoder: Box<dyn ModuleT + Send + Sync>, varmap: VarMap, frozen: bool) -> Self {
        Self {
            encoder,
            varmap,
            frozen,
        }
    }

    /// Build a `SampleCnn` under the `encoder.` prefix.
    pub fn sample_cnn(config: &SampleCnnConfig, frozen: bool, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = SampleCnn::load(vb.pp("encoder"), config)?;
        Ok(Self::new(Box::new(encoder), varmap, frozen))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Warm-start from a pretraining checkpoint (non-strict).
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        load_weights(&self.varmap, path)
    }

    /// Variables the optimizer may update; empty when frozen.
    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.frozen {
            Vec::new()
        } else {
            self.varmap.all_vars()
        }
    }

    /// Encode a batch of segments to `[b, 512]` embeddings.
    pub fn encode(&self, audio: &Tensor, train: bool) -> Result<Tensor> {
        let encoded = self.encoder.forward_t(audio, train && !self.frozen)?;
        let encoded = if self.frozen { encoded.detach() } else { encoded };

        let (batch, width) = encoded.dims2()?;
        if width != EMBEDDING_DIM {
            return Err(TaggerError::Shape(format!(
                "encoder produced {width}-wide embeddings for {batch} segments, expected {EMBEDDING_DIM}"
            )));
        }
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> SampleCnnConfig {
        SampleCnnConfig {
            stem_channels: 4,
            stem_stride: 3,
            block_channels: vec![4, 8],
            pool: 3,
            bn_eps: 1e-5,
        }
    }

    fn ramp(batch: usize, samples: usize) -> Tensor {
        let data: Vec<f32> = (0..batch * samples).map(|i| ((i % 17) as f32 - 8.0) / 8.0).collect();
        Tensor::from_vec(data, (batch, samples), &Device::Cpu).unwrap()
    }

    fn running_mean(adapter: &EncoderAdapter) -> Vec<f32> {
        let data = adapter.varmap().data().lock().unwrap();
        data["encoder.stem.bn.running_mean"].to_vec1().unwrap()
    }

    #[test]
    fn test_min_samples() {
        assert_eq!(SampleCnnConfig::default().min_samples(), 59049);
        assert_eq!(tiny_config().min_samples(), 27);
    }

    #[test]
    fn test_encode_shape() {
        let adapter = EncoderAdapter::sample_cnn(&tiny_config(), true, &Device::Cpu).unwrap();
        let encoded = adapter.encode(&ramp(3, 81), false).unwrap();
        assert_eq!(encoded.dims(), &[3, EMBEDDING_DIM]);
    }

    #[test]
    fn test_too_short_segment_is_rejected() {
        let adapter = EncoderAdapter::sample_cnn(&tiny_config(), true, &Device::Cpu).unwrap();
        assert!(adapter.encode(&ramp(1, 20), false).is_err());
    }

    #[test]
    fn test_frozen_encoder_keeps_running_stats_in_train_mode() {
        let adapter = EncoderAdapter::sample_cnn(&tiny_config(), true, &Device::Cpu).unwrap();
        let before = running_mean(&adapter);
        adapter.encode(&ramp(4, 81), true).unwrap();
        assert_eq!(running_mean(&adapter), before);
        assert!(adapter.trainable_vars().is_empty());
    }

    #[test]
    fn test_unfrozen_encoder_updates_running_stats() {
        let adapter = EncoderAdapter::sample_cnn(&tiny_config(), false, &Device::Cpu).unwrap();
        let before = running_mean(&adapter);
        adapter.encode(&ramp(4, 81), true).unwrap();
        assert_ne!(running_mean(&adapter), before);
        assert!(!adapter.trainable_vars().is_empty());
    }
}

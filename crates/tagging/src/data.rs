// Pre-segmented waveform datasets stored as safetensors files.

use crate::error::{Result, TaggerError};
use crate::predictor::{LabeledBatch, TestBatch};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// Memory-map a safetensors file and pull out its `audio` and `labels` tensors.
fn open_audio_labels(path: &Path, device: &Device) -> Result<(Tensor, Tensor)> {
    let file = std::fs::File::open(path)
        .map_err(|e| TaggerError::Io(format!("cannot open dataset {}: {e}", path.display())))?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|e| TaggerError::Io(format!("failed to memory-map {}: {e}", path.display())))?;

    let mut tensors: HashMap<String, Tensor> = candle_core::safetensors::load_buffer(&mmap, device)?;
    let mut take = |key: &str| {
        tensors.remove(key).ok_or_else(|| {
            TaggerError::Shape(format!("dataset {} has no '{key}' tensor", path.display()))
        })
    };
    let audio = take("audio")?.to_dtype(DType::F32)?;
    let labels = take("labels")?.to_dtype(DType::F32)?;
    Ok((audio, labels))
}

/// Segment-level examples for training and validation.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    /// `[k, t]`
    audio: Tensor,
    /// `[k, n]`
    labels: Tensor,
}

impl LabeledDataset {
    /// `audio [k, t]` with `labels [k, 1, n]` or `[k, n]`.
    pub fn new(audio: Tensor, labels: Tensor, n_classes: usize) -> Result<Self> {
        let (examples, _) = audio.dims2()?;
        let labels = match labels.dims() {
            [k, 1, n] if *k == examples && *n == n_classes => labels.squeeze(1)?,
            [k, n] if *k == examples && *n == n_classes => labels,
            dims => {
                return Err(TaggerError::Shape(format!(
                    "{examples} examples need labels [{examples}, 1, {n_classes}] or [{examples}, {n_classes}], got {dims:?}"
                )));
            }
        };
        Ok(Self { audio, labels })
    }

    pub fn open(path: impl AsRef<Path>, n_classes: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let (audio, labels) = open_audio_labels(path, device)?;
        let dataset = Self::new(audio, labels, n_classes)?;
        log::info!("{}: {} examples", path.display(), dataset.len());
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.audio.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive batches of at most `batch_size` examples; labels come out as `[b, 1, n]`.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Result<LabeledBatch>> + '_ {
        let batch_size = batch_size.max(1);
        (0..self.len()).step_by(batch_size).map(move |start| {
            let len = batch_size.min(self.len() - start);
            Ok(LabeledBatch {
                audio: self.audio.narrow(0, start, len)?,
                labels: self.labels.narrow(0, start, len)?.unsqueeze(1)?,
            })
        })
    }
}

/// Whole clips for testing, each split into the same number of segments.
#[derive(Debug, Clone)]
pub struct ClipDataset {
    /// `[c, s, t]`
    audio: Tensor,
    /// `[c, s, n]`
    labels: Tensor,
}

impl ClipDataset {
    pub fn new(audio: Tensor, labels: Tensor, n_classes: usize) -> Result<Self> {
        let (clips, segments, _) = audio.dims3()?;
        if labels.dims() != [clips, segments, n_classes] {
            return Err(TaggerError::Shape(format!(
                "{clips} clips of {segments} segments need labels [{clips}, {segments}, {n_classes}], got {:?}",
                labels.dims()
            )));
        }
        Ok(Self { audio, labels })
    }

    pub fn open(path: impl AsRef<Path>, n_classes: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let (audio, labels) = open_audio_labels(path, device)?;
        let dataset = Self::new(audio, labels, n_classes)?;
        log::info!("{}: {} clips", path.display(), dataset.len());
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.audio.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> &Device {
        self.audio.device()
    }

    /// One `TestBatch` per clip: `audio [1, s, t]`, `labels [1, s, n]`.
    pub fn clips(&self) -> impl Iterator<Item = Result<TestBatch>> + '_ {
        (0..self.len()).map(move |clip| {
            Ok(TestBatch {
                audio: self.audio.narrow(0, clip, 1)?,
                labels: self.labels.narrow(0, clip, 1)?,
            })
        })
    }
}

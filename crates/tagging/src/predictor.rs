use crate::encoder::EncoderAdapter;
use crate::error::{Result, TaggerError};
use crate::head::Head;
use candle_core::{Module, Tensor, Var};

/// Training/validation batch: `audio [b, t]`, `labels [b, 1, n]` or `[b, n]`.
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    pub audio: Tensor,
    pub labels: Tensor,
}

/// One clip at test time: `audio [1, s, t]`, `labels [1, s, n]`.
///
/// The `s` segments all belong to the same clip and carry the clip's label.
#[derive(Debug, Clone)]
pub struct TestBatch {
    pub audio: Tensor,
    pub labels: Tensor,
}

impl TestBatch {
    /// Present the segments as an ordinary batch: `audio [s, t]`, `labels [s, n]`.
    pub fn into_segments(self) -> Result<LabeledBatch> {
        let audio = squeeze_clip_axis(self.audio, "audio")?;
        let labels = squeeze_clip_axis(self.labels, "labels")?;
        if audio.dim(0)? != labels.dim(0)? {
            return Err(TaggerError::Shape(format!(
                "clip has {} audio segments but {} label rows",
                audio.dim(0)?,
                labels.dim(0)?
            )));
        }
        Ok(LabeledBatch { audio, labels })
    }
}

fn squeeze_clip_axis(tensor: Tensor, what: &str) -> Result<Tensor> {
    match tensor.dims() {
        [1, _, _] => Ok(tensor.squeeze(0)?),
        dims => Err(TaggerError::Shape(format!(
            "test {what} must be [1, segments, _], got {dims:?}"
        ))),
    }
}

/// What the caller hands to `TagPredictor::forward`.
#[derive(Debug, Clone)]
pub enum PredictorInput {
    /// Inference only; labels are synthesised as a placeholder.
    RawWaveform(Tensor),
    LabeledBatch(LabeledBatch),
}

/// Labels travelling with a forward pass.
#[derive(Debug, Clone)]
pub enum Labels {
    Observed(Tensor),
    /// Zeros `[b, n]` standing in for missing ground truth.
    Placeholder(Tensor),
}

impl Labels {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Labels::Observed(t) | Labels::Placeholder(t) => t,
        }
    }

    /// Ground truth usable for metrics. Placeholders are refused.
    pub fn observed(&self) -> Result<&Tensor> {
        match self {
            Labels::Observed(t) => Ok(t),
            Labels::Placeholder(_) => Err(TaggerError::IllegalState(
                "placeholder labels cannot be used for metrics".to_string(),
            )),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Labels::Placeholder(_))
    }
}

#[derive(Debug, Clone)]
pub struct PredictorOutput {
    /// Logits `[b, n]`.
    pub projected: Tensor,
    pub labels: Labels,
    /// Embeddings `[b, 512]`.
    pub encoded: Tensor,
}

/// Encoder followed by head: `logits = head(encoder(audio))`.
pub struct TagPredictor {
    encoder: EncoderAdapter,
    head: Head,
}

impl TagPredictor {
    pub fn new(encoder: EncoderAdapter, head: Head) -> Self {
        Self { encoder, head }
    }

    pub fn encoder(&self) -> &EncoderAdapter {
        &self.encoder
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn n_classes(&self) -> usize {
        self.head.n_classes()
    }

    /// Head variables plus encoder variables unless the encoder is frozen.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.head.varmap().all_vars();
        vars.extend(self.encoder.trainable_vars());
        vars
    }

    pub fn forward(&self, input: &PredictorInput, train: bool) -> Result<PredictorOutput> {
        let (audio, labels) = match input {
            PredictorInput::RawWaveform(audio) => {
                let placeholder = Tensor::zeros(
                    (audio.dim(0)?, self.n_classes()),
                    candle_core::DType::F32,
                    audio.device(),
                )?;
                (audio, Labels::Placeholder(placeholder))
            }
            PredictorInput::LabeledBatch(batch) => {
                (&batch.audio, Labels::Observed(self.squeeze_labels(&batch.labels)?))
            }
        };

        let encoded = self.encoder.encode(audio, train)?;
        let projected = self.head.forward(&encoded)?;

        Ok(PredictorOutput {
            projected,
            labels,
            encoded,
        })
    }

    /// `[b, 1, n]` -> `[b, n]`; `[b, n]` passes through.
    fn squeeze_labels(&self, labels: &Tensor) -> Result<Tensor> {
        let n = self.n_classes();
        let labels = match labels.dims() {
            [_, 1, width] if *width == n => labels.squeeze(1)?,
            [_, width] if *width == n => labels.clone(),
            dims => {
                return Err(TaggerError::Shape(format!(
                    "labels must be [b, 1, {n}] or [b, {n}], got {dims:?}"
                )));
            }
        };
        Ok(labels.to_dtype(candle_core::DType::F32)?)
    }
}

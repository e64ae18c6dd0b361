//! Clip-level aggregation of segment predictions over one evaluation pass.
//!
//! A test batch holds every segment of one clip. Segment logits are averaged
//! in logit space (before the sigmoid) and the clip takes segment 0's label;
//! all segments of a clip are assumed to share ground truth. One aggregate
//! per clip is accumulated until `end_pass`, which hands back the whole pass
//! so metrics are computed once over all clips rather than per batch.
//!
//! The aggregator has a single writer: every mutating call takes `&mut self`.
//! Sharing one between threads needs an external lock.

use crate::error::{Result, TaggerError};
use crate::predictor::{PredictorInput, TagPredictor, TestBatch};
use candle_core::{DType, Device, Tensor};

/// One clip reduced to a single prediction.
#[derive(Debug, Clone)]
pub struct ClipAggregate {
    /// Mean segment logits `[n]`.
    pub logit: Tensor,
    /// Segment 0's label `[n]`.
    pub label: Tensor,
}

/// Everything observed between `start_pass` and `end_pass`.
#[derive(Debug, Clone)]
pub struct PassOutputs {
    /// Clip logits `[m, n]`.
    pub preds: Tensor,
    /// Clip labels `[m, n]`.
    pub labels: Tensor,
}

impl PassOutputs {
    pub fn clips(&self) -> usize {
        self.preds.dims().first().copied().unwrap_or(0)
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Collecting { preds: Vec<Tensor>, labels: Vec<Tensor> },
}

#[derive(Debug)]
pub struct ClipAggregator {
    n_classes: usize,
    device: Device,
    state: State,
}

/// Reduce `[t, n]` segment logits and labels to one clip.
pub fn reduce_clip(logits: &Tensor, labels: &Tensor) -> Result<ClipAggregate> {
    let (segments, width) = logits.dims2()?;
    if segments == 0 {
        return Err(TaggerError::Shape("clip has no segments".to_string()));
    }
    if labels.dims2()? != (segments, width) {
        return Err(TaggerError::Shape(format!(
            "segment logits {:?} and labels {:?} differ",
            logits.dims(),
            labels.dims()
        )));
    }
    Ok(ClipAggregate {
        logit: logits.mean(0)?,
        label: labels.get(0)?,
    })
}

impl ClipAggregator {
    pub fn new(n_classes: usize, device: Device) -> Self {
        Self {
            n_classes,
            device,
            state: State::Idle,
        }
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, State::Collecting { .. })
    }

    /// Clips observed so far in the open pass.
    pub fn len(&self) -> usize {
        match &self.state {
            State::Idle => 0,
            State::Collecting { preds, .. } => preds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a fresh pass. An unfinished pass is discarded, never merged.
    pub fn start_pass(&mut self) {
        if let State::Collecting { preds, .. } = &self.state {
            log::warn!("starting a new pass over an unfinished one; dropping {} clips", preds.len());
        }
        self.state = State::Collecting {
            preds: Vec::new(),
            labels: Vec::new(),
        };
    }

    /// Run every segment of one clip through `predictor` and accumulate the clip.
    pub fn observe(&mut self, predictor: &TagPredictor, batch: TestBatch) -> Result<ClipAggregate> {
        self.ensure_collecting("observe")?;
        let segments = batch.into_segments()?;
        let output = predictor.forward(&PredictorInput::LabeledBatch(segments), false)?;
        let labels = output.labels.observed()?;
        self.observe_segments(&output.projected, labels)
    }

    /// Accumulate one clip from `[t, n]` segment logits and labels.
    pub fn observe_segments(&mut self, logits: &Tensor, labels: &Tensor) -> Result<ClipAggregate> {
        self.ensure_collecting("observe")?;
        let (_, width) = logits.dims2()?;
        if width != self.n_classes {
            return Err(TaggerError::Shape(format!(
                "segment logits have {width} tags, expected {}",
                self.n_classes
            )));
        }

        let clip = reduce_clip(logits, labels)?;
        // detached copies: the pass outlives any graph that produced them.
        // Both rows are built before either list grows.
        let pred = clip.logit.detach().unsqueeze(0)?;
        let label = clip.label.detach().to_dtype(DType::F32)?.unsqueeze(0)?;
        if let State::Collecting { preds, labels: truth } = &mut self.state {
            preds.push(pred);
            truth.push(label);
        }
        Ok(clip)
    }

    /// Close the pass and drain it as `[m, n]` tensors.
    pub fn end_pass(&mut self) -> Result<PassOutputs> {
        let State::Collecting { preds, labels } = std::mem::replace(&mut self.state, State::Idle) else {
            return Err(TaggerError::IllegalState("end_pass called with no open pass".to_string()));
        };

        if preds.is_empty() {
            log::warn!("pass closed without observing any clip");
            let empty = Tensor::zeros((0, self.n_classes), DType::F32, &self.device)?;
            return Ok(PassOutputs {
                preds: empty.clone(),
                labels: empty,
            });
        }

        Ok(PassOutputs {
            preds: Tensor::cat(&preds, 0)?,
            labels: Tensor::cat(&labels, 0)?,
        })
    }

    /// Abort the open pass without draining it.
    pub fn discard(&mut self) {
        if let State::Collecting { preds, .. } = &self.state {
            log::info!("discarding pass with {} clips", preds.len());
        }
        self.state = State::Idle;
    }

    fn ensure_collecting(&self, operation: &str) -> Result<()> {
        if self.is_collecting() {
            Ok(())
        } else {
            Err(TaggerError::IllegalState(format!("{operation} called before start_pass")))
        }
    }
}

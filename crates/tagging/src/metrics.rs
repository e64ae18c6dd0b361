//! Multi-label loss and ranking metrics.
//!
//! Every tag is an independent binary task. AUROC and average precision are
//! computed per tag and macro-averaged, so rare tags weigh as much as common
//! ones. A tag whose ground truth is all-negative (or all-positive) in the
//! evaluated set has no defined ranking score and is left out of the average.

use crate::error::{Result, TaggerError};
use candle_core::Tensor;
use std::cmp::Ordering;

/// Default decision threshold on probabilities for confusion counting.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Loss and ranking metrics for one evaluated set.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Scalar loss, still attached to the graph.
    pub loss: Tensor,
    pub auroc: f32,
    pub average_precision: f32,
}

impl Evaluation {
    pub fn loss_value(&self) -> Result<f32> {
        Ok(self.loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
    }
}

/// Mean binary cross-entropy on logits.
///
/// Uses `max(x, 0) - x*y + log(1 + exp(-|x|))`, which never takes the log of
/// a saturated sigmoid.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(TaggerError::Shape(format!(
            "logits {:?} and targets {:?} differ",
            logits.dims(),
            targets.dims()
        )));
    }
    let targets = targets.to_dtype(logits.dtype())?;
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - (logits * &targets)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// Tie-aware AUROC of one binary task (Mann-Whitney U / (P * N)).
///
/// Returns `None` when the targets hold only one class.
pub fn binary_auroc(scores: &[f32], targets: &[bool]) -> Option<f32> {
    let positives = targets.iter().filter(|&&t| t).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // 1-based ranks, tied scores share their average rank
    let mut positive_rank_sum = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]].total_cmp(&scores[order[start]]) == Ordering::Equal {
            end += 1;
        }
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| targets[i]).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some(((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n)) as f32)
}

/// Average precision of one binary task: `sum_k (R_k - R_{k-1}) * P_k` over
/// distinct score thresholds, highest first.
///
/// Returns `None` when there are no positives.
pub fn binary_average_precision(scores: &[f32], targets: &[bool]) -> Option<f32> {
    let positives = targets.iter().filter(|&&t| t).count();
    if positives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut ap = 0.0f64;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut previous_recall = 0.0f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]].total_cmp(&scores[order[start]]) == Ordering::Equal {
            end += 1;
        }
        for &i in &order[start..end] {
            if targets[i] {
                tp += 1;
            } else {
                fp += 1;
            }
        }
        let precision = tp as f64 / (tp + fp) as f64;
        let recall = tp as f64 / positives as f64;
        ap += (recall - previous_recall) * precision;
        previous_recall = recall;
        start = end;
    }

    Some(ap as f32)
}

/// Arithmetic mean of the defined per-tag values; `0.0` when none are defined.
fn macro_average(values: &[Option<f32>], metric: &str) -> f32 {
    let defined: Vec<f32> = values.iter().flatten().copied().collect();
    let skipped = values.len() - defined.len();
    if skipped > 0 {
        log::debug!("{metric}: {skipped} of {} tags have a single class and are skipped", values.len());
    }
    if defined.is_empty() {
        log::warn!("{metric}: no tag has both positive and negative examples, reporting 0");
        return 0.0;
    }
    defined.iter().sum::<f32>() / defined.len() as f32
}

/// N x N co-occurrence counts between ground-truth and predicted tags.
///
/// Row `i` is a target tag, column `j` a predicted tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionCounts {
    n: usize,
    counts: Vec<u64>,
}

impl ConfusionCounts {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            counts: vec![0; n * n],
        }
    }

    pub fn from_rows(rows: Vec<Vec<u64>>) -> Result<Self> {
        let n = rows.len();
        if rows.iter().any(|row| row.len() != n) {
            return Err(TaggerError::Shape("confusion counts must be square".to_string()));
        }
        Ok(Self {
            n,
            counts: rows.into_iter().flatten().collect(),
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn get(&self, target: usize, predicted: usize) -> u64 {
        self.counts[target * self.n + predicted]
    }

    pub fn row(&self, target: usize) -> &[u64] {
        &self.counts[target * self.n..(target + 1) * self.n]
    }

    fn add(&mut self, target: usize, predicted: usize) {
        self.counts[target * self.n + predicted] += 1;
    }
}

/// For every example, every true tag `i` and every predicted tag `j`
/// (`probability > threshold`) add one to cell `(i, j)`.
pub fn multilabel_confusion(
    probabilities: &Tensor,
    labels: &Tensor,
    n_classes: usize,
    threshold: f32,
) -> Result<ConfusionCounts> {
    let probabilities = to_rows(probabilities, n_classes, "probabilities")?;
    let labels = to_rows(labels, n_classes, "labels")?;
    if probabilities.len() != labels.len() {
        return Err(TaggerError::Shape(format!(
            "{} prediction rows but {} label rows",
            probabilities.len(),
            labels.len()
        )));
    }

    let mut counts = ConfusionCounts::zeros(n_classes);
    for (probs, truth) in probabilities.iter().zip(&labels) {
        let predicted: Vec<usize> = (0..n_classes).filter(|&j| probs[j] > threshold).collect();
        for i in (0..n_classes).filter(|&i| truth[i] > 0.5) {
            for &j in &predicted {
                counts.add(i, j);
            }
        }
    }
    Ok(counts)
}

fn to_rows(tensor: &Tensor, n_classes: usize, what: &str) -> Result<Vec<Vec<f32>>> {
    let (_, width) = tensor.dims2()?;
    if width != n_classes {
        return Err(TaggerError::Shape(format!(
            "{what} have {width} columns, expected {n_classes}"
        )));
    }
    Ok(tensor.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
}

/// Computes loss, macro AUROC, macro AP and confusion counts for `[m, n]` logits.
#[derive(Debug, Clone)]
pub struct MetricEngine {
    n_classes: usize,
    threshold: f32,
}

impl MetricEngine {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn evaluate(&self, logits: &Tensor, labels: &Tensor) -> Result<Evaluation> {
        let loss = bce_with_logits(logits, labels)?;

        let probabilities = candle_nn::ops::sigmoid(&logits.detach())?;
        let probs = to_rows(&probabilities, self.n_classes, "probabilities")?;
        let truth = to_rows(labels, self.n_classes, "labels")?;

        let mut aurocs = Vec::with_capacity(self.n_classes);
        let mut aps = Vec::with_capacity(self.n_classes);
        for tag in 0..self.n_classes {
            let scores: Vec<f32> = probs.iter().map(|row| row[tag]).collect();
            let targets: Vec<bool> = truth.iter().map(|row| row[tag] > 0.5).collect();
            aurocs.push(binary_auroc(&scores, &targets));
            aps.push(binary_average_precision(&scores, &targets));
        }

        Ok(Evaluation {
            loss,
            auroc: macro_average(&aurocs, "auroc"),
            average_precision: macro_average(&aps, "average_precision"),
        })
    }

    /// Confusion counts of `sigmoid(logits)` against `labels`.
    pub fn confusion(&self, logits: &Tensor, labels: &Tensor) -> Result<ConfusionCounts> {
        let probabilities = candle_nn::ops::sigmoid(&logits.detach())?;
        multilabel_confusion(&probabilities, labels, self.n_classes, self.threshold)
    }
}

//! Finetuning loop: training and validation epochs, head checkpoints, and the
//! clip-level test pass.

use crate::aggregate::ClipAggregator;
use crate::config::{FinetuneConfig, TrainerConfig};
use crate::data::{ClipDataset, LabeledDataset};
use crate::encoder::EncoderAdapter;
use crate::error::{Result, TaggerError};
use crate::head::{Head, HeadKind};
use crate::metrics::{Evaluation, MetricEngine};
use crate::predictor::{LabeledBatch, PredictorInput, TagPredictor};
use crate::report::{ConfusionReport, TABLE_COLUMNS};
use crate::sink::MetricSink;
use crate::vocab::TagVocabulary;
use crate::weights::seed_parameters;
use base::CancelToken;
use candle_core::Device;
use candle_nn::{AdamW, Optimizer};
use std::path::Path;

pub const BEST_CHECKPOINT: &str = "best-val.safetensors";

pub fn periodic_checkpoint_name(step: usize) -> String {
    format!("checkpoint-step{step}.safetensors")
}

/// Build the encoder and head described by `config` and apply any warm starts.
///
/// Fresh parameters come from `config.seed`, so two calls with the same
/// config produce the same predictor. Warm starts overwrite them afterwards.
pub fn build_predictor(config: &FinetuneConfig, device: &Device) -> Result<TagPredictor> {
    match device.set_seed(config.seed) {
        Ok(()) => log::debug!("seeded {:?} rng with {}", device, config.seed),
        Err(_) => log::info!(
            "{:?} rng cannot be seeded, seed {} only covers parameter initialisation",
            device,
            config.seed
        ),
    }

    let encoder = EncoderAdapter::sample_cnn(&config.encoder, config.freeze_encoder, device)?;
    seed_parameters(encoder.varmap(), config.seed)?;
    if let Some(path) = &config.checkpoint {
        let report = encoder.load(path)?;
        if report.loaded.is_empty() {
            log::warn!("encoder checkpoint {} matched no parameter", path.display());
        }
    }

    let head = Head::new(HeadKind::from_mlp_flag(config.mlp_head), config.task.n_classes(), device)?;
    seed_parameters(head.varmap(), config.seed.wrapping_add(1))?;
    if let Some(path) = &config.checkpoint_head {
        let report = head.load(path)?;
        if !report.is_complete() {
            log::warn!("head checkpoint {} only partially matched", path.display());
        }
    }

    log::info!(
        "predictor: {:?} head, {} tags, encoder {}",
        head.kind(),
        head.n_classes(),
        if config.freeze_encoder { "frozen" } else { "trainable" }
    );
    Ok(TagPredictor::new(encoder, head))
}

/// Batch-averaged loss and ranking metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanMetrics {
    pub loss: f32,
    pub auroc: f32,
    pub average_precision: f32,
}

#[derive(Debug, Default)]
struct RunningMean {
    loss: f64,
    auroc: f64,
    average_precision: f64,
    batches: usize,
}

impl RunningMean {
    fn push(&mut self, loss: f32, evaluation: &Evaluation) {
        self.loss += loss as f64;
        self.auroc += evaluation.auroc as f64;
        self.average_precision += evaluation.average_precision as f64;
        self.batches += 1;
    }

    fn mean(&self) -> Option<MeanMetrics> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some(MeanMetrics {
            loss: (self.loss / n) as f32,
            auroc: (self.auroc / n) as f32,
            average_precision: (self.average_precision / n) as f32,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train: Option<MeanMetrics>,
    pub val: Option<MeanMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub steps: usize,
    pub best_val_loss: Option<f32>,
    pub history: Vec<EpochStats>,
}

#[derive(Debug, Clone)]
pub struct TestSummary {
    pub clips: usize,
    pub loss: f32,
    pub auroc: f32,
    pub average_precision: f32,
    pub confusion: ConfusionReport,
}

pub struct Trainer<S: MetricSink> {
    predictor: TagPredictor,
    optimizer: AdamW,
    engine: MetricEngine,
    vocabulary: TagVocabulary,
    config: TrainerConfig,
    sink: S,
    stop: CancelToken,
    global_step: usize,
    best_val_loss: Option<f32>,
}

impl<S: MetricSink> Trainer<S> {
    pub fn new(predictor: TagPredictor, config: &FinetuneConfig, sink: S) -> Result<Self> {
        let vocabulary = config.task.vocabulary();
        if vocabulary.len() != predictor.n_classes() {
            return Err(TaggerError::Config(format!(
                "task has {} tags but the head predicts {}",
                vocabulary.len(),
                predictor.n_classes()
            )));
        }

        let vars = predictor.trainable_vars();
        log::debug!("optimising {} variables", vars.len());
        let optimizer = AdamW::new(vars, config.optimizer.to_params())?;

        Ok(Self {
            engine: MetricEngine::new(predictor.n_classes()),
            predictor,
            optimizer,
            vocabulary,
            config: config.trainer.clone(),
            sink,
            stop: CancelToken::new(),
            global_step: 0,
            best_val_loss: None,
        })
    }

    /// Use an externally owned stop flag.
    pub fn with_stop_token(mut self, stop: CancelToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_token(&self) -> CancelToken {
        self.stop.clone()
    }

    pub fn predictor(&self) -> &TagPredictor {
        &self.predictor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn checkpoint_dir(&self) -> &Path {
        &self.config.ckpt_path
    }

    pub fn fit(&mut self, train: &LabeledDataset, val: Option<&LabeledDataset>) -> Result<FitSummary> {
        if train.is_empty() {
            log::warn!("training set is empty, no optimisation step will run");
        }
        log::info!(
            "fitting for {} epochs, {} training examples, batch size {}",
            self.config.max_epochs,
            train.len(),
            self.config.batch_size
        );

        let mut history = Vec::with_capacity(self.config.max_epochs);
        for epoch in 0..self.config.max_epochs {
            let train_means = self.train_epoch(train)?;
            if let Some(means) = train_means {
                for (name, value) in [
                    ("train_loss", means.loss),
                    ("train_auroc", means.auroc),
                    ("train_ap", means.average_precision),
                ] {
                    self.sink.log_scalar(name, value, self.global_step)?;
                    self.sink.log_scalar(&format!("{name}_epoch"), value, self.global_step)?;
                }
            }

            let val_means = match val {
                Some(val) => self.validate(val)?,
                None => None,
            };
            if let Some(means) = val_means {
                self.sink.log_scalar("val_loss", means.loss, self.global_step)?;
                self.sink.log_scalar("val_auroc", means.auroc, self.global_step)?;
                self.sink.log_scalar("val_ap", means.average_precision, self.global_step)?;
                if self.best_val_loss.is_none_or(|best| means.loss < best) {
                    self.best_val_loss = Some(means.loss);
                    let path = self.checkpoint_dir().join(BEST_CHECKPOINT);
                    self.predictor.head().save(&path)?;
                    log::info!("epoch {epoch}: val_loss improved to {:.4}, saved {}", means.loss, path.display());
                }
            }

            if (epoch + 1) % self.config.ckpt_every_n_epochs == 0 {
                let path = self.checkpoint_dir().join(periodic_checkpoint_name(self.global_step));
                self.predictor.head().save(&path)?;
                log::info!("epoch {epoch}: saved {}", path.display());
            }

            log::info!(
                "epoch {epoch}: train_loss {} val_loss {}",
                train_means.map_or("-".to_string(), |m| format!("{:.4}", m.loss)),
                val_means.map_or("-".to_string(), |m| format!("{:.4}", m.loss))
            );
            history.push(EpochStats {
                epoch,
                train: train_means,
                val: val_means,
            });
            self.sink.flush()?;
        }

        Ok(FitSummary {
            steps: self.global_step,
            best_val_loss: self.best_val_loss,
            history,
        })
    }

    fn train_epoch(&mut self, train: &LabeledDataset) -> Result<Option<MeanMetrics>> {
        let mut running = RunningMean::default();
        for batch in train.batches(self.config.batch_size) {
            self.check_stop("training")?;
            let (evaluation, loss) = self.train_step(batch?)?;
            self.sink.log_scalar("train_loss_step", loss, self.global_step)?;
            self.sink.log_scalar("train_auroc_step", evaluation.auroc, self.global_step)?;
            self.sink.log_scalar("train_ap_step", evaluation.average_precision, self.global_step)?;
            running.push(loss, &evaluation);
            self.global_step += 1;
        }
        Ok(running.mean())
    }

    fn train_step(&mut self, batch: LabeledBatch) -> Result<(Evaluation, f32)> {
        let output = self.predictor.forward(&PredictorInput::LabeledBatch(batch), true)?;
        let evaluation = self.engine.evaluate(&output.projected, output.labels.observed()?)?;
        self.optimizer.backward_step(&evaluation.loss)?;
        let loss = evaluation.loss_value()?;
        Ok((evaluation, loss))
    }

    fn validate(&mut self, val: &LabeledDataset) -> Result<Option<MeanMetrics>> {
        let mut running = RunningMean::default();
        for batch in val.batches(self.config.batch_size) {
            self.check_stop("validation")?;
            let output = self.predictor.forward(&PredictorInput::LabeledBatch(batch?), false)?;
            let evaluation = self.engine.evaluate(&output.projected.detach(), output.labels.observed()?)?;
            running.push(evaluation.loss_value()?, &evaluation);
        }
        Ok(running.mean())
    }

    /// One clip-level evaluation pass over `test`.
    ///
    /// Metrics are computed once over every clip. If the stop flag is raised
    /// mid-pass the partial pass is discarded and `Aborted` is returned.
    pub fn test(&mut self, test: &ClipDataset) -> Result<TestSummary> {
        self.test_with_progress(test, |_| {})
    }

    /// Like [`Trainer::test`], calling `on_clip` with the number of clips
    /// observed so far after each clip.
    pub fn test_with_progress(
        &mut self,
        test: &ClipDataset,
        on_clip: impl FnMut(usize),
    ) -> Result<TestSummary> {
        let mut aggregator = ClipAggregator::new(self.predictor.n_classes(), test.device().clone());
        aggregator.start_pass();
        if let Err(e) = self.observe_clips(&mut aggregator, test, on_clip) {
            aggregator.discard();
            return Err(e);
        }
        let outputs = aggregator.end_pass()?;
        if outputs.clips() == 0 {
            return Err(TaggerError::Config("test set has no clips".to_string()));
        }

        let evaluation = self.engine.evaluate(&outputs.preds, &outputs.labels)?;
        let loss = evaluation.loss_value()?;
        let counts = self.engine.confusion(&outputs.preds, &outputs.labels)?;
        let confusion = ConfusionReport::new(&counts, &self.vocabulary)?;

        self.sink.log_scalar("test_loss", loss, self.global_step)?;
        self.sink.log_scalar("test_auroc", evaluation.auroc, self.global_step)?;
        self.sink.log_scalar("test_ap", evaluation.average_precision, self.global_step)?;
        self.sink.log_image("confusion_matrix", &confusion.to_svg())?;
        self.sink.log_table("Confusion Matrix", &TABLE_COLUMNS, &confusion.table_data())?;
        self.sink.flush()?;

        log::info!(
            "test over {} clips: loss {:.4} auroc {:.4} ap {:.4}",
            outputs.clips(),
            loss,
            evaluation.auroc,
            evaluation.average_precision
        );
        Ok(TestSummary {
            clips: outputs.clips(),
            loss,
            auroc: evaluation.auroc,
            average_precision: evaluation.average_precision,
            confusion,
        })
    }

    fn observe_clips(
        &self,
        aggregator: &mut ClipAggregator,
        test: &ClipDataset,
        mut on_clip: impl FnMut(usize),
    ) -> Result<()> {
        for clip in test.clips() {
            self.check_stop("test")?;
            aggregator.observe(&self.predictor, clip?)?;
            on_clip(aggregator.len());
        }
        Ok(())
    }

    fn check_stop(&self, phase: &str) -> Result<()> {
        if self.stop.is_cancelled() {
            log::warn!("{phase} interrupted at step {}", self.global_step);
            return Err(TaggerError::Aborted(format!("{phase} interrupted")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut running = RunningMean::default();
        assert_eq!(running.mean(), None);

        let device = Device::Cpu;
        let evaluation = |auroc, average_precision| Evaluation {
            loss: candle_core::Tensor::new(0f32, &device).unwrap(),
            auroc,
            average_precision,
        };
        running.push(1.0, &evaluation(0.5, 1.0));
        running.push(0.5, &evaluation(1.0, 0.0));
        assert_eq!(
            running.mean(),
            Some(MeanMetrics {
                loss: 0.75,
                auroc: 0.75,
                average_precision: 0.5,
            })
        );
    }

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(periodic_checkpoint_name(400), "checkpoint-step400.safetensors");
        assert_eq!(BEST_CHECKPOINT, "best-val.safetensors");
    }
}

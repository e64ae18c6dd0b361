//! Finetuning and clip-level evaluation of a music auto-tagger.
//!
//! A pretrained raw-waveform encoder feeds a small projection head that emits
//! one logit per tag. Training runs on fixed-length segments; testing averages
//! segment logits per clip before scoring with macro AUROC and average
//! precision and a row-normalised confusion matrix.

pub mod aggregate;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod head;
pub mod metrics;
pub mod predictor;
pub mod report;
pub mod sink;
pub mod trainer;
pub mod vocab;
pub mod weights;

pub use aggregate::{ClipAggregate, ClipAggregator, PassOutputs};
pub use config::{DataConfig, FinetuneConfig, OptimizerConfig, TrainerConfig};
pub use data::{ClipDataset, LabeledDataset};
pub use encoder::{EncoderAdapter, SampleCnn, SampleCnnConfig};
pub use error::{Result, TaggerError};
pub use head::{EMBEDDING_DIM, Head, HeadKind};
pub use metrics::{ConfusionCounts, Evaluation, MetricEngine};
pub use predictor::{Labels, LabeledBatch, PredictorInput, PredictorOutput, TagPredictor, TestBatch};
pub use report::{ConfusionReport, ConfusionRow};
pub use sink::{JsonlSink, MemorySink, MetricSink};
pub use trainer::{FitSummary, TestSummary, Trainer, build_predictor};
pub use vocab::{TagVocabulary, Task};
pub use weights::{LoadReport, load_weights, save_weights, seed_parameters};

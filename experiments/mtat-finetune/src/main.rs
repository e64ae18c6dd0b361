use {
    anyhow::{Context, bail},
    base::CancelToken,
    candle_core::Device,
    std::path::PathBuf,
    tagging::{ClipDataset, FinetuneConfig, JsonlSink, LabeledDataset, Trainer, build_predictor},
};

fn run(config: FinetuneConfig, stop: CancelToken) -> anyhow::Result<()> {
    let device = Device::cuda_if_available(0)?;
    log::info!("running on {:?}", device);

    let n_classes = config.task.n_classes();
    let predictor = build_predictor(&config, &device)?;
    let sink = JsonlSink::new(&config.trainer.ckpt_path)?;
    let mut trainer = Trainer::new(predictor, &config, sink)?.with_stop_token(stop);

    if !config.trainer.test_only {
        let Some(train_path) = &config.data.train else {
            bail!("no training data configured");
        };
        let train = LabeledDataset::open(train_path, n_classes, &device)?;
        let val = match &config.data.val {
            Some(path) => Some(LabeledDataset::open(path, n_classes, &device)?),
            None => None,
        };
        let summary = trainer.fit(&train, val.as_ref())?;
        log::info!(
            "training finished after {} steps, best val_loss {:?}",
            summary.steps,
            summary.best_val_loss
        );
    }

    match &config.data.test {
        Some(path) => {
            let test = ClipDataset::open(path, n_classes, &device)?;
            let total = test.len();
            let summary = trainer.test_with_progress(&test, |clips| {
                if clips % 100 == 0 {
                    log::debug!("test pass: {clips}/{total} clips");
                }
            })?;
            println!(
                "test: {} clips, loss {:.4}, auroc {:.4}, ap {:.4}",
                summary.clips, summary.loss, summary.auroc, summary.average_precision
            );
        }
        None => log::info!("no test data configured, skipping test pass"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(config_path) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: mtat_finetune <config.json>");
        std::process::exit(2);
    };

    let config = FinetuneConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    base::init_run_logger(&config.trainer.ckpt_path).context("creating run directory")?;
    log::info!("config {}: {:?}", config_path.display(), config);
    config
        .save(config.trainer.ckpt_path.join("config.json"))
        .context("saving resolved config")?;

    let stop = CancelToken::new();
    let worker_stop = stop.clone();
    let worker = tokio::task::spawn_blocking(move || run(config, worker_stop));
    supervise(worker, stop, tokio::signal::ctrl_c()).await
}

/// Wait for `worker`, raising `stop` if `interrupt` fires first.
///
/// An interrupted run still waits for the worker and returns its error.
async fn supervise<I>(
    mut worker: tokio::task::JoinHandle<anyhow::Result<()>>,
    stop: CancelToken,
    interrupt: impl Future<Output = std::io::Result<I>>,
) -> anyhow::Result<()> {
    tokio::select! {
        result = &mut worker => return result?,
        _ = interrupt => {
            log::warn!("interrupted, stopping after the current batch");
            stop.cancel();
        }
    }

    // the worker notices the flag between batches
    worker.await?.context("run stopped")
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration, tagging::TaggerError};

    fn spawn_until_stopped(stop: CancelToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::task::spawn_blocking(move || {
            while !stop.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(TaggerError::Aborted("test interrupted".to_string()).into())
        })
    }

    #[tokio::test]
    async fn test_interrupted_run_is_an_error() {
        let stop = CancelToken::new();
        let worker = spawn_until_stopped(stop.clone());
        let result = supervise(worker, stop.clone(), async { std::io::Result::Ok(()) }).await;

        assert!(stop.is_cancelled());
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<TaggerError>(), Some(TaggerError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_finished_run_passes_through() {
        let stop = CancelToken::new();
        let worker = tokio::task::spawn_blocking(|| Ok(()));
        let result = supervise(worker, stop.clone(), std::future::pending::<std::io::Result<()>>()).await;
        assert!(result.is_ok());
        assert!(!stop.is_cancelled());
    }
}

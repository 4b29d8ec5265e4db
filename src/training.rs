//! Supervised training of the U-Net on paired image/mask samples.

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor, TensorData},
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, info, warn};

use crate::artifact::{Checkpoint, ModelArtifact};
use crate::dataset::{Dataset, DatasetLayout, Sample};
use crate::errors::{ProcareSegError, Result};
use crate::network::{Unet, UnetConfig};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before the log.
pub const EPSILON: f32 = 1e-7;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: UnetConfig,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping.
    #[config(default = 5)]
    pub patience: usize,
    #[config(default = 0.2)]
    pub validation_split: f64,
    #[config(default = 42)]
    pub seed: u64,
}

/// Mean per-pixel binary cross-entropy.
pub fn binary_cross_entropy<B: Backend, const D: usize>(
    probabilities: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let p = probabilities.clamp(EPSILON, 1.0 - EPSILON);
    let positive = targets.clone() * p.clone().log();
    let negative = targets.neg().add_scalar(1.0) * p.neg().add_scalar(1.0).log();
    (positive + negative).neg().mean()
}

/// Number of pixels where `p > 0.5` agrees with the label.
pub fn correct_pixels<B: Backend, const D: usize>(
    probabilities: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> f64 {
    probabilities
        .greater_elem(0.5)
        .equal(targets.greater_elem(0.5))
        .int()
        .sum()
        .into_scalar()
        .elem::<f64>()
}

/// Stacks the selected samples into `[n, 1, h, w]` image and mask tensors.
pub fn batch_tensors<B: Backend>(
    samples: &[Sample],
    indices: &[usize],
    device: &B::Device,
) -> Result<(Tensor<B, 4>, Tensor<B, 4>)> {
    let first = indices
        .first()
        .and_then(|&i| samples.get(i))
        .ok_or_else(|| ProcareSegError::validation("batch", "is empty"))?;
    let (height, width) = first.image.dim();
    let shape = [indices.len(), 1, height, width];

    let mut images = Vec::with_capacity(indices.len() * height * width);
    let mut masks = Vec::with_capacity(indices.len() * height * width);
    for &i in indices {
        let sample = &samples[i];
        if sample.image.dim() != (height, width) || sample.mask.dim() != (height, width) {
            return Err(ProcareSegError::validation(
                "sample",
                format!("{} does not match batch resolution {height}x{width}", sample.id),
            ));
        }
        images.extend(sample.image.iter().copied());
        masks.extend(sample.mask.iter().copied());
    }

    let tensor = |values: Vec<f32>| {
        Tensor::<B, 4>::from_data(TensorData::new(values, shape).convert::<B::FloatElem>(), device)
    };
    Ok((tensor(images), tensor(masks)))
}

/// Loss and accuracy of one pass over a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// Sample-weighted loss and pixel accuracy, without gradients.
pub fn evaluate<B: Backend>(
    model: &Unet<B>,
    dataset: &Dataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalMetrics> {
    if dataset.is_empty() {
        return Err(ProcareSegError::validation("dataset", "is empty"));
    }

    let order: Vec<usize> = (0..dataset.len()).collect();
    let mut accumulator = MetricAccumulator::default();
    for chunk in order.chunks(batch_size.max(1)) {
        let (images, masks) = batch_tensors::<B>(dataset.samples(), chunk, device)?;
        let probabilities = model.forward(images);
        let pixels = masks.shape().num_elements();
        let correct = correct_pixels(probabilities.clone(), masks.clone());
        let loss = binary_cross_entropy(probabilities, masks)
            .into_scalar()
            .elem::<f64>();
        accumulator.add(loss, chunk.len(), correct, pixels);
    }
    Ok(accumulator.finish())
}

#[derive(Debug, Default)]
struct MetricAccumulator {
    weighted_loss: f64,
    samples: usize,
    correct: f64,
    pixels: usize,
}

impl MetricAccumulator {
    fn add(&mut self, loss: f64, samples: usize, correct: f64, pixels: usize) {
        self.weighted_loss += loss * samples as f64;
        self.samples += samples;
        self.correct += correct;
        self.pixels += pixels;
    }

    fn finish(&self) -> EvalMetrics {
        EvalMetrics {
            loss: self.weighted_loss / self.samples.max(1) as f64,
            accuracy: self.correct / self.pixels.max(1) as f64,
        }
    }
}

/// Outcome of observing one epoch's validation loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    Improved,
    Waiting { epochs_without_improvement: usize },
    Stop,
}

/// Patience-based stopping on a monitored loss (lower is better).
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<(usize, f64)>,
    wait: usize,
}

impl EarlyStopping {
    pub const fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            wait: 0,
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.map(|(epoch, _)| epoch)
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best.map(|(_, loss)| loss)
    }

    /// A strictly lower loss is an improvement; NaN never is.
    pub fn observe(&mut self, epoch: usize, loss: f64) -> EpochVerdict {
        let improved = match self.best {
            None => !loss.is_nan(),
            Some((_, best)) => loss < best,
        };
        if improved {
            self.best = Some((epoch, loss));
            self.wait = 0;
            return EpochVerdict::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            EpochVerdict::Stop
        } else {
            EpochVerdict::Waiting {
                epochs_without_improvement: self.wait,
            }
        }
    }
}

/// Result of [`drive_epochs`].
#[derive(Debug, Clone)]
pub struct LoopOutcome<S> {
    /// Parameters to keep: the best ones when stopped early, the last ones otherwise.
    pub state: S,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
}

/// Runs up to `num_epochs` epochs (numbered from 1).
///
/// `run_epoch` consumes the current state and returns the updated state with
/// its validation loss. `on_improved` is called with every new best state.
/// When the stopper fires, the best state is restored.
pub fn drive_epochs<S, R, I>(
    num_epochs: usize,
    stopper: &mut EarlyStopping,
    initial: S,
    mut run_epoch: R,
    mut on_improved: I,
) -> Result<LoopOutcome<S>>
where
    S: Clone,
    R: FnMut(usize, S) -> Result<(S, f64)>,
    I: FnMut(usize, &S) -> Result<()>,
{
    let mut state = initial;
    let mut best: Option<S> = None;
    let mut epochs_run = 0;
    let mut stopped_early = false;

    for epoch in 1..=num_epochs {
        let (next, loss) = run_epoch(epoch, state)?;
        state = next;
        epochs_run = epoch;

        match stopper.observe(epoch, loss) {
            EpochVerdict::Improved => {
                on_improved(epoch, &state)?;
                best = Some(state.clone());
            }
            EpochVerdict::Waiting {
                epochs_without_improvement,
            } => debug!(epoch, epochs_without_improvement, "validation loss did not improve"),
            EpochVerdict::Stop => {
                stopped_early = true;
                break;
            }
        }
    }

    if stopped_early {
        if let Some(best) = best {
            info!(
                best_epoch = stopper.best_epoch(),
                "early stopping, restoring best parameters"
            );
            state = best;
        }
    }

    Ok(LoopOutcome {
        state,
        epochs_run,
        stopped_early,
        best_epoch: stopper.best_epoch(),
        best_loss: stopper.best_loss(),
    })
}

/// Per-epoch training and validation metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: EvalMetrics,
    pub validation: EvalMetrics,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub history: Vec<EpochMetrics>,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_epoch: Option<usize>,
    pub best_validation_loss: Option<f64>,
    /// Validation metrics of the parameters that were kept.
    pub final_validation: EvalMetrics,
}

pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: Unet<B>,
    pub report: TrainingReport,
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    artifact: ModelArtifact,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, artifact: ModelArtifact, device: B::Device) -> Self {
        Self {
            config,
            artifact,
            device,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Loads the corpus, splits it and trains.
    pub fn run(&self, layout: &DatasetLayout) -> Result<TrainingOutcome<B>> {
        let dataset = layout.load(self.config.model.image_size as u32)?;
        let (train, validation) = dataset.split(self.config.validation_split, self.config.seed)?;
        info!(
            train = train.len(),
            validation = validation.len(),
            "dataset split"
        );
        self.fit(&train, &validation)
    }

    /// Trains on `train`, monitoring `validation`. Writes `config.json`,
    /// `best.mpk` on every improvement and `final.mpk` at the end.
    pub fn fit(&self, train: &Dataset, validation: &Dataset) -> Result<TrainingOutcome<B>> {
        if train.is_empty() || validation.is_empty() {
            return Err(ProcareSegError::validation(
                "dataset",
                "training and validation subsets must both be non-empty",
            ));
        }
        if self.config.batch_size == 0 {
            return Err(ProcareSegError::validation("batch_size", "must be positive"));
        }

        B::seed(self.config.seed);
        let model = self.config.model.try_init::<B>(&self.device)?;
        self.artifact.save_config(&self.config)?;
        info!(
            params = burn::module::Module::num_params(&model),
            epochs = self.config.num_epochs,
            batch_size = self.config.batch_size,
            "training started"
        );

        let mut optimizer = AdamConfig::new().with_epsilon(EPSILON).init();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut history = Vec::with_capacity(self.config.num_epochs);
        let mut stopper = EarlyStopping::new(self.config.patience);

        let outcome = drive_epochs(
            self.config.num_epochs,
            &mut stopper,
            model,
            |epoch, mut model: Unet<B>| {
                let mut order: Vec<usize> = (0..train.len()).collect();
                order.shuffle(&mut rng);

                let progress = self.progress_bar(order.len(), epoch);
                let mut accumulator = MetricAccumulator::default();
                for chunk in order.chunks(self.config.batch_size) {
                    let (images, masks) =
                        batch_tensors::<B>(train.samples(), chunk, &self.device)?;
                    let probabilities = model.forward(images);
                    let pixels = masks.shape().num_elements();
                    let correct = correct_pixels(probabilities.clone(), masks.clone());
                    let loss = binary_cross_entropy(probabilities, masks);
                    let loss_value = loss.clone().into_scalar().elem::<f64>();
                    accumulator.add(loss_value, chunk.len(), correct, pixels);

                    let grads = GradientsParams::from_grads(loss.backward(), &model);
                    model = optimizer.step(self.config.learning_rate, model, grads);
                    progress.inc(chunk.len() as u64);
                }
                progress.finish_and_clear();

                let train_metrics = accumulator.finish();
                let validation_metrics = evaluate(
                    &model.valid(),
                    validation,
                    self.config.batch_size,
                    &self.device,
                )?;
                info!(
                    epoch,
                    loss = train_metrics.loss,
                    accuracy = train_metrics.accuracy,
                    val_loss = validation_metrics.loss,
                    val_accuracy = validation_metrics.accuracy,
                    "epoch finished"
                );
                if !validation_metrics.loss.is_finite() {
                    warn!(epoch, "validation loss is not finite");
                }
                history.push(EpochMetrics {
                    epoch,
                    train: train_metrics,
                    validation: validation_metrics,
                });
                Ok((model, validation_metrics.loss))
            },
            |epoch, model| {
                debug!(epoch, "validation loss improved, saving best checkpoint");
                self.artifact.save_model(model, Checkpoint::Best)
            },
        )?;

        let model = outcome.state;
        self.artifact.save_model(&model, Checkpoint::Final)?;
        let final_validation = evaluate(
            &model.valid(),
            validation,
            self.config.batch_size,
            &self.device,
        )?;
        info!(
            val_loss = final_validation.loss,
            val_accuracy = final_validation.accuracy,
            "training finished"
        );

        Ok(TrainingOutcome {
            model,
            report: TrainingReport {
                history,
                epochs_run: outcome.epochs_run,
                stopped_early: outcome.stopped_early,
                best_epoch: outcome.best_epoch,
                best_validation_loss: outcome.best_loss,
                final_validation,
            },
        })
    }

    /// Per-pixel probabilities for every sample, `[n, 1, h, w]` flattened per sample.
    pub fn predict_samples(&self, model: &Unet<B>, dataset: &Dataset) -> Result<Vec<Vec<f32>>> {
        let model = model.valid();
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut predictions = Vec::with_capacity(dataset.len());
        for chunk in order.chunks(self.config.batch_size.max(1)) {
            let (images, _) =
                batch_tensors::<B::InnerBackend>(dataset.samples(), chunk, &self.device)?;
            let [_, _, height, width] = images.dims();
            let values = model.forward(images).into_data().to_vec::<f32>()?;
            predictions.extend(values.chunks(height * width).map(<[f32]>::to_vec));
        }
        Ok(predictions)
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> ProgressBar {
        let progress_bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            progress_bar.set_style(style.progress_chars("#>-"));
        }
        progress_bar.set_message(format!("epoch {epoch}/{}", self.config.num_epochs));
        progress_bar
    }
}

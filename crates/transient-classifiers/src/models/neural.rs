use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use log::info;
use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::NeuralParams;
use crate::error::{ClassifierError, Result};
use crate::models::classifier_trait::{ClassifierModel, FitSummary, FoldArtifact, FoldData};
use crate::models::net::{Architecture, TabularNet};
use crate::tracking::{EvalHistory, EvalMetrics, MetricSink};
use crate::utils::{array_to_tensor, get_device, sanitize_features};

/// Rows per forward pass at inference time.
const INFERENCE_BATCH_SIZE: usize = 4096;

/// What is persisted for a trained neural fold: the architecture descriptor
/// and the path of its best checkpoint.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NeuralArtifact {
    pub architecture: Architecture,
    pub weights_path: PathBuf,
    pub device: String,
}

/// Draws mini-batches with replacement from one slice of a fold.
struct BatchSampler<'a> {
    features: &'a Array2<f32>,
    labels: &'a [usize],
    weights: &'a [f64],
}

impl<'a> BatchSampler<'a> {
    fn sample(
        &self,
        rng: &mut StdRng,
        batch_size: usize,
        device: &Device,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let n = self.features.nrows();
        let ix: Vec<usize> = (0..batch_size).map(|_| rng.gen_range(0..n)).collect();

        let x = sanitize_features(&self.features.select(Axis(0), &ix));
        let x = array_to_tensor(&x, device)?;
        let y: Vec<u32> = ix.iter().map(|&i| self.labels[i] as u32).collect();
        let y = Tensor::from_vec(y, batch_size, device)?;
        let w: Vec<f32> = ix.iter().map(|&i| self.weights[i] as f32).collect();
        let w = Tensor::from_vec(w, batch_size, device)?;
        Ok((x, y, w))
    }
}

/// Cross-entropy of every row, scaled by its weight, then averaged.
pub fn weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    (nll * weights)?.mean_all()
}

fn count_correct(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f32> {
    logits
        .argmax(D::Minus1)?
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()
}

/// Neural network classifier trained with a fixed budget of mini-batch
/// iterations.
///
/// Every `eval_interval` iterations, and at the last one, the loss and
/// accuracy are estimated on freshly sampled batches of both slices. Whenever
/// the validation loss improves the weights are written to `weights_path`;
/// training always runs for `max_iters` iterations, and the best checkpoint
/// is reloaded at the end.
pub struct NeuralClassifier {
    params: NeuralParams,
    architecture: Architecture,
    weights_path: PathBuf,
    device: Device,
    varmap: VarMap,
    model: Box<dyn TabularNet>,
    history: EvalHistory,
    trained: bool,
}

impl NeuralClassifier {
    pub fn new(
        params: NeuralParams,
        num_features: usize,
        num_classes: usize,
        weights_path: PathBuf,
    ) -> Result<Self> {
        let device = get_device(&params.device)?;
        let architecture = Architecture::from_params(&params, num_features, num_classes);
        let varmap = VarMap::new();
        let varbuilder = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = architecture.build(varbuilder)?;

        let num_parameters: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!(
            "Built {} network with {} parameters",
            architecture.kind().as_str(),
            num_parameters
        );

        Ok(Self {
            params,
            architecture,
            weights_path,
            device,
            varmap,
            model,
            history: EvalHistory::default(),
            trained: false,
        })
    }

    /// Rebuild a trained network from its descriptor and best checkpoint.
    pub fn from_artifact(artifact: &NeuralArtifact) -> Result<Self> {
        let device = get_device(&artifact.device)?;
        let mut varmap = VarMap::new();
        let varbuilder = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = artifact.architecture.build(varbuilder)?;
        varmap.load(&artifact.weights_path)?;
        log::debug!("Loaded network weights from {:?}", artifact.weights_path);

        Ok(Self {
            params: NeuralParams {
                architecture: artifact.architecture.kind(),
                device: artifact.device.clone(),
                ..NeuralParams::default()
            },
            architecture: artifact.architecture.clone(),
            weights_path: artifact.weights_path.clone(),
            device,
            varmap,
            model,
            history: EvalHistory::default(),
            trained: true,
        })
    }

    pub fn history(&self) -> &EvalHistory {
        &self.history
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    fn save_checkpoint(&self) -> Result<()> {
        if let Some(parent) = self.weights_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.varmap.save(&self.weights_path)?;
        Ok(())
    }

    /// Mean loss and accuracy over `eval_iters` batches, without dropout.
    fn estimate_split(&self, sampler: &BatchSampler, rng: &mut StdRng) -> Result<(f32, f32)> {
        let eval_iters = self.params.eval_iters.max(1);
        let mut total_loss = 0f32;
        let mut correct = 0f32;
        let mut total = 0usize;
        for _ in 0..eval_iters {
            let (x, y, w) = sampler.sample(rng, self.params.batch_size, &self.device)?;
            let logits = self.model.forward(None, &x, false)?;
            total_loss += weighted_cross_entropy(&logits, &y, &w)?.to_scalar::<f32>()?;
            correct += count_correct(&logits, &y)?;
            total += self.params.batch_size;
        }
        Ok((total_loss / eval_iters as f32, correct / total as f32))
    }

    fn estimate_loss(
        &self,
        train: &BatchSampler,
        val: &BatchSampler,
        rng: &mut StdRng,
        step: usize,
    ) -> Result<EvalMetrics> {
        let (train_loss, train_accuracy) = self.estimate_split(train, rng)?;
        let (val_loss, val_accuracy) = self.estimate_split(val, rng)?;
        Ok(EvalMetrics {
            step,
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
        })
    }
}

impl ClassifierModel for NeuralClassifier {
    fn fit(&mut self, data: &FoldData, sink: &mut dyn MetricSink) -> Result<FitSummary> {
        data.validate()?;
        if data.train_features.ncols() != self.architecture.num_continuous() {
            return Err(ClassifierError::LengthMismatch {
                expected: self.architecture.num_continuous(),
                found: data.train_features.ncols(),
            });
        }
        if self.params.batch_size == 0 {
            return Err(ClassifierError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }

        let train = BatchSampler {
            features: data.train_features,
            labels: data.train_labels,
            weights: data.train_weights,
        };
        let val = BatchSampler {
            features: data.val_features,
            labels: data.val_labels,
            weights: data.val_weights,
        };

        let mut rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let adamw_params = ParamsAdamW {
            lr: self.params.learning_rate,
            ..Default::default()
        };
        let mut opt = AdamW::new(self.varmap.all_vars(), adamw_params)?;

        let max_iters = self.params.max_iters;
        let eval_interval = self.params.eval_interval.max(1);
        info!(
            "Training {} network on {} objects, validating on {} ({} iterations)",
            self.architecture.kind().as_str(),
            data.train_features.nrows(),
            data.val_features.nrows(),
            max_iters
        );

        let mut history = EvalHistory::default();
        let mut best: Option<(usize, f32)> = None;

        for iter in 0..max_iters {
            let (x, y, w) = train.sample(&mut rng, self.params.batch_size, &self.device)?;
            let logits = self.model.forward(None, &x, true)?;
            let loss = weighted_cross_entropy(&logits, &y, &w)?;
            opt.backward_step(&loss)?;

            if iter % eval_interval == 0 || iter == max_iters - 1 {
                let metrics = self.estimate_loss(&train, &val, &mut rng, iter)?;
                if best.map_or(true, |(_, loss)| metrics.val_loss < loss) {
                    best = Some((iter, metrics.val_loss));
                    self.save_checkpoint()?;
                    log::debug!(
                        "Saved checkpoint at step {} to {:?}",
                        iter,
                        self.weights_path
                    );
                }
                history.push(&metrics);
                sink.record(&metrics);
                info!(
                    "step {}/{}: train loss {:.4}, train accuracy {:.4}, val loss {:.4}, val accuracy {:.4}",
                    iter,
                    max_iters,
                    metrics.train_loss,
                    metrics.train_accuracy,
                    metrics.val_loss,
                    metrics.val_accuracy
                );
            }
        }

        let (best_step, best_loss) = match best {
            Some(best) => best,
            None => {
                // No improving evaluation, keep the current weights.
                let metrics = self.estimate_loss(&train, &val, &mut rng, max_iters)?;
                self.save_checkpoint()?;
                (max_iters, metrics.val_loss)
            }
        };

        self.varmap.load(&self.weights_path)?;
        self.history = history;
        self.trained = true;

        Ok(FitSummary {
            best_iteration: best_step,
            best_val_loss: best_loss as f64,
        })
    }

    fn predict_raw(&self, x: &Array2<f32>) -> Result<Array2<f64>> {
        if !self.trained {
            return Err(ClassifierError::NotTrained);
        }
        if x.ncols() != self.architecture.num_continuous() {
            return Err(ClassifierError::LengthMismatch {
                expected: self.architecture.num_continuous(),
                found: x.ncols(),
            });
        }

        let n = x.nrows();
        let mut scores = Array2::<f64>::zeros((n, self.architecture.num_classes()));
        let mut start = 0;
        while start < n {
            let end = (start + INFERENCE_BATCH_SIZE).min(n);
            let chunk = sanitize_features(&x.slice(s![start..end, ..]).to_owned());
            let input = array_to_tensor(&chunk, &self.device)?;
            let logits = self
                .model
                .forward(None, &input, false)?
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?;
            for (i, row) in logits.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    scores[(start + i, j)] = *v as f64;
                }
            }
            start = end;
        }
        Ok(scores)
    }

    fn into_artifact(self: Box<Self>) -> Result<FoldArtifact> {
        if !self.trained {
            return Err(ClassifierError::NotTrained);
        }
        Ok(FoldArtifact::Neural(NeuralArtifact {
            architecture: self.architecture,
            weights_path: self.weights_path,
            device: self.params.device,
        }))
    }

    fn name(&self) -> &str {
        self.architecture.kind().as_str()
    }
}

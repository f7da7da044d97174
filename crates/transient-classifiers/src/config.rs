use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ClassifierError, Result};

/// Global defaults for classifier training.
///
/// These are resolved once when a [`crate::classifier::Classifier`] is built
/// and passed down explicitly; nothing below the orchestrator reads them.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory that holds classifier bundles and per-fold weight files.
    pub classifier_directory: PathBuf,
    pub num_folds: usize,
    pub fold_random_state: u64,

    pub redshift_weighting_min_redshift: f64,
    pub redshift_weighting_max_redshift: f64,
    pub redshift_weighting_num_bins: usize,
    pub redshift_weighting_min_bin_count: f64,
    pub redshift_weighting_redshift_key: String,
    pub redshift_weighting_group_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            classifier_directory: PathBuf::from("./classifiers"),
            num_folds: 10,
            fold_random_state: 1,
            redshift_weighting_min_redshift: 0.1,
            redshift_weighting_max_redshift: 3.0,
            redshift_weighting_num_bins: 10,
            redshift_weighting_min_bin_count: 100.0,
            redshift_weighting_redshift_key: "host_specz".to_string(),
            redshift_weighting_group_key: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Keys that are absent keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let settings: Settings = serde_json::from_str(&contents)?;
        log::debug!("Loaded settings from {:?}", path.as_ref());
        Ok(settings)
    }

    pub fn with_classifier_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.classifier_directory = directory.into();
        self
    }

    /// Path of the serialized bundle for the classifier called `name`.
    pub fn classifier_path(&self, name: &str) -> PathBuf {
        self.classifier_directory
            .join(format!("classifier_{}.json", name))
    }

    /// Path of the neural checkpoint for one fold of the classifier called `name`.
    pub fn fold_weights_path(&self, name: &str, fold: usize) -> PathBuf {
        self.classifier_directory
            .join(format!("classifier_{}_{}.safetensors", name, fold))
    }
}

/// Which classifier backend to train, with its hyper-parameters.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    TreeEnsemble(TreeEnsembleParams),
    Neural(NeuralParams),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::TreeEnsemble(TreeEnsembleParams::default())
    }
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::TreeEnsemble(_) => "gbdt",
            BackendConfig::Neural(params) => params.architecture.as_str(),
        }
    }
}

impl FromStr for BackendConfig {
    type Err = ClassifierError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gbdt" | "tree" | "lightgbm" => {
                Ok(BackendConfig::TreeEnsemble(TreeEnsembleParams::default()))
            }
            other => {
                let architecture: ArchitectureKind = other.parse()?;
                Ok(BackendConfig::Neural(NeuralParams {
                    architecture,
                    ..NeuralParams::default()
                }))
            }
        }
    }
}

/// Hyper-parameters of the boosted tree ensemble.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TreeEnsembleParams {
    pub learning_rate: f32,
    /// Fraction of features sampled for every tree.
    pub feature_fraction: f64,
    /// Fraction of rows sampled for every tree.
    pub data_sample_ratio: f64,
    pub max_depth: u32,
    pub min_leaf_size: usize,
    /// Upper bound on boosting rounds.
    pub n_estimators: usize,
    /// Stop when the validation loss has not improved for this many rounds.
    pub early_stopping_rounds: usize,
    pub training_optimization_level: u8,
    /// Log the validation loss every `verbose_eval` rounds (0 disables).
    pub verbose_eval: usize,
}

impl Default for TreeEnsembleParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            feature_fraction: 0.5,
            data_sample_ratio: 1.0,
            max_depth: 7,
            min_leaf_size: 1,
            n_estimators: 5000,
            early_stopping_rounds: 50,
            training_optimization_level: 2,
            verbose_eval: 100,
        }
    }
}

/// Neural architectures available to the neural backend.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureKind {
    /// Wide and shallow multilayer perceptron.
    Mlp,
    /// Attention-based tabular transformer over per-feature tokens.
    FtTransformer,
}

impl ArchitectureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchitectureKind::Mlp => "mlp",
            ArchitectureKind::FtTransformer => "ft",
        }
    }
}

impl FromStr for ArchitectureKind {
    type Err = ClassifierError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mlp" => Ok(ArchitectureKind::Mlp),
            "ft" | "ft_transformer" | "fttransformer" => Ok(ArchitectureKind::FtTransformer),
            _ => Err(ClassifierError::Configuration(format!(
                "Unknown model type: {}. Expected one of gbdt, mlp or ft",
                s
            ))),
        }
    }
}

/// Hyper-parameters of the neural backend and its training loop.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NeuralParams {
    pub architecture: ArchitectureKind,
    pub batch_size: usize,
    pub max_iters: usize,
    /// Token embedding width of the transformer.
    pub dim: usize,
    pub depth: usize,
    pub heads: usize,
    pub dim_head: usize,
    /// Hidden width of the multilayer perceptron.
    pub hidden_dim: usize,
    pub attn_dropout: f32,
    pub ff_dropout: f32,
    pub learning_rate: f64,
    pub eval_interval: usize,
    /// Number of mini-batches drawn per split at every evaluation.
    pub eval_iters: usize,
    pub device: String,
    /// Seed for mini-batch sampling. Drawn from entropy when unset.
    pub seed: Option<u64>,
    /// Identifier of the metric sink receiving evaluation metrics.
    pub metric_sink: Option<String>,
}

impl Default for NeuralParams {
    fn default() -> Self {
        Self {
            architecture: ArchitectureKind::Mlp,
            batch_size: 32,
            max_iters: 10000,
            dim: 32,
            depth: 6,
            heads: 8,
            dim_head: 16,
            hidden_dim: 512,
            attn_dropout: 0.1,
            ff_dropout: 0.1,
            learning_rate: 1e-4,
            eval_interval: 200,
            eval_iters: 200,
            device: "cpu".to_string(),
            seed: None,
            metric_sink: None,
        }
    }
}

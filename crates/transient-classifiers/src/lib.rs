//! transient-classifiers: cross-validated classifiers for astronomical transients.
//!
//! This crate trains an ensemble of per-fold classifiers (a boosted tree
//! ensemble or a neural network) on a labelled dataset of feature-engineered
//! objects, collects strictly out-of-fold class probabilities, and scores them
//! with a weighted multi-class log-loss. Object weights correct for class
//! imbalance and, optionally, for redshift-dependent selection effects.
//!
//! The crate never installs a logger; callers choose one (e.g. `env_logger`).
pub mod classifier;
pub mod config;
pub mod data_handling;
pub mod error;
pub mod models;
pub mod predictions;
pub mod stats;
pub mod tracking;
pub mod utils;
pub mod weights;

pub use classifier::{Classifier, ClassifierBundle, TrainingReport};
pub use config::{BackendConfig, Settings};
pub use error::{ClassifierError, Result};

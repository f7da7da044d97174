use std::path::PathBuf;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::models::classifier_trait::ClassifierModel;
use crate::models::gbdt::GBDTClassifier;
use crate::models::neural::NeuralClassifier;

/// Shape of the problem a fold model is built for, and where a neural
/// backend keeps its checkpoint.
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub num_features: usize,
    pub num_classes: usize,
    pub weights_path: PathBuf,
}

/// Build an untrained fold model for the configured backend.
pub fn build_model(
    backend: &BackendConfig,
    context: &ModelContext,
) -> Result<Box<dyn ClassifierModel>> {
    match backend {
        BackendConfig::TreeEnsemble(params) => Ok(Box::new(GBDTClassifier::new(
            params.clone(),
            context.num_features,
            context.num_classes,
        ))),
        BackendConfig::Neural(params) => Ok(Box::new(NeuralClassifier::new(
            params.clone(),
            context.num_features,
            context.num_classes,
            context.weights_path.clone(),
        )?)),
    }
}

pub mod gbdt;
pub mod net;
pub mod neural;
pub mod nn;

pub mod classifier_trait;
pub mod factory;

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::{ArchitectureKind, NeuralParams};
use crate::models::nn::{FtTransformer, FtTransformerConfig};

/// A network mapping `(categorical, continuous)` inputs to class logits.
pub trait TabularNet {
    /// `continuous` is `(batch, num_continuous)`; `categorical`, when given,
    /// holds `u32` category indices of shape `(batch, num_categories)`.
    /// Dropout is only active when `train` is set.
    fn forward(&self, categorical: Option<&Tensor>, continuous: &Tensor, train: bool)
        -> Result<Tensor>;
}

/// Parameters of [`SimpleMlp`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MlpConfig {
    pub num_continuous: usize,
    pub hidden_dim: usize,
    pub dim_out: usize,
    pub dropout: f32,
}

/// Two wide hidden layers with ReLU and dropout.
pub struct SimpleMlp {
    lin1: Linear,
    lin2: Linear,
    out: Linear,
    dropout: Dropout,
}

impl SimpleMlp {
    pub fn new(varbuilder: VarBuilder, config: &MlpConfig) -> Result<Self> {
        let half = (config.hidden_dim / 2).max(1);
        Ok(Self {
            lin1: candle_nn::linear(config.num_continuous, config.hidden_dim, varbuilder.pp("lin1"))?,
            lin2: candle_nn::linear(config.hidden_dim, half, varbuilder.pp("lin2"))?,
            out: candle_nn::linear(half, config.dim_out, varbuilder.pp("out"))?,
            dropout: Dropout::new(config.dropout),
        })
    }
}

impl TabularNet for SimpleMlp {
    fn forward(
        &self,
        _categorical: Option<&Tensor>,
        continuous: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let x = self.lin1.forward(continuous)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.lin2.forward(&x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        self.out.forward(&x)
    }
}

/// Serializable description of a network, enough to rebuild it before
/// loading its weights.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Architecture {
    Mlp(MlpConfig),
    FtTransformer(FtTransformerConfig),
}

impl Architecture {
    pub fn from_params(params: &NeuralParams, num_continuous: usize, num_classes: usize) -> Self {
        match params.architecture {
            ArchitectureKind::Mlp => Architecture::Mlp(MlpConfig {
                num_continuous,
                hidden_dim: params.hidden_dim,
                dim_out: num_classes,
                dropout: params.ff_dropout,
            }),
            ArchitectureKind::FtTransformer => Architecture::FtTransformer(FtTransformerConfig {
                categories: Vec::new(),
                num_continuous,
                dim: params.dim,
                dim_out: num_classes,
                depth: params.depth,
                heads: params.heads,
                dim_head: params.dim_head,
                attn_dropout: params.attn_dropout,
                ff_dropout: params.ff_dropout,
            }),
        }
    }

    pub fn kind(&self) -> ArchitectureKind {
        match self {
            Architecture::Mlp(_) => ArchitectureKind::Mlp,
            Architecture::FtTransformer(_) => ArchitectureKind::FtTransformer,
        }
    }

    pub fn num_continuous(&self) -> usize {
        match self {
            Architecture::Mlp(config) => config.num_continuous,
            Architecture::FtTransformer(config) => config.num_continuous,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Architecture::Mlp(config) => config.dim_out,
            Architecture::FtTransformer(config) => config.dim_out,
        }
    }

    /// Create the network, registering its variables in `varbuilder`.
    pub fn build(&self, varbuilder: VarBuilder) -> Result<Box<dyn TabularNet>> {
        match self {
            Architecture::Mlp(config) => Ok(Box::new(SimpleMlp::new(varbuilder, config)?)),
            Architecture::FtTransformer(config) => {
                Ok(Box::new(FtTransformer::new(varbuilder, config)?))
            }
        }
    }
}

//! Attention-based tabular transformer: every feature becomes a token, a
//! learned CLS token is prepended, and the CLS output is classified.
use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::models::net::TabularNet;

/// Parameters of [`FtTransformer`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FtTransformerConfig {
    /// Cardinality of every categorical input column.
    pub categories: Vec<usize>,
    pub num_continuous: usize,
    pub dim: usize,
    pub dim_out: usize,
    pub depth: usize,
    pub heads: usize,
    pub dim_head: usize,
    pub attn_dropout: f32,
    pub ff_dropout: f32,
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    to_qkv: Linear,
    to_out: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        varbuilder: VarBuilder,
        model_dim: usize,
        num_heads: usize,
        head_dim: usize,
        dropout_prob: f32,
    ) -> Result<Self> {
        let inner_dim = num_heads * head_dim;
        Ok(Self {
            to_qkv: candle_nn::linear_no_bias(model_dim, inner_dim * 3, varbuilder.pp("to_qkv"))?,
            to_out: candle_nn::linear(inner_dim, model_dim, varbuilder.pp("to_out"))?,
            dropout: Dropout::new(dropout_prob),
            num_heads,
            head_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        log::trace!(
            "[MultiHeadAttention] b={}, t={}, heads={}, head_dim={}",
            b,
            t,
            self.num_heads,
            self.head_dim
        );

        let qkv = self.to_qkv.forward(x)?.chunk(3, D::Minus1)?;
        let split_heads = |x: &Tensor| -> Result<Tensor> {
            x.contiguous()?
                .reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(&qkv[0])?;
        let k = split_heads(&qkv[1])?;
        let v = split_heads(&qkv[2])?;

        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = q
            .matmul(&k_t)?
            .affine(1.0 / (self.head_dim as f64).sqrt(), 0.0)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = self.dropout.forward(&attn, training)?;

        let context = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.to_out.forward(&context)
    }
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    lin1: Linear,
    lin2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        varbuilder: VarBuilder,
        model_dim: usize,
        ff_dim: usize,
        dropout_prob: f32,
    ) -> Result<Self> {
        Ok(Self {
            lin1: candle_nn::linear(model_dim, ff_dim, varbuilder.pp("lin1"))?,
            lin2: candle_nn::linear(ff_dim, model_dim, varbuilder.pp("lin2"))?,
            dropout: Dropout::new(dropout_prob),
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let x = self.lin1.forward(x)?.gelu()?;
        let x = self.dropout.forward(&x, training)?;
        self.lin2.forward(&x)
    }
}

/// Pre-norm transformer block with residual connections.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attn: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(varbuilder: VarBuilder, config: &FtTransformerConfig) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(
                varbuilder.pp("attn"),
                config.dim,
                config.heads,
                config.dim_head,
                config.attn_dropout,
            )?,
            ff: FeedForward::new(varbuilder.pp("ff"), config.dim, config.dim * 4, config.ff_dropout)?,
            norm1: candle_nn::layer_norm(config.dim, 1e-5, varbuilder.pp("norm1"))?,
            norm2: candle_nn::layer_norm(config.dim, 1e-5, varbuilder.pp("norm2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let attn = self.attn.forward(&self.norm1.forward(x)?, training)?;
        let x = (x + attn)?;
        let ff = self.ff.forward(&self.norm2.forward(&x)?, training)?;
        x + ff
    }
}

/// Feature tokenizer transformer for tabular data.
pub struct FtTransformer {
    num_weights: Tensor,
    num_biases: Tensor,
    categorical: Option<(Embedding, Tensor)>,
    cls_token: Tensor,
    blocks: Vec<TransformerBlock>,
    head_norm: LayerNorm,
    head: Linear,
    dim: usize,
}

impl FtTransformer {
    pub fn new(varbuilder: VarBuilder, config: &FtTransformerConfig) -> Result<Self> {
        let init = candle_nn::init::DEFAULT_KAIMING_NORMAL;
        let num_weights = varbuilder.get_with_hints(
            (config.num_continuous, config.dim),
            "numerical_embedder.weights",
            init,
        )?;
        let num_biases = varbuilder.get_with_hints(
            (config.num_continuous, config.dim),
            "numerical_embedder.biases",
            init,
        )?;

        let categorical = if config.categories.is_empty() {
            None
        } else {
            let total: usize = config.categories.iter().sum();
            let mut offsets = Vec::with_capacity(config.categories.len());
            let mut running = 0u32;
            for &cardinality in &config.categories {
                offsets.push(running);
                running += cardinality as u32;
            }
            let embedding =
                candle_nn::embedding(total, config.dim, varbuilder.pp("categorical_embeds"))?;
            let offsets = Tensor::new(offsets.as_slice(), varbuilder.device())?;
            Some((embedding, offsets))
        };

        let cls_token = varbuilder.get_with_hints((1, 1, config.dim), "cls_token", init)?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(TransformerBlock::new(
                varbuilder.pp(format!("block_{}", i)),
                config,
            )?);
        }

        Ok(Self {
            num_weights,
            num_biases,
            categorical,
            cls_token,
            blocks,
            head_norm: candle_nn::layer_norm(config.dim, 1e-5, varbuilder.pp("head_norm"))?,
            head: candle_nn::linear(config.dim, config.dim_out, varbuilder.pp("head"))?,
            dim: config.dim,
        })
    }
}

impl TabularNet for FtTransformer {
    fn forward(
        &self,
        categorical: Option<&Tensor>,
        continuous: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (b, _) = continuous.dims2()?;

        // (b, n) -> (b, n, dim)
        let numerical = continuous
            .unsqueeze(2)?
            .broadcast_mul(&self.num_weights.unsqueeze(0)?)?
            .broadcast_add(&self.num_biases.unsqueeze(0)?)?;

        let mut tokens = vec![self.cls_token.broadcast_as((b, 1, self.dim))?.contiguous()?];
        if let (Some((embedding, offsets)), Some(categorical)) = (&self.categorical, categorical) {
            let indices = categorical.broadcast_add(offsets)?;
            tokens.push(embedding.forward(&indices)?);
        }
        tokens.push(numerical);

        let mut x = Tensor::cat(&tokens, 1)?;
        log::trace!("[FtTransformer] token shape: {:?}", x.shape());

        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }

        let cls = x.i((.., 0))?;
        let cls = self.head_norm.forward(&cls)?.relu()?;
        self.head.forward(&cls)
    }
}

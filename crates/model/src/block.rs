use candle_core::{Error, Result, Tensor};
use candle_nn::{ops, Dropout, LayerNorm, Linear, Module, ModuleT, VarBuilder};

use crate::config::ViTConfig;

/// Multi-head self attention that also hands back its attention weights.
#[derive(Debug)]
pub struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    num_heads: usize,
    head_dim: usize,
    attn_dropout: Dropout,
    proj_dropout: Dropout,
}

impl Attention {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, vb.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, vb.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, vb.pp("value"))?,
            out: candle_nn::linear(hidden, hidden, vb.pp("out"))?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
            attn_dropout: Dropout::new(cfg.attention_dropout),
            proj_dropout: Dropout::new(cfg.attention_dropout),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, tokens, _) = xs.dims3()?;
        xs.reshape((batch, tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns `(output [batch, tokens, hidden], weights [batch, heads, tokens, tokens])`.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (batch, tokens, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let weights = ops::softmax_last_dim(&scores)?;
        let probs = self.attn_dropout.forward_t(&weights, train)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, tokens, hidden))?;
        let output = self.proj_dropout.forward_t(&self.out.forward(&context)?, train)?;
        Ok((output, weights))
    }
}

#[derive(Debug)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.mlp_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.mlp_dim, cfg.hidden_size, vb.pp("fc2"))?,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu_erf()?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        let out = self.fc2.forward(&hidden)?;
        self.dropout.forward_t(&out, train)
    }
}

/// Pre-norm encoder block: `x + attn(norm(x))`, then `x + mlp(norm(x))`.
#[derive(Debug)]
pub struct EncoderBlock {
    attention_norm: LayerNorm,
    attention: Attention,
    ffn_norm: LayerNorm,
    ffn: Mlp,
}

impl EncoderBlock {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("attention_norm"),
            )?,
            attention: Attention::new(cfg, vb.pp("attn"))?,
            ffn_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("ffn_norm"))?,
            ffn: Mlp::new(cfg, vb.pp("ffn"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (attended, weights) = self
            .attention
            .forward(&self.attention_norm.forward(xs)?, train)?;
        let xs = (xs + attended)?;
        let ffn = self.ffn.forward(&self.ffn_norm.forward(&xs)?, train)?;
        Ok(((xs + ffn)?, weights))
    }
}

/// Stack of encoder blocks followed by the final layer norm.
#[derive(Debug)]
pub struct Encoder {
    layers: Vec<EncoderBlock>,
    encoder_norm: LayerNorm,
}

impl Encoder {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.num_layers);
        for index in 0..cfg.num_layers {
            layers.push(EncoderBlock::new(cfg, vb.pp(format!("layer.{index}")))?);
        }
        if layers.is_empty() {
            return Err(Error::Msg("encoder requires at least one layer".into()));
        }
        Ok(Self {
            layers,
            encoder_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("encoder_norm"),
            )?,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Vec<Tensor>)> {
        let mut hidden = xs.clone();
        let mut attention_maps = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, weights) = layer.forward(&hidden, train)?;
            hidden = next;
            attention_maps.push(weights);
        }
        Ok((self.encoder_norm.forward(&hidden)?, attention_maps))
    }
}

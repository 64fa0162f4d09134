// SelfiesScorer: spectrum-conditioned encoder-decoder over SELFIES token prefixes.
//
//   observation [B,D] -> spec_proj -> encoder (1-position memory)
//   token ids   [B,T] -> tok + pos embed -> causal decoder (cross-attends memory)
//   hidden at last valid position -> action head (logits) + value head

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{
    embedding, linear, linear_no_bias, Embedding, Linear, VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};

use crate::error::ZeroError;

// ---------------------------------------------------------------------------
// Gradient-safe LayerNorm (built from basic ops so backward works)
// ---------------------------------------------------------------------------

pub struct GradLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradLayerNorm {
    pub fn new(d_model: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(d_model, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(d_model, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
            .map_err(Into::into)
    }
}

fn grad_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerConfig {
    pub observation_dim: usize,
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_enc: usize,
    pub n_dec: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    /// Size of the learned positional table; bounds the decoder length.
    pub max_positions: usize,
    pub layer_norm_eps: f64,
    /// Drop probability on the training path; inference never drops.
    pub dropout: f32,
}

impl ScorerConfig {
    /// Full-size scorer: 4096-d spectra, d=512, 4 encoder / 6 decoder layers, 8 heads.
    pub fn base(vocab_size: usize) -> Self {
        Self {
            observation_dim: 4096,
            vocab_size,
            d_model: 512,
            n_enc: 4,
            n_dec: 6,
            n_heads: 8,
            d_ff: 2048,
            max_positions: 1024,
            layer_norm_eps: 1e-5,
            dropout: 0.1,
        }
    }

    /// Small config for tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            observation_dim: 32,
            vocab_size,
            d_model: 32,
            n_enc: 1,
            n_dec: 2,
            n_heads: 4,
            d_ff: 64,
            max_positions: 64,
            layer_norm_eps: 1e-5,
            dropout: 0.1,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ZeroError::InvalidConfig(msg).into()) };
        if self.observation_dim == 0 || self.vocab_size == 0 || self.d_model == 0 {
            return fail("observation_dim, vocab_size and d_model must be non-zero".into());
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return fail(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            ));
        }
        if self.n_dec == 0 {
            return fail("decoder needs at least one layer".into());
        }
        if self.max_positions == 0 {
            return fail("max_positions must be non-zero".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout {} must be in [0, 1)", self.dropout));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Masks
// ---------------------------------------------------------------------------

/// `[1,1,T,T]` additive mask: 0 on and below the diagonal, -inf above.
pub fn build_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j <= i { 0.0f32 } else { f32::NEG_INFINITY })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device).map_err(Into::into)
}

/// `[B,1,1,T]` additive mask excluding keys whose validity bit is 0.
pub fn build_key_padding_mask(mask: &Tensor) -> Result<Tensor> {
    let (b, t) = mask.dims2()?;
    let device = mask.device();
    let zeros = Tensor::zeros((b, t), DType::F32, device)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (b, t), device)?;
    mask.to_dtype(DType::U8)?
        .where_cond(&zeros, &neg_inf)?
        .reshape((b, 1, 1, t))
        .map_err(Into::into)
}

/// Length of the leading valid run of every row. Every row needs at least one.
pub fn valid_lengths(mask: &Tensor) -> Result<Vec<usize>> {
    let rows = mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
    rows.iter()
        .enumerate()
        .map(|(row, bits)| {
            let len = bits.iter().take_while(|&&m| m != 0).count();
            if len == 0 {
                Err(ZeroError::EmptySequence { row }.into())
            } else {
                Ok(len)
            }
        })
        .collect()
}

/// Dropout only when training with a non-zero rate.
fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p)?)
    } else {
        Ok(x.clone())
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    fn new(cfg: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            q_proj: linear(d, d, vb.pp("q_proj"))?,
            k_proj: linear(d, d, vb.pp("k_proj"))?,
            v_proj: linear(d, d, vb.pp("v_proj"))?,
            o_proj: linear(d, d, vb.pp("o_proj"))?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        x.reshape((b, s, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
            .map_err(Into::into)
    }

    /// `query` [B,Tq,d] attends over `kv` [B,Tk,d]; `mask` is additive and
    /// broadcastable to [B,heads,Tq,Tk].
    fn forward(&self, query: &Tensor, kv: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, tq, _d) = query.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let k = self.split_heads(&self.k_proj.forward(kv)?)?;
        let v = self.split_heads(&self.v_proj.forward(kv)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let mut attn = (attn / scale)?;
        if let Some(mask) = mask {
            attn = attn.broadcast_add(mask)?;
        }
        let attn = grad_softmax_last_dim(&attn)?;

        let out = attn.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .reshape((b, tq, self.n_heads * self.head_dim))?;
        self.o_proj.forward(&out).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Feed-forward
// ---------------------------------------------------------------------------

struct FeedForward {
    up: Linear,
    down: Linear,
    dropout: f32,
}

impl FeedForward {
    fn new(cfg: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            up: linear(cfg.d_model, cfg.d_ff, vb.pp("up"))?,
            down: linear(cfg.d_ff, cfg.d_model, vb.pp("down"))?,
            dropout: cfg.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = dropout(&self.up.forward(x)?.relu()?, self.dropout, train)?;
        self.down.forward(&h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Encoder / decoder layers (post-norm)
// ---------------------------------------------------------------------------

struct EncoderLayer {
    self_attn: MultiHeadAttention,
    norm1: GradLayerNorm,
    ff: FeedForward,
    norm2: GradLayerNorm,
    dropout: f32,
}

impl EncoderLayer {
    fn new(cfg: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(cfg, vb.pp("self_attn"))?,
            norm1: GradLayerNorm::new(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm1"))?,
            ff: FeedForward::new(cfg, vb.pp("ff"))?,
            norm2: GradLayerNorm::new(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm2"))?,
            dropout: cfg.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = dropout(&self.self_attn.forward(x, x, None)?, self.dropout, train)?;
        let x = self.norm1.forward(&(x + h)?)?;
        let h = dropout(&self.ff.forward(&x, train)?, self.dropout, train)?;
        self.norm2.forward(&(x + h)?)
    }
}

struct DecoderLayer {
    self_attn: MultiHeadAttention,
    norm1: GradLayerNorm,
    cross_attn: MultiHeadAttention,
    norm2: GradLayerNorm,
    ff: FeedForward,
    norm3: GradLayerNorm,
    dropout: f32,
}

impl DecoderLayer {
    fn new(cfg: &ScorerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(cfg, vb.pp("self_attn"))?,
            norm1: GradLayerNorm::new(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm1"))?,
            cross_attn: MultiHeadAttention::new(cfg, vb.pp("cross_attn"))?,
            norm2: GradLayerNorm::new(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm2"))?,
            ff: FeedForward::new(cfg, vb.pp("ff"))?,
            norm3: GradLayerNorm::new(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm3"))?,
            dropout: cfg.dropout,
        })
    }

    fn forward(&self, x: &Tensor, memory: &Tensor, tgt_mask: &Tensor, train: bool) -> Result<Tensor> {
        let p = self.dropout;
        let h = dropout(&self.self_attn.forward(x, x, Some(tgt_mask))?, p, train)?;
        let x = self.norm1.forward(&(x + h)?)?;
        let h = dropout(&self.cross_attn.forward(&x, memory, None)?, p, train)?;
        let x = self.norm2.forward(&(x + h)?)?;
        let h = dropout(&self.ff.forward(&x, train)?, p, train)?;
        self.norm3.forward(&(x + h)?)
    }
}

// ---------------------------------------------------------------------------
// SelfiesScorer
// ---------------------------------------------------------------------------

pub struct SelfiesScorer {
    pub config: ScorerConfig,
    spec_proj: Linear,
    encoder: Vec<EncoderLayer>,
    tok_emb: Embedding,
    pos_emb: Embedding,
    decoder: Vec<DecoderLayer>,
    action_head: Linear,
    value_hidden: Linear,
    value_out: Linear,
    device: Device,
}

impl SelfiesScorer {
    pub fn from_vb(cfg: ScorerConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        cfg.validate()?;
        let spec_proj = linear(cfg.observation_dim, cfg.d_model, vb.pp("spec_proj"))?;
        let encoder = (0..cfg.n_enc)
            .map(|i| EncoderLayer::new(&cfg, vb.pp(format!("encoder_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let tok_emb = embedding(cfg.vocab_size, cfg.d_model, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.max_positions, cfg.d_model, vb.pp("pos_emb"))?;
        let decoder = (0..cfg.n_dec)
            .map(|i| DecoderLayer::new(&cfg, vb.pp(format!("decoder_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let action_head = linear_no_bias(cfg.d_model, cfg.vocab_size, vb.pp("action_head"))?;
        let value_hidden = linear(cfg.d_model, cfg.d_model, vb.pp("value_hidden"))?;
        let value_out = linear(cfg.d_model, 1, vb.pp("value_out"))?;
        Ok(Self {
            config: cfg,
            spec_proj,
            encoder,
            tok_emb,
            pos_emb,
            decoder,
            action_head,
            value_hidden,
            value_out,
            device: device.clone(),
        })
    }

    pub fn new(cfg: ScorerConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::from_vb(cfg, vb, device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Project observations to the single-position memory `[B,1,d]`.
    pub fn encode_observation(&self, observation: &Tensor) -> Result<Tensor> {
        self.encode_memory(observation, false)
    }

    fn encode_memory(&self, observation: &Tensor, train: bool) -> Result<Tensor> {
        let obs = observation.to_device(&self.device)?.to_dtype(DType::F32)?;
        let proj = self.spec_proj.forward(&obs)?.relu()?;
        let mut mem = dropout(&proj, self.config.dropout, train)?.unsqueeze(1)?;
        for layer in &self.encoder {
            mem = layer.forward(&mem, train)?;
        }
        Ok(mem)
    }

    /// Observation batch must equal the token batch, or be 1 (broadcast).
    fn align_observation(&self, observation: &Tensor, batch: usize) -> Result<Tensor> {
        let (rows, dim) = observation.dims2()?;
        if dim != self.config.observation_dim {
            return Err(ZeroError::InvalidConfig(format!(
                "observation dim {dim} != configured {}",
                self.config.observation_dim
            ))
            .into());
        }
        if rows == batch {
            Ok(observation.clone())
        } else if rows == 1 {
            Ok(observation.broadcast_as((batch, dim))?.contiguous()?)
        } else {
            Err(ZeroError::BatchMismatch {
                what: "observation",
                got: rows,
                expected: batch,
            }
            .into())
        }
    }

    fn decode(&self, observation: &Tensor, ids: &Tensor, mask: &Tensor, train: bool) -> Result<(Tensor, Vec<usize>)> {
        let (b, t) = ids.dims2()?;
        let (mb, mt) = mask.dims2()?;
        if (mb, mt) != (b, t) {
            return Err(ZeroError::BatchMismatch { what: "mask", got: mb, expected: b }.into());
        }
        if t > self.config.max_positions {
            return Err(ZeroError::LengthExceeded { len: t, max_len: self.config.max_positions }.into());
        }
        let lengths = valid_lengths(mask)?;

        let obs = self.align_observation(observation, b)?;
        let memory = self.encode_memory(&obs, train)?;

        let ids = ids.to_device(&self.device)?.to_dtype(DType::U32)?;
        let mask = mask.to_device(&self.device)?;
        let pos_ids = Tensor::arange(0u32, t as u32, &self.device)?.unsqueeze(0)?;
        let mut x = self
            .tok_emb
            .forward(&ids)?
            .broadcast_add(&self.pos_emb.forward(&pos_ids)?)?;

        let tgt_mask = build_causal_mask(t, &self.device)?
            .broadcast_add(&build_key_padding_mask(&mask)?)?;
        for layer in &self.decoder {
            x = layer.forward(&x, &memory, &tgt_mask, train)?;
        }
        Ok((x, lengths))
    }

    /// Decoder hidden states `[B,T,d]`.
    pub fn hidden_states(&self, observation: &Tensor, ids: &Tensor, mask: &Tensor) -> Result<Tensor> {
        Ok(self.decode(observation, ids, mask, false)?.0)
    }

    /// Gather `hidden[row, len-1]` for every row -> `[B,d]`.
    fn gather_last_valid(hidden: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let (b, t, _d) = hidden.dims3()?;
        let mut sel = vec![0f32; b * t];
        for (row, &len) in lengths.iter().enumerate() {
            sel[row * t + len - 1] = 1.0;
        }
        let sel = Tensor::from_vec(sel, (b, 1, t), hidden.device())?.to_dtype(hidden.dtype())?;
        sel.matmul(hidden)?.squeeze(1).map_err(Into::into)
    }

    fn value_from(&self, last: &Tensor) -> Result<Tensor> {
        let h = self.value_hidden.forward(last)?.tanh()?;
        self.value_out.forward(&h)?.squeeze(D::Minus1).map_err(Into::into)
    }

    /// `(logits [B,V], value [B])` read at the last valid position of each row.
    /// Deterministic: dropout is off.
    pub fn forward(&self, observation: &Tensor, ids: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (hidden, lengths) = self.decode(observation, ids, mask, false)?;
        let last = Self::gather_last_valid(&hidden, &lengths)?;
        let logits = self.action_head.forward(&last)?;
        let value = self.value_from(&last)?;
        Ok((logits, value))
    }

    /// Teacher-forcing view: logits at every position `[B,T,V]` plus the
    /// last-valid value `[B]`. `train` enables dropout.
    pub fn forward_sequence(
        &self,
        observation: &Tensor,
        ids: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (hidden, lengths) = self.decode(observation, ids, mask, train)?;
        let logits = self.action_head.forward(&hidden)?;
        let last = Self::gather_last_valid(&hidden, &lengths)?;
        let value = self.value_from(&last)?;
        Ok((logits, value))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_length_exceeded;

    const V: usize = 24;

    fn tiny_model(device: &Device) -> Result<(SelfiesScorer, VarMap)> {
        let varmap = VarMap::new();
        let model = SelfiesScorer::new(ScorerConfig::tiny(V), &varmap, device)?;
        Ok((model, varmap))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 0, 0, 0], [1, 4, 0, 0, 0, 0]], &device)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 0, 0, 0], [1, 1, 0, 0, 0, 0]], &device)?;

        let (logits, value) = model.forward(&obs, &ids, &mask)?;
        assert_eq!(logits.dims2()?, (2, V));
        assert_eq!(value.dims1()?, 2);

        let (seq_logits, _) = model.forward_sequence(&obs, &ids, &mask, false)?;
        assert_eq!(seq_logits.dims3()?, (2, 6, V));
        Ok(())
    }

    #[test]
    fn test_causal_mask_values() -> Result<()> {
        let mask = build_causal_mask(3, &Device::Cpu)?;
        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite() && rows[0][1] < 0.0);
        assert!(rows[1][2].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_key_padding_mask() -> Result<()> {
        let mask = Tensor::new(&[[1u8, 1, 0]], &Device::Cpu)?;
        let additive = build_key_padding_mask(&mask)?;
        assert_eq!(additive.dims(), &[1, 1, 1, 3]);
        let v = additive.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&v[..2], &[0.0, 0.0]);
        assert!(v[2].is_infinite() && v[2] < 0.0);
        Ok(())
    }

    #[test]
    fn test_padding_content_ignored() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (1, 32), &device)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 0, 0, 0]], &device)?;
        let a = Tensor::new(&[[1u32, 5, 6, 0, 0, 0]], &device)?;
        let b = Tensor::new(&[[1u32, 5, 6, 9, 11, 13]], &device)?;

        let (la, va) = model.forward(&obs, &a, &mask)?;
        let (lb, vb) = model.forward(&obs, &b, &mask)?;
        assert!(max_abs_diff(&la, &lb)? < 1e-5);
        assert!(max_abs_diff(&va, &vb)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_last_valid_not_last_slot() -> Result<()> {
        // Same prefix scored at two pad widths must agree: the read position
        // follows the true length, not the tensor width.
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (1, 32), &device)?;
        let short = Tensor::new(&[[1u32, 5, 6]], &device)?;
        let short_mask = Tensor::new(&[[1u8, 1, 1]], &device)?;
        let long = Tensor::new(&[[1u32, 5, 6, 0, 0, 0, 0, 0]], &device)?;
        let long_mask = Tensor::new(&[[1u8, 1, 1, 0, 0, 0, 0, 0]], &device)?;

        let (ls, vs) = model.forward(&obs, &short, &short_mask)?;
        let (ll, vl) = model.forward(&obs, &long, &long_mask)?;
        assert!(max_abs_diff(&ls, &ll)? < 1e-4);
        assert!(max_abs_diff(&vs, &vl)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_causality() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (1, 32), &device)?;
        let mask = Tensor::ones((1, 4), DType::U8, &device)?;
        let a = Tensor::new(&[[1u32, 2, 3, 4]], &device)?;
        let b = Tensor::new(&[[1u32, 2, 3, 17]], &device)?;

        let ha = model.hidden_states(&obs, &a, &mask)?.narrow(1, 0, 3)?;
        let hb = model.hidden_states(&obs, &b, &mask)?.narrow(1, 0, 3)?;
        assert!(max_abs_diff(&ha, &hb)? < 1e-5, "earlier positions saw a later token");
        Ok(())
    }

    #[test]
    fn test_observation_broadcast_and_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let ids = Tensor::new(&[[1u32, 2], [1, 3], [1, 4]], &device)?;
        let mask = Tensor::ones((3, 2), DType::U8, &device)?;

        let one = Tensor::randn(0f32, 1.0, (1, 32), &device)?;
        let (logits, value) = model.forward(&one, &ids, &mask)?;
        assert_eq!(logits.dims2()?, (3, V));
        assert_eq!(value.dims1()?, 3);

        let two = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let err = model.forward(&two, &ids, &mask).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZeroError>(),
            Some(ZeroError::BatchMismatch { got: 2, expected: 3, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_empty_row_rejected() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let ids = Tensor::zeros((2, 3), DType::U32, &device)?;
        let mask = Tensor::new(&[[1u8, 0, 0], [0, 0, 0]], &device)?;
        let err = model.forward(&obs, &ids, &mask).unwrap_err();
        assert_eq!(err.downcast_ref::<ZeroError>(), Some(&ZeroError::EmptySequence { row: 1 }));
        Ok(())
    }

    #[test]
    fn test_too_many_positions() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (1, 32), &device)?;
        let ids = Tensor::zeros((1, 65), DType::U32, &device)?;
        let mask = Tensor::ones((1, 65), DType::U8, &device)?;
        assert!(is_length_exceeded(&model.forward(&obs, &ids, &mask).unwrap_err()));
        Ok(())
    }

    #[test]
    fn test_layer_norm_normalizes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = GradLayerNorm::new(8, 1e-5, vb.pp("ln"))?;
        let x = Tensor::randn(3f32, 2.0, (2, 8), &device)?;
        let y = norm.forward(&x)?;
        for row in y.to_vec2::<f32>()? {
            let mean: f32 = row.iter().sum::<f32>() / 8.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-4, "mean {mean}");
            assert!((var - 1.0).abs() < 1e-2, "var {var}");
        }
        Ok(())
    }

    #[test]
    fn test_dropout_only_on_training_path() -> Result<()> {
        let device = Device::Cpu;
        let (model, _vm) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [1, 5, 6, 0]], &device)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 1, 0]], &device)?;

        let (eval_a, val_a) = model.forward_sequence(&obs, &ids, &mask, false)?;
        let (eval_b, val_b) = model.forward_sequence(&obs, &ids, &mask, false)?;
        assert_eq!(max_abs_diff(&eval_a, &eval_b)?, 0.0);
        assert_eq!(max_abs_diff(&val_a, &val_b)?, 0.0);

        let (train, _) = model.forward_sequence(&obs, &ids, &mask, true)?;
        assert!(max_abs_diff(&eval_a, &train)? > 1e-6, "training pass should drop activations");

        let (logits, _) = model.forward(&obs, &ids, &mask)?;
        let (again, _) = model.forward(&obs, &ids, &mask)?;
        assert_eq!(max_abs_diff(&logits, &again)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = ScorerConfig::tiny(V);
        assert!(cfg.validate().is_ok());
        cfg.dropout = 1.0;
        assert!(cfg.validate().is_err());
        cfg.dropout = 0.1;
        cfg.n_heads = 5;
        assert!(cfg.validate().is_err());
        assert!(ScorerConfig::base(V).validate().is_ok());
    }

    #[test]
    fn test_backward_no_explosion() -> Result<()> {
        let device = Device::Cpu;
        let (model, varmap) = tiny_model(&device)?;
        let obs = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 0], [1, 4, 5, 6]], &device)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 1, 1]], &device)?;
        let (logits, value) = model.forward(&obs, &ids, &mask)?;
        let loss = (logits.sqr()?.mean_all()? + value.sqr()?.mean_all()?)?;
        let grads = loss.backward()?;

        for var in varmap.all_vars() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let max_val = g.abs()?.max_all()?.to_scalar::<f32>()?;
                assert!(max_val.is_finite(), "non-finite gradient detected");
                assert!(max_val < 1e4, "gradient explosion: max grad = {max_val}");
            }
        }
        Ok(())
    }
}

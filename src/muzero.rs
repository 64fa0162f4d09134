// MuZero planning interface over the SELFIES scorer.
//
// Latent state is the decoder prefix itself ([sos] + generated tokens). The
// dynamics function appends the action token; prediction is one scorer pass.
// Reward is always zero: molecule generation has no intermediate signal.

use std::str::FromStr;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decoder::step_prediction;
use crate::error::ZeroError;
use crate::tokenizer::{pad_prefix_tensor, SelfiesTokenizer, DEFAULT_MAX_LEN};
use crate::transformer::{ScorerConfig, SelfiesScorer};

// ---------------------------------------------------------------------------
// Planner contract
// ---------------------------------------------------------------------------

/// One inference result. Shapes: value/reward `[B,1]`, policy_logits `[B,V]`,
/// latent_state `[B,H]` u32.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub value: Tensor,
    pub reward: Tensor,
    pub policy_logits: Tensor,
    pub latent_state: Tensor,
}

/// The network interface an MCTS planner drives.
pub trait MuZeroNetwork {
    /// Root a search at a real observation.
    fn initial_inference(&mut self, observation: &Tensor, prefix: &Tensor) -> Result<NetworkOutput>;

    /// Expand a node by one hypothetical action.
    fn recurrent_inference(&self, latent_state: &Tensor, action: &Tensor) -> Result<NetworkOutput>;

    fn action_space_size(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelfiesZeroConfig {
    pub observation_dim: usize,
    pub max_len: usize,
    pub d_model: usize,
    pub n_enc: usize,
    pub n_dec: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub max_positions: usize,
    /// Training-time dropout; absent in older config.json files.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_dropout() -> f32 {
    0.1
}

impl SelfiesZeroConfig {
    pub fn base() -> Self {
        Self {
            observation_dim: 4096,
            max_len: DEFAULT_MAX_LEN,
            d_model: 512,
            n_enc: 4,
            n_dec: 6,
            n_heads: 8,
            d_ff: 2048,
            max_positions: 1024,
            dropout: default_dropout(),
        }
    }

    pub fn tiny() -> Self {
        Self {
            observation_dim: 32,
            max_len: 8,
            d_model: 32,
            n_enc: 1,
            n_dec: 2,
            n_heads: 4,
            d_ff: 64,
            max_positions: 64,
            dropout: default_dropout(),
        }
    }

    pub fn scorer_config(&self, vocab_size: usize) -> ScorerConfig {
        ScorerConfig {
            observation_dim: self.observation_dim,
            vocab_size,
            d_model: self.d_model,
            n_enc: self.n_enc,
            n_dec: self.n_dec,
            n_heads: self.n_heads,
            d_ff: self.d_ff,
            max_positions: self.max_positions,
            layer_norm_eps: 1e-5,
            dropout: self.dropout,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_len < 2 {
            return Err(ZeroError::InvalidConfig(format!(
                "max_len {} cannot hold <s> plus one token",
                self.max_len
            ))
            .into());
        }
        if self.max_len > self.max_positions {
            return Err(ZeroError::InvalidConfig(format!(
                "max_len {} exceeds positional table {}",
                self.max_len, self.max_positions
            ))
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shape helpers
// ---------------------------------------------------------------------------

/// `[D]` -> `[1,D]`; `[B,D]` unchanged.
pub fn normalize_observation(observation: &Tensor, device: &Device) -> Result<Tensor> {
    let obs = match observation.rank() {
        1 => observation.unsqueeze(0)?,
        2 => observation.clone(),
        r => bail!("observation must be [D] or [B,D], got rank {r}"),
    };
    Ok(obs.to_device(device)?.to_dtype(DType::F32)?)
}

/// `[H]` -> `[1,H]`; `[B,H]` unchanged; always u32.
pub fn normalize_prefix(prefix: &Tensor, device: &Device) -> Result<Tensor> {
    let p = match prefix.rank() {
        1 => prefix.unsqueeze(0)?,
        2 => prefix.clone(),
        r => bail!("prefix must be [H] or [B,H], got rank {r}"),
    };
    Ok(p.to_device(device)?.to_dtype(DType::U32)?)
}

/// Action as a `[B,1]` column: accepts a scalar, `[B]` or `[B,1]`.
pub fn normalize_action(action: &Tensor, device: &Device) -> Result<Tensor> {
    let a = match action.rank() {
        0 => action.reshape((1, 1))?,
        1 => action.unsqueeze(1)?,
        2 => action.clone(),
        r => bail!("action must be scalar, [B] or [B,1], got rank {r}"),
    };
    Ok(a.to_device(device)?.to_dtype(DType::U32)?)
}

/// A single id row `[1,H]`.
pub fn ids_to_row(ids: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_vec(ids.to_vec(), (1, ids.len()), device).map_err(Into::into)
}

fn broadcast_rows(t: &Tensor, batch: usize, what: &'static str) -> Result<Tensor> {
    let (rows, cols) = t.dims2()?;
    if rows == batch || (rows == 1 && cols == 0) {
        Ok(t.clone())
    } else if rows == 1 {
        Ok(t.broadcast_as((batch, cols))?.contiguous()?)
    } else {
        Err(ZeroError::BatchMismatch { what, got: rows, expected: batch }.into())
    }
}

// ---------------------------------------------------------------------------
// SelfiesZeroModel
// ---------------------------------------------------------------------------

pub struct SelfiesZeroModel {
    pub config: SelfiesZeroConfig,
    tok: SelfiesTokenizer,
    scorer: SelfiesScorer,
    varmap: VarMap,
    device: Device,
    cached_observation: Option<Tensor>,
}

impl SelfiesZeroModel {
    pub fn new(config: SelfiesZeroConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let tok = SelfiesTokenizer::new(config.max_len);
        let varmap = VarMap::new();
        let scorer = SelfiesScorer::new(config.scorer_config(tok.vocab_size()), &varmap, device)?;
        info!(
            vocab = tok.vocab_size(),
            max_len = config.max_len,
            d_model = config.d_model,
            "built SELFIES MuZero model"
        );
        Ok(Self {
            config,
            tok,
            scorer,
            varmap,
            device: device.clone(),
            cached_observation: None,
        })
    }

    pub fn tokenizer(&self) -> &SelfiesTokenizer {
        &self.tok
    }

    pub fn scorer(&self) -> &SelfiesScorer {
        &self.scorer
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_initialized(&self) -> bool {
        self.cached_observation.is_some()
    }

    pub fn cached_observation(&self) -> Option<&Tensor> {
        self.cached_observation.as_ref()
    }

    /// Episode boundary: drop the cached observation.
    pub fn reset(&mut self) {
        self.cached_observation = None;
    }

    /// Initial inference with the observation passed explicitly. Touches no
    /// instance state, so concurrent episodes can share one model.
    ///
    /// The prefix of row 0 is scored once and the result broadcast to every
    /// observation row. The returned latent state is `[sos] + prefix` per row.
    pub fn initial_inference_with(&self, observation: &Tensor, prefix: &Tensor) -> Result<NetworkOutput> {
        let obs = normalize_observation(observation, &self.device)?;
        let batch = obs.dim(0)?;
        let prefix = broadcast_rows(&normalize_prefix(prefix, &self.device)?, batch, "prefix")?;
        let first: Vec<u32> = prefix.get(0)?.to_vec1()?;

        let pred = step_prediction(&self.scorer, &self.tok, &obs, Some(&first))?;
        let vocab = self.tok.vocab_size();

        let value = pred.value.reshape((1, 1))?.broadcast_as((batch, 1))?.contiguous()?;
        let reward = Tensor::zeros((batch, 1), DType::F32, &self.device)?;
        let policy_logits = pred.logits.unsqueeze(0)?.broadcast_as((batch, vocab))?.contiguous()?;
        let sos = Tensor::full(self.tok.sos_id(), (batch, 1), &self.device)?;
        let latent_state = if first.is_empty() {
            sos
        } else {
            Tensor::cat(&[&sos, &prefix], 1)?
        };
        debug!(batch, prefix_len = first.len(), "initial inference");

        Ok(NetworkOutput { value, reward, policy_logits, latent_state })
    }

    /// Recurrent inference with the observation passed explicitly.
    pub fn recurrent_inference_with(
        &self,
        observation: &Tensor,
        latent_state: &Tensor,
        action: &Tensor,
    ) -> Result<NetworkOutput> {
        let latent = normalize_prefix(latent_state, &self.device)?;
        let batch = latent.dim(0)?;
        let action = normalize_action(action, &self.device)?;
        let (action_rows, _) = action.dims2()?;
        if action_rows != batch {
            return Err(ZeroError::BatchMismatch { what: "action", got: action_rows, expected: batch }.into());
        }

        let (next_latent, reward) = self.dynamics(&latent, &action)?;
        let (ids, mask) = pad_prefix_tensor(&next_latent, self.tok.max_len(), self.tok.pad_id())?;

        let obs = normalize_observation(observation, &self.device)?;
        let (policy_logits, value) = self.scorer.forward(&obs, &ids, &mask)?;
        let value = value.unsqueeze(1)?;
        debug!(batch, latent_len = next_latent.dim(1)?, "recurrent inference");

        Ok(NetworkOutput { value, reward, policy_logits, latent_state: next_latent })
    }

    /// Append the action token; reward is zero.
    fn dynamics(&self, latent: &Tensor, action: &Tensor) -> Result<(Tensor, Tensor)> {
        let next = Tensor::cat(&[latent, action], 1)?;
        let reward = Tensor::zeros((latent.dim(0)?, 1), DType::F32, &self.device)?;
        Ok((next, reward))
    }
}

impl MuZeroNetwork for SelfiesZeroModel {
    fn initial_inference(&mut self, observation: &Tensor, prefix: &Tensor) -> Result<NetworkOutput> {
        let obs = normalize_observation(observation, &self.device)?;
        self.cached_observation = Some(obs.clone());
        self.initial_inference_with(&obs, prefix)
    }

    fn recurrent_inference(&self, latent_state: &Tensor, action: &Tensor) -> Result<NetworkOutput> {
        let obs = self
            .cached_observation
            .as_ref()
            .ok_or(ZeroError::NotInitialized)?;
        self.recurrent_inference_with(obs, latent_state, action)
    }

    fn action_space_size(&self) -> usize {
        self.tok.vocab_size()
    }
}

// ---------------------------------------------------------------------------
// Model factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    MuZeroSelfiesTransformer,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MuZeroSelfiesTransformer => "MuZeroSelfiesTransformer",
        }
    }

    pub fn build(&self, config: &SelfiesZeroConfig, device: &Device) -> Result<Box<dyn MuZeroNetwork>> {
        match self {
            Self::MuZeroSelfiesTransformer => Ok(Box::new(SelfiesZeroModel::new(config.clone(), device)?)),
        }
    }
}

impl FromStr for ModelKind {
    type Err = ZeroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MuZeroSelfiesTransformer" => Ok(Self::MuZeroSelfiesTransformer),
            other => Err(ZeroError::InvalidConfig(format!("unknown model type {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_length_exceeded;

    fn tiny() -> Result<(SelfiesZeroModel, Tensor)> {
        let device = Device::Cpu;
        let model = SelfiesZeroModel::new(SelfiesZeroConfig::tiny(), &device)?;
        let obs = Tensor::randn(0f32, 1.0, 32, &device)?;
        Ok((model, obs))
    }

    fn empty_prefix() -> Result<Tensor> {
        Ok(Tensor::zeros((1, 0), DType::U32, &Device::Cpu)?)
    }

    #[test]
    fn test_recurrent_before_initial_fails() -> Result<()> {
        let (model, _obs) = tiny()?;
        let latent = ids_to_row(&[model.tokenizer().sos_id()], &Device::Cpu)?;
        let action = Tensor::new(&[5u32], &Device::Cpu)?;
        let err = model.recurrent_inference(&latent, &action).unwrap_err();
        assert_eq!(err.downcast_ref::<ZeroError>(), Some(&ZeroError::NotInitialized));
        Ok(())
    }

    #[test]
    fn test_initial_then_recurrent_scenario() -> Result<()> {
        let (mut model, obs) = tiny()?;
        let sos = model.tokenizer().sos_id();

        let root = model.initial_inference(&obs, &empty_prefix()?)?;
        assert_eq!(root.latent_state.to_vec2::<u32>()?, vec![vec![sos]]);

        let action = Tensor::new(&[5u32], &Device::Cpu)?;
        let child = model.recurrent_inference(&root.latent_state, &action)?;
        assert_eq!(child.latent_state.to_vec2::<u32>()?, vec![vec![sos, 5]]);
        Ok(())
    }

    #[test]
    fn test_output_shapes_and_zero_reward() -> Result<()> {
        let (mut model, _obs) = tiny()?;
        let vocab = model.action_space_size();
        let obs = Tensor::randn(0f32, 1.0, (3, 32), &Device::Cpu)?;
        let prefix = ids_to_row(&[model.tokenizer().id("[C]")], &Device::Cpu)?;

        let root = model.initial_inference(&obs, &prefix)?;
        assert_eq!(root.value.dims2()?, (3, 1));
        assert_eq!(root.reward.dims2()?, (3, 1));
        assert_eq!(root.policy_logits.dims2()?, (3, vocab));
        assert_eq!(root.latent_state.dims2()?, (3, 2));
        assert!(root.reward.to_vec2::<f32>()?.iter().flatten().all(|&r| r == 0.0));

        let action = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
        let child = model.recurrent_inference(&root.latent_state, &action)?;
        assert_eq!(child.value.dims2()?, (3, 1));
        assert_eq!(child.reward.dims2()?, (3, 1));
        assert_eq!(child.policy_logits.dims2()?, (3, vocab));
        assert_eq!(child.latent_state.dims2()?, (3, 3));
        assert!(child.reward.to_vec2::<f32>()?.iter().flatten().all(|&r| r == 0.0));
        Ok(())
    }

    #[test]
    fn test_initial_broadcasts_single_row() -> Result<()> {
        let (mut model, _obs) = tiny()?;
        let obs = Tensor::randn(0f32, 1.0, (2, 32), &Device::Cpu)?;
        let root = model.initial_inference(&obs, &empty_prefix()?)?;
        let rows = root.policy_logits.to_vec2::<f32>()?;
        assert_eq!(rows[0], rows[1]);
        let values = root.value.to_vec2::<f32>()?;
        assert_eq!(values[0], values[1]);
        Ok(())
    }

    #[test]
    fn test_recurrent_steps_compose() -> Result<()> {
        let (mut model, obs) = tiny()?;
        let sos = model.tokenizer().sos_id();
        let mut out = model.initial_inference(&obs, &empty_prefix()?)?;
        let actions = [4u32, 9, 2, 7];
        for &a in &actions {
            let before = out.latent_state.dim(1)?;
            out = model.recurrent_inference(&out.latent_state, &Tensor::new(&[[a]], &Device::Cpu)?)?;
            assert_eq!(out.latent_state.dim(1)?, before + 1);
        }
        let mut expected = vec![sos];
        expected.extend_from_slice(&actions);
        assert_eq!(out.latent_state.to_vec2::<u32>()?, vec![expected]);
        Ok(())
    }

    #[test]
    fn test_recurrent_length_exceeded() -> Result<()> {
        let (mut model, obs) = tiny()?;
        model.initial_inference(&obs, &empty_prefix()?)?;
        // max_len 8: a full latent cannot take another token.
        let full = ids_to_row(&[model.tokenizer().sos_id(); 8], &Device::Cpu)?;
        let err = model
            .recurrent_inference(&full, &Tensor::new(&[3u32], &Device::Cpu)?)
            .unwrap_err();
        assert!(is_length_exceeded(&err));

        let almost = ids_to_row(&[model.tokenizer().sos_id(); 7], &Device::Cpu)?;
        assert!(model.recurrent_inference(&almost, &Tensor::new(&[3u32], &Device::Cpu)?).is_ok());
        Ok(())
    }

    #[test]
    fn test_reset_clears_cache() -> Result<()> {
        let (mut model, obs) = tiny()?;
        model.initial_inference(&obs, &empty_prefix()?)?;
        assert!(model.is_initialized());
        model.reset();
        assert!(!model.is_initialized());
        let latent = ids_to_row(&[model.tokenizer().sos_id()], &Device::Cpu)?;
        assert!(model.recurrent_inference(&latent, &Tensor::new(&[1u32], &Device::Cpu)?).is_err());
        Ok(())
    }

    #[test]
    fn test_explicit_matches_cached() -> Result<()> {
        let (mut model, obs) = tiny()?;
        let root = model.initial_inference(&obs, &empty_prefix()?)?;
        let action = Tensor::new(&[6u32], &Device::Cpu)?;
        let cached = model.recurrent_inference(&root.latent_state, &action)?;
        let explicit = model.recurrent_inference_with(&obs, &root.latent_state, &action)?;
        assert_eq!(
            cached.policy_logits.to_vec2::<f32>()?,
            explicit.policy_logits.to_vec2::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_action_batch_mismatch() -> Result<()> {
        let (mut model, obs) = tiny()?;
        let root = model.initial_inference(&obs, &empty_prefix()?)?;
        let err = model
            .recurrent_inference(&root.latent_state, &Tensor::new(&[1u32, 2], &Device::Cpu)?)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZeroError>(),
            Some(ZeroError::BatchMismatch { what: "action", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = SelfiesZeroConfig::tiny();
        cfg.max_len = 100;
        assert!(SelfiesZeroModel::new(cfg, &Device::Cpu).is_err());
    }

    #[test]
    fn test_initial_prefix_rows_must_match_observation() -> Result<()> {
        let (mut model, obs) = tiny()?;
        let c = model.tokenizer().id("[C]");
        let prefix = Tensor::new(&[[c], [c], [c]], &Device::Cpu)?;

        let err = model.initial_inference(&obs, &prefix).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ZeroError>(),
            Some(&ZeroError::BatchMismatch { what: "prefix", got: 3, expected: 1 })
        );

        // A single-row prefix still serves every observation row.
        let batch = Tensor::randn(0f32, 1.0, (3, 32), &Device::Cpu)?;
        let out = model.initial_inference(&batch, &ids_to_row(&[c], &Device::Cpu)?)?;
        assert_eq!(out.latent_state.dims2()?, (3, 2));
        Ok(())
    }

    #[test]
    fn test_config_without_dropout_key_loads() -> Result<()> {
        let mut json = serde_json::to_value(SelfiesZeroConfig::tiny())?;
        if let Some(map) = json.as_object_mut() {
            map.remove("dropout");
        }
        let cfg: SelfiesZeroConfig = serde_json::from_value(json)?;
        assert_eq!(cfg, SelfiesZeroConfig::tiny());
        assert_eq!(cfg.scorer_config(10).dropout, cfg.dropout);
        Ok(())
    }

    #[test]
    fn test_model_kind_factory() -> Result<()> {
        let kind: ModelKind = "MuZeroSelfiesTransformer".parse()?;
        assert_eq!(kind.name(), "MuZeroSelfiesTransformer");
        assert!("MuZeroResNet".parse::<ModelKind>().is_err());

        let mut net = kind.build(&SelfiesZeroConfig::tiny(), &Device::Cpu)?;
        let obs = Tensor::randn(0f32, 1.0, 32, &Device::Cpu)?;
        let out = net.initial_inference(&obs, &empty_prefix()?)?;
        assert_eq!(out.policy_logits.dim(1)?, net.action_space_size());
        Ok(())
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ZeroError;
use crate::muzero::{SelfiesZeroConfig, SelfiesZeroModel};
use crate::tokenizer::{pad_batch, SelfiesTokenizer, VocabManifest};
use crate::transformer::SelfiesScorer;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const VOCAB_FILE: &str = "vocab.json";
pub const CONFIG_FILE: &str = "config.json";

// ---------------------------------------------------------------------------
// Cosine LR Scheduler with Linear Warmup
// ---------------------------------------------------------------------------

pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            return self.base_lr * (self.current_step as f64 + 1.0) / self.warmup_steps as f64;
        }
        let span = (self.total_steps - self.warmup_steps.min(self.total_steps)).max(1) as f64;
        let progress = ((self.current_step - self.warmup_steps) as f64 / span).min(1.0);
        self.min_lr
            + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_fraction: f64,
    pub total_steps: usize,
    pub batch_size: usize,
    /// Global L2 cap on the gradient; 0 disables clipping.
    pub max_grad_norm: f64,
    /// Weight of the value MSE relative to the next-token loss.
    pub value_weight: f64,
    pub label_smoothing: f64,
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            min_lr: 1e-5,
            weight_decay: 0.01,
            warmup_fraction: 0.1,
            total_steps: 1000,
            batch_size: 32,
            max_grad_norm: 1.0,
            value_weight: 1.0,
            label_smoothing: 0.0,
            log_every: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
    optimizer: AdamW,
    scheduler: CosineScheduler,
    vars: Vec<Var>,
    max_grad_norm: f64,
    last_grad_norm: f64,
    step_count: usize,
}

impl Trainer {
    pub fn new(varmap: &VarMap, config: &TrainingConfig) -> Result<Self> {
        let warmup_steps = (config.total_steps as f64 * config.warmup_fraction) as usize;
        let scheduler =
            CosineScheduler::new(config.lr, config.min_lr, warmup_steps, config.total_steps);
        let params = ParamsAdamW {
            lr: scheduler.get_lr(),
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let vars = varmap.all_vars();
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            scheduler,
            vars,
            max_grad_norm: config.max_grad_norm,
            last_grad_norm: 0.0,
            step_count: 0,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        let mut grads = loss.backward()?;
        self.last_grad_norm = clip_grad_norm(&mut grads, &self.vars, self.max_grad_norm)?;
        self.optimizer.step(&grads)?;
        self.step_count += 1;
        self.scheduler.step();
        self.optimizer.set_learning_rate(self.scheduler.get_lr());
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }

    /// Gradient norm of the last step, before clipping.
    pub fn last_grad_norm(&self) -> f64 {
        self.last_grad_norm
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before scaling. `max_norm <= 0` leaves them untouched.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq_sum += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sq_sum.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

// ---------------------------------------------------------------------------
// Losses
// ---------------------------------------------------------------------------

/// Cross-entropy with optional label smoothing and per-position weights.
/// logits: (batch, seq, vocab), targets: (batch, seq), weights: optional (batch, seq)
pub fn weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    label_smoothing: f64,
    weights: Option<&Tensor>,
) -> Result<Tensor> {
    let (b, s, v) = logits.dims3()?;
    let logits_flat = logits.reshape((b * s, v))?;
    let targets_flat = targets.reshape(b * s)?.to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits_flat, 1)?;
    let one_hot = one_hot_tensor(&targets_flat, v, logits.device())?;
    let target_dist = if label_smoothing > 0.0 {
        ((one_hot * (1.0 - label_smoothing))? + (label_smoothing / v as f64))?
    } else {
        one_hot
    };
    let per_pos = (target_dist * log_probs)?.sum(1)?.neg()?;

    match weights {
        Some(w) => {
            let w_flat = w.reshape(b * s)?.to_dtype(DType::F32)?;
            let weighted = (per_pos * &w_flat)?;
            let denom = w_flat.sum_all()?;
            Ok(weighted.sum_all()?.div(&denom)?)
        }
        None => per_pos.mean_all().map_err(Into::into),
    }
}

pub fn one_hot_tensor(indices: &Tensor, num_classes: usize, device: &Device) -> Result<Tensor> {
    let indices_vec: Vec<u32> = indices.to_vec1()?;
    let n = indices_vec.len();
    let mut data = vec![0.0f32; n * num_classes];
    for (i, &idx) in indices_vec.iter().enumerate() {
        let idx = idx as usize;
        if idx < num_classes {
            data[i * num_classes + idx] = 1.0;
        }
    }
    Tensor::from_vec(data, (n, num_classes), device).map_err(Into::into)
}

#[derive(Debug, Clone, Copy)]
pub struct LossBreakdown {
    pub total: f32,
    pub policy: f32,
    pub value: f32,
}

/// Teacher-forced loss: position i predicts token i+1 (weighted by the
/// target's validity bit), plus value MSE at the last valid input position.
pub fn sequence_loss(
    scorer: &SelfiesScorer,
    observation: &Tensor,
    ids: &Tensor,
    mask: &Tensor,
    value_targets: &Tensor,
    config: &TrainingConfig,
) -> Result<(Tensor, LossBreakdown)> {
    let (_b, t) = ids.dims2()?;
    if t < 2 {
        bail!("teacher forcing needs at least two positions, got {t}");
    }
    let input = ids.narrow(1, 0, t - 1)?;
    let input_mask = mask.narrow(1, 0, t - 1)?;
    let targets = ids.narrow(1, 1, t - 1)?;
    let target_weights = mask.narrow(1, 1, t - 1)?.to_dtype(DType::F32)?;

    let (logits, value) = scorer.forward_sequence(observation, &input, &input_mask, true)?;
    let policy = weighted_cross_entropy(&logits, &targets, config.label_smoothing, Some(&target_weights))?;
    let value_targets = value_targets.to_device(value.device())?.to_dtype(DType::F32)?;
    let value_loss = (value - value_targets)?.sqr()?.mean_all()?;
    let total = (&policy + (&value_loss * config.value_weight)?)?;

    let breakdown = LossBreakdown {
        total: total.to_scalar::<f32>()?,
        policy: policy.to_scalar::<f32>()?,
        value: value_loss.to_scalar::<f32>()?,
    };
    Ok((total, breakdown))
}

// ---------------------------------------------------------------------------
// Supervised data
// ---------------------------------------------------------------------------

/// One (spectrum, molecule, value) training example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub spectrum: Vec<f32>,
    pub selfies: String,
    pub value: f32,
}

/// Stack examples into `(obs [B,D], ids [B,T], mask [B,T], values [B])`.
pub fn make_batch(
    tok: &SelfiesTokenizer,
    examples: &[TrainingExample],
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let b = examples.len();
    let dim = examples.first().map(|e| e.spectrum.len()).unwrap_or(0);
    let mut spectra = Vec::with_capacity(b * dim);
    let mut rows = Vec::with_capacity(b);
    let mut values = Vec::with_capacity(b);
    for ex in examples {
        if ex.spectrum.len() != dim {
            return Err(ZeroError::InvalidConfig(format!(
                "spectrum length {} != {dim}",
                ex.spectrum.len()
            ))
            .into());
        }
        spectra.extend_from_slice(&ex.spectrum);
        rows.push(tok.encode_unpadded(&ex.selfies)?);
        values.push(ex.value);
    }
    let obs = Tensor::from_vec(spectra, (b, dim), device)?;
    let (ids, mask) = pad_batch(&rows, tok.max_len(), tok.pad_id(), device)?;
    let values = Tensor::from_vec(values, b, device)?;
    Ok((obs, ids, mask, values))
}

/// Supervised pre-training of the scorer. Returns the per-step total loss.
pub fn train_supervised(
    model: &SelfiesZeroModel,
    examples: &[TrainingExample],
    config: &TrainingConfig,
) -> Result<Vec<f32>> {
    if examples.is_empty() {
        return Err(anyhow!("no training examples"));
    }
    let batch_size = config.batch_size.clamp(1, examples.len());
    let batches = examples
        .chunks(batch_size)
        .map(|chunk| make_batch(model.tokenizer(), chunk, model.device()))
        .collect::<Result<Vec<_>>>()?;

    let mut trainer = Trainer::new(model.varmap(), config)?;
    info!(
        examples = examples.len(),
        batch_size,
        steps = config.total_steps,
        lr = config.lr,
        "supervised training"
    );

    let mut losses = Vec::with_capacity(config.total_steps);
    for step in 0..config.total_steps {
        let (obs, ids, mask, values) = &batches[step % batches.len()];
        let (loss, parts) = sequence_loss(model.scorer(), obs, ids, mask, values, config)?;
        trainer.backward_step(&loss)?;
        losses.push(parts.total);

        if config.log_every > 0 && (step % config.log_every == 0 || step + 1 == config.total_steps) {
            info!(
                step,
                total = parts.total,
                policy = parts.policy,
                value = parts.value,
                lr = trainer.current_lr(),
                grad_norm = trainer.last_grad_norm(),
                "train step"
            );
        }
    }
    Ok(losses)
}

// ---------------------------------------------------------------------------
// Model Checkpointing (safetensors + vocabulary manifest)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(model: &SelfiesZeroModel, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let named: HashMap<String, Tensor> = {
        let data = model
            .varmap()
            .data()
            .lock()
            .map_err(|_| anyhow!("varmap lock poisoned"))?;
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };
    candle_core::safetensors::save(&named, dir.join(WEIGHTS_FILE))?;
    fs::write(dir.join(VOCAB_FILE), serde_json::to_string_pretty(&model.tokenizer().manifest())?)?;
    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&model.config)?)?;
    info!(params = named.len(), dir = %dir.display(), "saved checkpoint");
    Ok(())
}

/// Rebuild a model from a checkpoint directory. The persisted vocabulary must
/// match the one this build produces.
pub fn load_checkpoint(dir: &Path, device: &Device) -> Result<SelfiesZeroModel> {
    let config: SelfiesZeroConfig = serde_json::from_str(
        &fs::read_to_string(dir.join(CONFIG_FILE)).with_context(|| format!("reading {CONFIG_FILE}"))?,
    )?;
    let manifest: VocabManifest = serde_json::from_str(
        &fs::read_to_string(dir.join(VOCAB_FILE)).with_context(|| format!("reading {VOCAB_FILE}"))?,
    )?;
    let tok = SelfiesTokenizer::from_manifest(&manifest)?;
    if tok.max_len() != config.max_len {
        return Err(ZeroError::InvalidConfig(format!(
            "vocab max_len {} != model max_len {}",
            tok.max_len(),
            config.max_len
        ))
        .into());
    }

    let model = SelfiesZeroModel::new(config, device)?;
    let tensors = candle_core::safetensors::load(dir.join(WEIGHTS_FILE), device)?;
    let data = model
        .varmap()
        .data()
        .lock()
        .map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(saved) => {
                var.set(saved)?;
                loaded += 1;
            }
            None => warn!(param = %name, "missing from checkpoint, keeping init"),
        }
    }
    info!(loaded, total = data.len(), dir = %dir.display(), "loaded checkpoint");
    drop(data);
    Ok(model)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

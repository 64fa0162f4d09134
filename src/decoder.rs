// Step decoding over the scorer: one greedy step for search-node expansion,
// plus full greedy / temperature-sampled decoding for standalone generation.

use anyhow::Result;
use candle_core::{Tensor, D};
use rand::Rng;
use tracing::debug;

use crate::tokenizer::{pad_to_max_len, SelfiesTokenizer};
use crate::transformer::SelfiesScorer;

// ---------------------------------------------------------------------------
// Single step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepPrediction {
    /// Next-token logits `[V]`.
    pub logits: Tensor,
    /// Value estimate `[1]`.
    pub value: Tensor,
    pub probs: Vec<f32>,
    /// `[sos] + prefix`, the sequence that was scored.
    pub current_prefix: Vec<u32>,
    pub next_token_id: u32,
}

/// Reduce an observation to a single `[1,D]` row. Wider batches use row 0.
pub fn single_observation(observation: &Tensor) -> Result<Tensor> {
    let obs = match observation.rank() {
        1 => observation.unsqueeze(0)?,
        _ => observation.clone(),
    };
    if obs.dim(0)? > 1 {
        return obs.narrow(0, 0, 1).map_err(Into::into);
    }
    Ok(obs)
}

/// Score `[sos] + prefix` and pick the greedy next token. Deterministic.
pub fn step_prediction(
    model: &SelfiesScorer,
    tok: &SelfiesTokenizer,
    observation: &Tensor,
    prefix: Option<&[u32]>,
) -> Result<StepPrediction> {
    let obs = single_observation(observation)?;

    let mut current = vec![tok.sos_id()];
    if let Some(p) = prefix {
        current.extend_from_slice(p);
    }
    let padded = pad_to_max_len(&current, tok.max_len(), tok.pad_id())?;
    let (ids, mask) = padded.to_tensors(model.device())?;

    let (logits, value) = model.forward(&obs, &ids, &mask)?;
    let logits = logits.squeeze(0)?;
    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;
    let next_token_id = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
    debug!(prefix_len = current.len(), next_token_id, "step prediction");

    Ok(StepPrediction {
        logits,
        value,
        probs,
        current_prefix: current,
        next_token_id,
    })
}

// ---------------------------------------------------------------------------
// Full decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSequence {
    /// Generated ids, excluding `<s>` and the terminating token.
    pub ids: Vec<u32>,
    pub selfies: String,
    /// True if decoding stopped on `</s>` or `<END>` rather than a length bound.
    pub terminated: bool,
}

fn is_terminal(tok: &SelfiesTokenizer, id: u32) -> bool {
    id == tok.eos_id() || id == tok.end_id()
}

fn decode_with<F>(
    model: &SelfiesScorer,
    tok: &SelfiesTokenizer,
    observation: &Tensor,
    max_steps: usize,
    mut pick: F,
) -> Result<DecodedSequence>
where
    F: FnMut(&StepPrediction) -> u32,
{
    let mut ids: Vec<u32> = Vec::new();
    let mut terminated = false;
    for _ in 0..max_steps {
        // [sos] + ids + next + [eos] must fit, so the output always re-encodes.
        if ids.len() + 3 > tok.max_len() {
            break;
        }
        let pred = step_prediction(model, tok, observation, Some(&ids))?;
        let next = pick(&pred);
        if is_terminal(tok, next) {
            terminated = true;
            break;
        }
        ids.push(next);
    }
    let selfies = tok.decode(&ids);
    Ok(DecodedSequence { ids, selfies, terminated })
}

/// Greedy autoregressive decoding until a terminal token or the length bound.
pub fn greedy_decode(
    model: &SelfiesScorer,
    tok: &SelfiesTokenizer,
    observation: &Tensor,
    max_steps: usize,
) -> Result<DecodedSequence> {
    decode_with(model, tok, observation, max_steps, |p| p.next_token_id)
}

/// Temperature sampling over logit distribution.
pub fn sample_with_temperature<R: Rng + ?Sized>(logits: &[f32], temperature: f64, rng: &mut R) -> u32 {
    let temp = temperature.max(1e-6) as f32;
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    let exps: Vec<f32> = logits.iter().map(|&l| ((l - max_logit) / temp).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumulative = 0.0f32;
    for (i, &e) in exps.iter().enumerate() {
        cumulative += e;
        if r < cumulative {
            return i as u32;
        }
    }
    (exps.len() - 1) as u32
}

/// Sampled decoding for diverse candidates from one spectrum.
pub fn sample_decode<R: Rng + ?Sized>(
    model: &SelfiesScorer,
    tok: &SelfiesTokenizer,
    observation: &Tensor,
    max_steps: usize,
    temperature: f64,
    rng: &mut R,
) -> Result<DecodedSequence> {
    let mut failure = None;
    let out = decode_with(model, tok, observation, max_steps, |p| {
        match p.logits.to_vec1::<f32>() {
            Ok(logits) => sample_with_temperature(&logits, temperature, rng),
            Err(e) => {
                failure = Some(e);
                tok.eos_id()
            }
        }
    })?;
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(out),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

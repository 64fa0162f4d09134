// muzero-selfies binary
//
// Commands:
//   muzero-selfies vocab                       Print vocabulary summary
//   muzero-selfies encode <selfies>            Encode to padded ids + mask
//   muzero-selfies decode <id>...              Decode ids back to SELFIES
//   muzero-selfies infer [--tier T]            Random-input inference smoke test
//   muzero-selfies generate [--checkpoint D]   Greedy / sampled decoding from a spectrum
//   muzero-selfies train --data F --out D      Supervised pre-training + checkpoint
//   muzero-selfies config <validate|dump>      Experiment config tooling
//
// GPU: used when compiled with --features cuda and tier is not "tiny"

#![deny(unused_imports)]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muzero_selfies::config::ExperimentConfig;
use muzero_selfies::decoder::{greedy_decode, sample_decode};
use muzero_selfies::muzero::{ids_to_row, ModelKind};
use muzero_selfies::tokenizer::{pad_to_max_len, DEFAULT_MAX_LEN};
use muzero_selfies::training::{load_checkpoint, save_checkpoint, train_supervised, TrainingConfig, TrainingExample};
use muzero_selfies::{SelfiesTokenizer, SelfiesZeroConfig, SelfiesZeroModel};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// SELFIES generation with a MuZero-compatible transformer.
#[derive(Parser)]
#[command(name = "muzero-selfies", version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Tier {
    /// d=32, 32-dim spectra, max_len 8 (CPU)
    Tiny,
    /// d=512, 4096-dim spectra, max_len 128
    Base,
}

impl Tier {
    fn model_config(self) -> SelfiesZeroConfig {
        match self {
            Self::Tiny => SelfiesZeroConfig::tiny(),
            Self::Base => SelfiesZeroConfig::base(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print vocabulary size, special ids and checksum
    Vocab {
        #[arg(long, default_value_t = DEFAULT_MAX_LEN)]
        max_len: usize,
    },
    /// Encode a SELFIES string
    Encode {
        selfies: String,
        #[arg(long, default_value_t = DEFAULT_MAX_LEN)]
        max_len: usize,
    },
    /// Decode token ids
    Decode {
        #[arg(required = true)]
        ids: Vec<u32>,
    },
    /// Run initial + one recurrent inference on random inputs
    Infer {
        #[arg(long, value_enum, default_value_t = Tier::Tiny)]
        tier: Tier,
        /// Length of the random prefix
        #[arg(long, default_value_t = 5)]
        prefix_len: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Decode a molecule for one spectrum
    Generate {
        /// Checkpoint directory; a fresh model of --tier is used otherwise
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Tier::Tiny)]
        tier: Tier,
        /// JSON array of floats; random if omitted
        #[arg(long)]
        spectrum: Option<PathBuf>,
        /// Sample at this temperature instead of greedy decoding
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 256)]
        max_steps: usize,
    },
    /// Supervised pre-training from a JSON array of examples
    Train {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = Tier::Tiny)]
        tier: Tier,
        #[arg(long, default_value_t = 1000)]
        steps: usize,
        #[arg(long, default_value_t = 3e-4)]
        lr: f64,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
    /// Experiment config tooling
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate a YAML experiment config
    Validate { path: PathBuf },
    /// Print the default experiment config as YAML
    Dump,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Select device: CUDA if available and not tiny tier, else CPU.
fn select_device(tier: Tier) -> Device {
    if tier == Tier::Tiny {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    info!("using CUDA device 0");
                    return dev;
                }
                Err(e) => warn!(error = %e, "CUDA init failed, falling back to CPU"),
            }
        } else {
            info!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        warn!("built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");
    }

    Device::Cpu
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_vocab(max_len: usize) {
    let tok = SelfiesTokenizer::new(max_len);
    println!("vocab size : {}", tok.vocab_size());
    println!("max_len    : {}", tok.max_len());
    println!(
        "specials   : pad={} sos={} eos={} unk={} remove={} end={}",
        tok.pad_id(),
        tok.sos_id(),
        tok.eos_id(),
        tok.unk_id(),
        tok.remove_id(),
        tok.end_id()
    );
    println!("checksum   : {}", tok.checksum());
}

fn cmd_encode(selfies: &str, max_len: usize) -> Result<()> {
    let tok = SelfiesTokenizer::new(max_len);
    let ids = tok.encode_unpadded(selfies)?;
    let padded = pad_to_max_len(&ids, max_len, tok.pad_id())?;
    println!("ids  : {:?}", padded.ids);
    println!("mask : {:?}", padded.mask);
    Ok(())
}

fn cmd_decode(ids: &[u32]) -> Result<()> {
    let tok = SelfiesTokenizer::default();
    if let Some(bad) = ids.iter().find(|&&id| id as usize >= tok.vocab_size()) {
        bail!("id {bad} outside vocabulary of {}", tok.vocab_size());
    }
    println!("{}", tok.decode(ids));
    Ok(())
}

fn cmd_infer(tier: Tier, prefix_len: usize, seed: u64) -> Result<()> {
    let device = select_device(tier);
    let config = tier.model_config();
    let mut net = ModelKind::MuZeroSelfiesTransformer.build(&config, &device)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let prefix: Vec<u32> = (0..prefix_len).map(|_| rng.gen_range(0..10)).collect();
    let obs = Tensor::randn(0f32, 1.0, config.observation_dim, &device)?;

    let root = net.initial_inference(&obs, &ids_to_row(&prefix, &device)?)?;
    println!(
        "initial   value {:?} reward {:?} policy {:?} latent {:?}",
        root.value.dims(),
        root.reward.dims(),
        root.policy_logits.dims(),
        root.latent_state.dims()
    );
    let action = root.policy_logits.argmax(1)?;
    let child = net.recurrent_inference(&root.latent_state, &action)?;
    println!(
        "recurrent value {:?} reward {:?} policy {:?} latent {:?}",
        child.value.dims(),
        child.reward.dims(),
        child.policy_logits.dims(),
        child.latent_state.dims()
    );
    println!("latent ids {:?}", child.latent_state.to_vec2::<u32>()?);
    Ok(())
}

fn read_spectrum(path: &Path, dim: usize, device: &Device) -> Result<Tensor> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f32> = serde_json::from_str(&raw)?;
    if values.len() != dim {
        bail!("spectrum has {} values, model expects {dim}", values.len());
    }
    Ok(Tensor::from_vec(values, dim, device)?)
}

fn cmd_generate(
    checkpoint: Option<&Path>,
    tier: Tier,
    spectrum: Option<&Path>,
    temperature: Option<f64>,
    seed: u64,
    max_steps: usize,
) -> Result<()> {
    let device = select_device(tier);
    let model = match checkpoint {
        Some(dir) => load_checkpoint(dir, &device)?,
        None => {
            warn!("no checkpoint given, decoding with untrained weights");
            SelfiesZeroModel::new(tier.model_config(), &device)?
        }
    };
    let dim = model.config.observation_dim;
    let mut rng = StdRng::seed_from_u64(seed);
    let obs = match spectrum {
        Some(path) => read_spectrum(path, dim, &device)?,
        None => {
            let values: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>()).collect();
            Tensor::from_vec(values, dim, &device)?
        }
    };

    let out = match temperature {
        Some(t) => sample_decode(model.scorer(), model.tokenizer(), &obs, max_steps, t, &mut rng)?,
        None => greedy_decode(model.scorer(), model.tokenizer(), &obs, max_steps)?,
    };
    info!(tokens = out.ids.len(), terminated = out.terminated, "decoded");
    println!("{}", out.selfies);
    Ok(())
}

fn cmd_train(data: &Path, out: &Path, tier: Tier, steps: usize, lr: f64, batch_size: usize) -> Result<()> {
    let device = select_device(tier);
    let raw = std::fs::read_to_string(data).with_context(|| format!("reading {}", data.display()))?;
    let examples: Vec<TrainingExample> = serde_json::from_str(&raw)?;
    let model = SelfiesZeroModel::new(tier.model_config(), &device)?;

    let config = TrainingConfig {
        lr,
        total_steps: steps,
        batch_size,
        ..Default::default()
    };
    let losses = train_supervised(&model, &examples, &config)?;
    if let Some(last) = losses.last() {
        info!(final_loss = last, "training done");
    }
    save_checkpoint(&model, out)
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Validate { path } => {
            let cfg = ExperimentConfig::load(&path)?;
            println!("{}: ok ({})", cfg.exp_name, cfg.planner_contract());
        }
        ConfigAction::Dump => print!("{}", ExperimentConfig::default().to_yaml_string()?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Vocab { max_len } => {
            cmd_vocab(max_len);
            Ok(())
        }
        Commands::Encode { selfies, max_len } => cmd_encode(&selfies, max_len),
        Commands::Decode { ids } => cmd_decode(&ids),
        Commands::Infer { tier, prefix_len, seed } => cmd_infer(tier, prefix_len, seed),
        Commands::Generate {
            checkpoint,
            tier,
            spectrum,
            temperature,
            seed,
            max_steps,
        } => cmd_generate(checkpoint.as_deref(), tier, spectrum.as_deref(), temperature, seed, max_steps),
        Commands::Train {
            data,
            out,
            tier,
            steps,
            lr,
            batch_size,
        } => cmd_train(&data, &out, tier, steps, lr, batch_size),
        Commands::Config { action } => cmd_config(action),
    }
}

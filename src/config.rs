//! Typed experiment configuration for sampled AlphaZero self-play on tic-tac-toe.
//!
//! Every field has a default equal to the reference experiment, so an empty
//! YAML document yields a runnable config. Unknown keys are rejected.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleMode {
    #[default]
    SelfPlayMode,
    PlayWithBotMode,
    EvalMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum BotActionType {
    #[default]
    #[serde(rename = "v0")]
    V0,
    #[serde(rename = "alpha_beta_pruning")]
    AlphaBetaPruning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum PolicyLossType {
    #[default]
    #[serde(rename = "KL")]
    Kl,
    #[serde(rename = "cross_entropy")]
    CrossEntropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum OptimType {
    #[default]
    Adam,
    AdamW,
    #[serde(rename = "SGD")]
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvKind {
    #[default]
    Tictactoe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvManagerKind {
    #[default]
    Subprocess,
    Base,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    SampledAlphazero,
    Alphazero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    #[default]
    EpisodeAlphazero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    #[default]
    Alphazero,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Output directory name for logs and checkpoints. Derived from the
    /// search and update settings when left empty.
    #[serde(default)]
    pub exp_name: String,
    pub seed: u64,
    /// Stop after this many environment steps.
    pub max_env_step: u64,
    pub env: TicTacToeEnvConfig,
    pub policy: SampledAlphaZeroPolicyConfig,
    /// Which registered components assemble the pipeline.
    pub create: CreateConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let policy = SampledAlphaZeroPolicyConfig::default();
        Self {
            exp_name: derived_exp_name(&policy, 0),
            seed: 0,
            max_env_step: 200_000,
            env: TicTacToeEnvConfig::default(),
            policy,
            create: CreateConfig::default(),
        }
    }
}

/// Environment settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TicTacToeEnvConfig {
    pub board_size: usize,
    pub battle_mode: BattleMode,
    /// Opponent strategy when playing against a bot.
    pub bot_action_type: BotActionType,
    pub channel_last: bool,
    pub collector_env_num: usize,
    pub evaluator_env_num: usize,
    pub n_evaluator_episode: usize,
    pub manager: EnvManagerConfig,
    pub agent_vs_human: bool,
    pub prob_random_agent: f64,
    pub prob_expert_agent: f64,
    /// Scale observations to [0, 1].
    pub scale: bool,
    pub alphazero_mcts_ctree: bool,
    pub save_replay_gif: bool,
    pub replay_path_gif: String,
}

impl Default for TicTacToeEnvConfig {
    fn default() -> Self {
        Self {
            board_size: 3,
            battle_mode: BattleMode::SelfPlayMode,
            bot_action_type: BotActionType::V0,
            channel_last: false,
            collector_env_num: 8,
            evaluator_env_num: 5,
            n_evaluator_episode: 5,
            manager: EnvManagerConfig::default(),
            agent_vs_human: false,
            prob_random_agent: 0.0,
            prob_expert_agent: 0.0,
            scale: true,
            alphazero_mcts_ctree: false,
            save_replay_gif: false,
            replay_path_gif: "./replay_gif".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvManagerConfig {
    pub shared_memory: bool,
}

/// Policy and learner settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampledAlphaZeroPolicyConfig {
    /// Environment the search simulates internally.
    pub simulation_env_id: EnvKind,
    pub simulation_env_config_type: String,
    pub model: AzModelConfig,
    pub sampled_algo: bool,
    pub mcts_ctree: bool,
    pub policy_loss_type: PolicyLossType,
    pub cuda: bool,
    pub board_size: usize,
    /// Gradient updates per collection phase.
    pub update_per_collect: usize,
    pub batch_size: usize,
    pub optim_type: OptimType,
    pub piecewise_decay_lr_scheduler: bool,
    pub learning_rate: f64,
    pub grad_clip_value: f64,
    pub value_weight: f64,
    pub entropy_weight: f64,
    /// Episodes collected per collection phase.
    pub n_episode: usize,
    /// Evaluate every this many training iterations.
    pub eval_freq: usize,
    pub mcts: MctsConfig,
    pub collector_env_num: usize,
    pub evaluator_env_num: usize,
}

impl Default for SampledAlphaZeroPolicyConfig {
    fn default() -> Self {
        Self {
            simulation_env_id: EnvKind::Tictactoe,
            simulation_env_config_type: "self_play".to_string(),
            model: AzModelConfig::default(),
            sampled_algo: true,
            mcts_ctree: false,
            policy_loss_type: PolicyLossType::Kl,
            cuda: true,
            board_size: 3,
            update_per_collect: 50,
            batch_size: 256,
            optim_type: OptimType::Adam,
            piecewise_decay_lr_scheduler: false,
            learning_rate: 0.003,
            grad_clip_value: 0.5,
            value_weight: 1.0,
            entropy_weight: 0.0,
            n_episode: 8,
            eval_freq: 2000,
            mcts: MctsConfig::default(),
            collector_env_num: 8,
            evaluator_env_num: 5,
        }
    }
}

/// Small residual network used for the 3x3 board.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AzModelConfig {
    /// (channels, rows, cols)
    pub observation_shape: [usize; 3],
    pub action_space_size: usize,
    pub num_res_blocks: usize,
    pub num_channels: usize,
    pub value_head_hidden_channels: Vec<usize>,
    pub policy_head_hidden_channels: Vec<usize>,
}

impl Default for AzModelConfig {
    fn default() -> Self {
        Self {
            observation_shape: [3, 3, 3],
            action_space_size: 9,
            num_res_blocks: 1,
            num_channels: 16,
            value_head_hidden_channels: vec![8],
            policy_head_hidden_channels: vec![8],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MctsConfig {
    pub num_simulations: usize,
    /// Children sampled per expansion.
    pub num_of_sampled_actions: usize,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            num_simulations: 25,
            num_of_sampled_actions: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateConfig {
    pub env: EnvKind,
    pub env_manager: EnvManagerKind,
    pub policy: PolicyKind,
    pub collector: CollectorKind,
    pub evaluator: EvaluatorKind,
}

/// What the planner needs to know about the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerContract {
    pub observation_shape: [usize; 3],
    pub action_space_size: usize,
    pub num_simulations: usize,
    pub num_of_sampled_actions: usize,
}

impl fmt::Display for PlannerContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [c, h, w] = self.observation_shape;
        write!(
            f,
            "obs {c}x{h}x{w}, {} actions, {} simulations, {} sampled",
            self.action_space_size, self.num_simulations, self.num_of_sampled_actions
        )
    }
}

// ---------------------------------------------------------------------------
// Loading / validation
// ---------------------------------------------------------------------------

fn derived_exp_name(policy: &SampledAlphaZeroPolicyConfig, seed: u64) -> String {
    format!(
        "data_az_ctree/tictactoe_sampled_alphazero_sp-mode_na{}_ns{}_upc{}_seed{seed}",
        policy.mcts.num_of_sampled_actions, policy.mcts.num_simulations, policy.update_per_collect
    )
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl ExperimentConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut cfg: Self = serde_yaml::from_str(yaml)?;
        if cfg.exp_name.is_empty() {
            cfg.exp_name = derived_exp_name(&cfg.policy, cfg.seed);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let env = &self.env;
        let policy = &self.policy;
        let model = &policy.model;

        let counts = [
            ("env.board_size", env.board_size),
            ("env.collector_env_num", env.collector_env_num),
            ("env.evaluator_env_num", env.evaluator_env_num),
            ("env.n_evaluator_episode", env.n_evaluator_episode),
            ("policy.update_per_collect", policy.update_per_collect),
            ("policy.batch_size", policy.batch_size),
            ("policy.n_episode", policy.n_episode),
            ("policy.eval_freq", policy.eval_freq),
            ("policy.mcts.num_simulations", policy.mcts.num_simulations),
            ("policy.mcts.num_of_sampled_actions", policy.mcts.num_of_sampled_actions),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(format!("{name} must be positive")));
        }

        if policy.board_size != env.board_size {
            return Err(invalid(format!(
                "policy.board_size {} != env.board_size {}",
                policy.board_size, env.board_size
            )));
        }
        let cells = env.board_size * env.board_size;
        if model.action_space_size != cells {
            return Err(invalid(format!(
                "action_space_size {} != board_size^2 {cells}",
                model.action_space_size
            )));
        }
        let [_, h, w] = model.observation_shape;
        if h != env.board_size || w != env.board_size {
            return Err(invalid(format!(
                "observation_shape {:?} does not match a {}x{} board",
                model.observation_shape, env.board_size, env.board_size
            )));
        }
        if policy.mcts.num_of_sampled_actions > model.action_space_size {
            return Err(invalid(format!(
                "num_of_sampled_actions {} exceeds action space {}",
                policy.mcts.num_of_sampled_actions, model.action_space_size
            )));
        }
        if !(policy.learning_rate > 0.0) {
            return Err(invalid("policy.learning_rate must be > 0"));
        }
        if !(policy.grad_clip_value > 0.0) {
            return Err(invalid("policy.grad_clip_value must be > 0"));
        }
        for (name, p) in [
            ("env.prob_random_agent", env.prob_random_agent),
            ("env.prob_expert_agent", env.prob_expert_agent),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(format!("{name} must be in [0, 1], got {p}")));
            }
        }
        Ok(())
    }

    pub fn planner_contract(&self) -> PlannerContract {
        PlannerContract {
            observation_shape: self.policy.model.observation_shape,
            action_space_size: self.policy.model.action_space_size,
            num_simulations: self.policy.mcts.num_simulations,
            num_of_sampled_actions: self.policy.mcts.num_of_sampled_actions,
        }
    }
}

//! Expert entity and checkpoint consumption.
//!
//! An [`Expert`] is the unit of composition: an immutable bundle of a
//! configuration and a mapping of parameter names to tensors. Experts are
//! created by loading a checkpoint directory or by composing other experts
//! through the module graph.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config file name inside an expert checkpoint directory.
pub const CONFIG_FILE: &str = "expert_config.json";
/// Weights file name inside an expert checkpoint directory.
pub const WEIGHTS_FILE: &str = "expert_model.safetensors";

/// Errors that can occur while loading or resolving experts.
#[derive(Debug, Error)]
pub enum ExpertError {
    #[error("expert config not found at {0}")]
    ConfigNotFound(String),
    #[error("expert weights not found at {0}")]
    WeightsNotFound(String),
    #[error("failed to parse expert config: {0}")]
    ConfigParse(String),
    #[error("failed to load expert weights: {0}")]
    WeightsLoad(String),
    #[error("no expert named {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which adapter kind an expert's weights parameterize.
///
/// Unrecognized modifiers deserialize to [`ModelModifier::Unknown`] so that
/// the error surfaces when the expert is attached, with a message naming the
/// expert, rather than as a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelModifier {
    Lora,
    KvAdapter,
    #[serde(other)]
    Unknown,
}

/// Configuration carried by every expert checkpoint.
///
/// `modify_modules` and `modify_layers` are regexes (full-match semantics)
/// selecting which base-model submodules receive expert containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertConfig {
    pub model_modifier: ModelModifier,
    #[serde(default = "default_match_all")]
    pub modify_modules: String,
    #[serde(default = "default_match_all")]
    pub modify_layers: String,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f32,
    /// Prefix length for KV adapters, checked against the loaded
    /// `adapter_k`/`adapter_v` shapes.
    #[serde(default = "default_kv_prefix_len")]
    pub kv_prefix_len: usize,
    #[serde(default)]
    pub expert_name: Option<String>,
    #[serde(default)]
    pub finetune_task_name: Option<String>,
    /// When set, containers skip task-name routing even if no selector is
    /// installed.
    #[serde(default)]
    pub task_agnostic_routing: bool,
}

fn default_match_all() -> String {
    ".*".to_string()
}

fn default_lora_rank() -> usize {
    4
}

fn default_lora_alpha() -> f32 {
    16.0
}

fn default_kv_prefix_len() -> usize {
    8
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            model_modifier: ModelModifier::Lora,
            modify_modules: default_match_all(),
            modify_layers: default_match_all(),
            lora_rank: default_lora_rank(),
            lora_alpha: default_lora_alpha(),
            kv_prefix_len: default_kv_prefix_len(),
            expert_name: None,
            finetune_task_name: None,
            task_agnostic_routing: false,
        }
    }
}

impl ExpertConfig {
    /// LoRA scaling factor: alpha / rank.
    pub fn lora_scaling(&self) -> f32 {
        self.lora_alpha / self.lora_rank as f32
    }
}

/// A named, trained adapter plus its config. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Expert {
    pub config: ExpertConfig,
    /// Parameter name -> tensor. Keys are relative to the base model root,
    /// with any leading `"model."` segment already stripped.
    pub weights: HashMap<String, Tensor>,
}

impl Expert {
    pub fn new(config: ExpertConfig, weights: HashMap<String, Tensor>) -> Self {
        Self { config, weights }
    }

    /// The expert's resolved name, if the config carries one.
    pub fn name(&self) -> Option<&str> {
        self.config.expert_name.as_deref()
    }
}

/// Resolves expert names to loaded experts.
///
/// Graph leaves resolve through this seam; libraries and checkpoint stores
/// implement it.
pub trait ExpertLoader {
    fn load_expert(&self, name: &str) -> Result<Expert, ExpertError>;
}

/// Load an expert from a checkpoint directory.
///
/// The directory must contain `expert_config.json` (hyper-parameters) and
/// `expert_model.safetensors` (state dict). Weight keys are stripped of a
/// leading `"model."` segment. The expert name resolves in order: the
/// `name_override` argument, `expert_name` from the config,
/// `finetune_task_name`, and finally the directory name.
pub fn load_expert(
    path: impl AsRef<Path>,
    name_override: Option<&str>,
    device: &Device,
) -> Result<Expert, ExpertError> {
    let path = path.as_ref();

    let config_path = path.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(ExpertError::ConfigNotFound(
            config_path.display().to_string(),
        ));
    }
    let config_str = std::fs::read_to_string(&config_path)?;
    let mut config: ExpertConfig =
        serde_json::from_str(&config_str).map_err(|e| ExpertError::ConfigParse(e.to_string()))?;

    let weights_path = path.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(ExpertError::WeightsNotFound(
            weights_path.display().to_string(),
        ));
    }

    tracing::info!(path = %weights_path.display(), "loading expert checkpoint");
    let tensors = candle_core::safetensors::load(&weights_path, device)
        .map_err(|e| ExpertError::WeightsLoad(e.to_string()))?;
    let weights: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(k, v)| (strip_model_prefix(&k), v))
        .collect();

    let name = match name_override {
        Some(name) => name.to_string(),
        None => config
            .expert_name
            .clone()
            .or_else(|| config.finetune_task_name.clone())
            .unwrap_or_else(|| {
                let fallback = path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "expert".to_string());
                tracing::info!(
                    name = %fallback,
                    "expert name not found in checkpoint, assigning from path"
                );
                fallback
            }),
    };
    config.expert_name = Some(name);

    Ok(Expert::new(config, weights))
}

fn strip_model_prefix(key: &str) -> String {
    key.strip_prefix("model.").unwrap_or(key).to_string()
}

/// Loader that resolves expert names as subdirectories of a root path.
pub struct CheckpointLoader {
    root: PathBuf,
    device: Device,
}

impl CheckpointLoader {
    pub fn new(root: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            root: root.into(),
            device,
        }
    }
}

impl ExpertLoader for CheckpointLoader {
    fn load_expert(&self, name: &str) -> Result<Expert, ExpertError> {
        let dir = self.root.join(name);
        if !dir.exists() {
            return Err(ExpertError::NotFound(name.to_string()));
        }
        load_expert(&dir, Some(name), &self.device)
    }
}

//! Shared test fixtures: tiny deterministic experts, layers and loaders.

use std::cell::RefCell;
use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::Linear;

use crate::expert::{Expert, ExpertConfig, ExpertError, ExpertLoader};

/// Expert with a single parameter `p` holding one value.
pub fn scalar_expert(value: f32) -> Expert {
    let mut weights = HashMap::new();
    weights.insert(
        "p".to_string(),
        Tensor::new(&[value], &Device::Cpu).expect("cpu tensor"),
    );
    Expert::new(ExpertConfig::default(), weights)
}

/// Bias-free linear layer with all-zero weights.
pub fn zeros_linear(in_features: usize, out_features: usize) -> Linear {
    let w = Tensor::zeros((out_features, in_features), DType::F32, &Device::Cpu)
        .expect("cpu tensor");
    Linear::new(w, None)
}

/// Rank-1 LoRA weights whose delta is `value * sum(x)` on every output, for
/// configs with `lora_rank: 1, lora_alpha: 1.0`.
pub fn rank1_lora_weights(
    in_features: usize,
    out_features: usize,
    value: f32,
) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let mut weights = HashMap::new();
    weights.insert(
        "lora_a".to_string(),
        Tensor::ones((1, in_features), DType::F32, &device).expect("cpu tensor"),
    );
    weights.insert(
        "lora_b".to_string(),
        (Tensor::ones((out_features, 1), DType::F32, &device).expect("cpu tensor")
            * value as f64)
            .expect("scale"),
    );
    weights
}

/// Random KV adapter weights with an open gate.
pub fn kv_weights(
    prefix_len: usize,
    in_features: usize,
    out_features: usize,
) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let mut weights = HashMap::new();
    weights.insert(
        "adapter_k".to_string(),
        Tensor::rand(-1.0f32, 1.0, (prefix_len, in_features), &device).expect("cpu tensor"),
    );
    weights.insert(
        "adapter_v".to_string(),
        Tensor::rand(-1.0f32, 1.0, (prefix_len, out_features), &device).expect("cpu tensor"),
    );
    weights.insert(
        "adapter_gate".to_string(),
        Tensor::new(&[1.0f32], &device).expect("cpu tensor"),
    );
    weights
}

/// In-memory loader that records how often each expert name is resolved.
pub struct MapLoader {
    experts: HashMap<String, Expert>,
    loads: RefCell<HashMap<String, usize>>,
}

impl MapLoader {
    pub fn new(experts: Vec<(String, Expert)>) -> Self {
        Self {
            experts: experts.into_iter().collect(),
            loads: RefCell::new(HashMap::new()),
        }
    }

    /// How many times `name` was loaded.
    pub fn load_count(&self, name: &str) -> usize {
        self.loads.borrow().get(name).copied().unwrap_or(0)
    }
}

impl ExpertLoader for MapLoader {
    fn load_expert(&self, name: &str) -> Result<Expert, ExpertError> {
        *self.loads.borrow_mut().entry(name.to_string()).or_insert(0) += 1;
        self.experts
            .get(name)
            .cloned()
            .ok_or_else(|| ExpertError::NotFound(name.to_string()))
    }
}

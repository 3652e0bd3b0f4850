//! Key/value prefix adapter.
//!
//! A KV expert owns a learned prefix of keys and values plus a scalar gate.
//! Its contribution is a gated attention read over the prefix, added to the
//! base layer output:
//!
//! ```text
//! delta(x) = tanh(gate) * softmax(x @ k.T / sqrt(in)) @ v
//! ```
//!
//! KV experts cannot be merged into base weights; they are only routed.

use std::collections::HashMap;

use candle_core::{Module, Tensor, D};
use candle_nn::Linear;

use crate::expert::ExpertConfig;

use super::{flatten_batch, restore_batch, AdapterError};

#[derive(Debug, Clone)]
pub struct KvExpert {
    adapter_k: Tensor,
    adapter_v: Tensor,
    gate: f32,
}

impl KvExpert {
    /// Build from layer-relative weights (`adapter_k`, `adapter_v` and an
    /// optional scalar `adapter_gate`, zero when absent). The loaded prefix
    /// length must match the config's `kv_prefix_len`.
    pub fn from_weights(
        config: &ExpertConfig,
        weights: &HashMap<String, Tensor>,
    ) -> Result<Self, AdapterError> {
        let adapter_k = weights
            .get("adapter_k")
            .ok_or_else(|| AdapterError::MissingWeight("adapter_k".to_string()))?
            .clone();
        let adapter_v = weights
            .get("adapter_v")
            .ok_or_else(|| AdapterError::MissingWeight("adapter_v".to_string()))?
            .clone();

        let k_dims = adapter_k.dims();
        let v_dims = adapter_v.dims();
        if k_dims.len() != 2 {
            return Err(AdapterError::ShapeMismatch {
                param: "adapter_k".to_string(),
                dims: k_dims.to_vec(),
            });
        }
        if v_dims.len() != 2 || v_dims[0] != k_dims[0] {
            return Err(AdapterError::ShapeMismatch {
                param: "adapter_v".to_string(),
                dims: v_dims.to_vec(),
            });
        }
        if k_dims[0] != config.kv_prefix_len {
            return Err(AdapterError::PrefixLenMismatch {
                expected: config.kv_prefix_len,
                got: k_dims[0],
            });
        }

        let gate = match weights.get("adapter_gate") {
            Some(g) => g.flatten_all()?.to_vec1::<f32>()?[0],
            None => 0.0,
        };

        Ok(Self {
            adapter_k,
            adapter_v,
            gate,
        })
    }

    pub fn new(adapter_k: Tensor, adapter_v: Tensor, gate: f32) -> Result<Self, AdapterError> {
        let config = ExpertConfig {
            kv_prefix_len: adapter_k.dims().first().copied().unwrap_or(0),
            ..Default::default()
        };
        let mut weights = HashMap::new();
        weights.insert("adapter_k".to_string(), adapter_k);
        weights.insert("adapter_v".to_string(), adapter_v);
        let mut expert = Self::from_weights(&config, &weights)?;
        expert.gate = gate;
        Ok(expert)
    }

    pub fn prefix_len(&self) -> usize {
        self.adapter_k.dims()[0]
    }

    pub fn in_features(&self) -> usize {
        self.adapter_k.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.adapter_v.dims()[1]
    }

    pub fn gate(&self) -> f32 {
        self.gate
    }

    /// Gated prefix-attention contribution for 2D or 3D input.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor, AdapterError> {
        let (x2d, split) = flatten_batch(x)?;
        let scale = 1.0 / (self.in_features() as f64).sqrt();
        let scores = x2d.matmul(&self.adapter_k.t()?)?.affine(scale, 0.0)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let read = attn.matmul(&self.adapter_v)?;
        let gated = read.affine(self.gate.tanh() as f64, 0.0)?;
        Ok(restore_batch(gated, split)?)
    }

    /// Per-example gather over KV experts, one adapter per batch row.
    pub fn parallel_forward(
        base: &Linear,
        x: &Tensor,
        experts: &[&KvExpert],
    ) -> Result<Tensor, AdapterError> {
        let batch = x.dims()[0];
        if experts.len() != batch {
            return Err(AdapterError::BatchMismatch {
                batch,
                experts: experts.len(),
            });
        }

        let base_out = base.forward(x)?;
        let mut deltas = Vec::with_capacity(batch);
        for (i, expert) in experts.iter().enumerate() {
            let xi = x.narrow(0, i, 1)?;
            deltas.push(expert.delta(&xi)?);
        }
        let delta = Tensor::cat(&deltas, 0)?;
        Ok((&base_out + &delta)?)
    }

    /// Joint forward over all experts: prefixes are concatenated along the
    /// prefix axis, attention is computed over the joint prefix, and each
    /// expert's gate applies to its own value block.
    pub fn concat_forward(
        base: &Linear,
        x: &Tensor,
        experts: &[&KvExpert],
    ) -> Result<Tensor, AdapterError> {
        if experts.is_empty() {
            return Ok(base.forward(x)?);
        }
        let in_features = experts[0].in_features();
        let out_features = experts[0].out_features();
        for expert in experts {
            if expert.in_features() != in_features || expert.out_features() != out_features {
                return Err(AdapterError::ShapeMismatch {
                    param: "adapter_k".to_string(),
                    dims: expert.adapter_k.dims().to_vec(),
                });
            }
        }

        let (x2d, split) = flatten_batch(x)?;
        let keys: Vec<&Tensor> = experts.iter().map(|e| &e.adapter_k).collect();
        let joint_k = Tensor::cat(&keys, 0)?;

        let scale = 1.0 / (in_features as f64).sqrt();
        let scores = x2d.matmul(&joint_k.t()?)?.affine(scale, 0.0)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let mut acc: Option<Tensor> = None;
        let mut offset = 0;
        for expert in experts {
            let p = expert.prefix_len();
            let attn_slice = attn.narrow(1, offset, p)?;
            let read = attn_slice
                .matmul(&expert.adapter_v)?
                .affine(expert.gate.tanh() as f64, 0.0)?;
            acc = Some(match acc {
                Some(sum) => (&sum + &read)?,
                None => read,
            });
            offset += p;
        }

        let delta = restore_batch(acc.expect("at least one expert"), split)?;
        let base_out = base.forward(x)?;
        Ok((&base_out + &delta)?)
    }
}

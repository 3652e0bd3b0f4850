//! Low-rank linear adapter (LoRA).

use std::collections::HashMap;

use candle_core::{Module, Tensor};
use candle_nn::Linear;

use crate::expert::ExpertConfig;

use super::{flatten_batch, restore_batch, AdapterError};

/// Low-rank delta for a linear layer.
///
/// The forward contribution is:
/// ```text
/// delta(x) = scale * (x @ lora_a.T @ lora_b.T)
/// ```
/// with `lora_a: [rank, in_features]`, `lora_b: [out_features, rank]` and
/// `scale = alpha / rank`.
///
/// A LoRA expert is either *standalone* (kept in a container for per-call
/// combination) or *merged* (its delta folded into the base weight via
/// [`LoraExpert::merge_into`], after which the primitive is discarded).
/// Merging is one-directional.
#[derive(Debug, Clone)]
pub struct LoraExpert {
    lora_a: Tensor,
    lora_b: Tensor,
    rank: usize,
    scale: f32,
}

impl LoraExpert {
    /// Build from layer-relative weights (`lora_a`, `lora_b`).
    pub fn from_weights(
        config: &ExpertConfig,
        weights: &HashMap<String, Tensor>,
    ) -> Result<Self, AdapterError> {
        let lora_a = weights
            .get("lora_a")
            .ok_or_else(|| AdapterError::MissingWeight("lora_a".to_string()))?
            .clone();
        let lora_b = weights
            .get("lora_b")
            .ok_or_else(|| AdapterError::MissingWeight("lora_b".to_string()))?
            .clone();

        let a_dims = lora_a.dims();
        let b_dims = lora_b.dims();
        if a_dims.len() != 2 {
            return Err(AdapterError::ShapeMismatch {
                param: "lora_a".to_string(),
                dims: a_dims.to_vec(),
            });
        }
        if b_dims.len() != 2 || b_dims[1] != a_dims[0] {
            return Err(AdapterError::ShapeMismatch {
                param: "lora_b".to_string(),
                dims: b_dims.to_vec(),
            });
        }

        let rank = a_dims[0];
        Ok(Self {
            lora_a,
            lora_b,
            rank,
            scale: config.lora_alpha / rank as f32,
        })
    }

    pub fn new(lora_a: Tensor, lora_b: Tensor, alpha: f32) -> Result<Self, AdapterError> {
        let mut weights = HashMap::new();
        weights.insert("lora_a".to_string(), lora_a);
        weights.insert("lora_b".to_string(), lora_b);
        let config = ExpertConfig {
            lora_alpha: alpha,
            ..Default::default()
        };
        Self::from_weights(&config, &weights)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.lora_b.dims()[0]
    }

    /// The low-rank contribution `scale * (x @ a.T @ b.T)` for 2D or 3D input.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor, AdapterError> {
        let (x2d, split) = flatten_batch(x)?;
        let mid = x2d.matmul(&self.lora_a.t()?)?;
        let out = mid.matmul(&self.lora_b.t()?)?;
        let out = if (self.scale - 1.0).abs() > f32::EPSILON {
            out.affine(self.scale as f64, 0.0)?
        } else {
            out
        };
        Ok(restore_batch(out, split)?)
    }

    /// Fold this expert's delta into the base layer, returning the merged
    /// layer. The weight update is `w + scale * (b @ a)`.
    pub fn merge_into(&self, base: &Linear) -> Result<Linear, AdapterError> {
        let delta = self
            .lora_b
            .matmul(&self.lora_a)?
            .affine(self.scale as f64, 0.0)?;
        let weight = (base.weight() + delta)?;
        Ok(Linear::new(weight, base.bias().cloned()))
    }

    /// Per-example gather: example `i` of the batch gets `experts[i]`'s delta
    /// added to the shared base output.
    pub fn parallel_forward(
        base: &Linear,
        x: &Tensor,
        experts: &[&LoraExpert],
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

    /// Weighted merge-after-projection: the base output is computed once and
    /// the weighted sum of per-expert deltas is added to it. Numerically this
    /// is the combined low-rank term applied to the pre-computed base output,
    /// not a forward through re-derived merged weights.
    pub fn weighted_forward(
        base: &Linear,
        x: &Tensor,
        weighted: &[(&LoraExpert, f32)],
    ) -> Result<Tensor, AdapterError> {
        let base_out = base.forward(x)?;
        let mut acc: Option<Tensor> = None;
        for (expert, weight) in weighted {
            let delta = expert.delta(x)?.affine(*weight as f64, 0.0)?;
            acc = Some(match acc {
                Some(sum) => (&sum + &delta)?,
                None => delta,
            });
        }
        match acc {
            Some(delta) => Ok((&base_out + &delta)?),
            None => Ok(base_out),
        }
    }
}

//! Routing context and expert selectors.
//!
//! [`RoutingContext`] carries the current batch's task names as an explicit
//! value threaded through every container forward call. Contract: exactly one
//! producer fills it per batch (the harness, before the forward pass); every
//! container in that pass only reads it. There is no process-wide slot.

use candle_core::{Device, Tensor};
use thiserror::Error;

/// Epsilon added to the normalization denominator so all-zero logits do not
/// divide by zero.
pub const ROUTER_EPS: f32 = 1e-8;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("router logits have {got} entries for {expected} expert names")]
    LogitsMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Per-batch routing information, one task name per example.
///
/// An empty context means task-agnostic: containers fall back to their
/// selector or to the plain base layer.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    task_names: Vec<String>,
}

impl RoutingContext {
    /// Context with no task information.
    pub fn none() -> Self {
        Self::default()
    }

    /// Context for a batch with one task name per example.
    pub fn for_tasks<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_names: tasks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn task_names(&self) -> &[String] {
        &self.task_names
    }

    pub fn is_empty(&self) -> bool {
        self.task_names.is_empty()
    }
}

/// Produces a probability-like weighting over known experts.
pub trait Selector: Send + Sync {
    /// Expert name -> weight, in the selector's name order.
    fn routing_weights(&self) -> Result<Vec<(String, f32)>, RoutingError>;

    /// The append-only list of expert names this selector knows.
    fn expert_names(&self) -> &[String];
}

/// Per-layer router holding one learnable logit per known expert.
///
/// Weights are `sigmoid(logits)` L1-normalized with [`ROUTER_EPS`] in the
/// denominator, so they sum to a value in `(0, 1]` rather than exactly 1.
///
/// `resize` appends new expert names and reinitializes the *entire* logit
/// vector at small uniform magnitude: learned directional information does
/// not survive a resize. This is a deliberate simplification, covered by
/// tests rather than silently changed.
pub struct PolyRouter {
    expert_names: Vec<String>,
    module_logits: Tensor,
    device: Device,
}

impl PolyRouter {
    pub fn new(expert_names: Vec<String>, device: &Device) -> Result<Self, RoutingError> {
        let module_logits = Self::init_logits(expert_names.len(), device)?;
        Ok(Self {
            expert_names,
            module_logits,
            device: device.clone(),
        })
    }

    fn init_logits(n: usize, device: &Device) -> Result<Tensor, RoutingError> {
        if n == 0 {
            return Ok(Tensor::zeros(0, candle_core::DType::F32, device)?);
        }
        Ok(Tensor::rand(-1e-3f32, 1e-3, n, device)?)
    }

    /// Append expert names, reinitializing the full logit vector.
    pub fn resize(&mut self, new_names: Vec<String>) -> Result<(), RoutingError> {
        self.expert_names.extend(new_names);
        self.module_logits = Self::init_logits(self.expert_names.len(), &self.device)?;
        Ok(())
    }

    pub fn logits(&self) -> &Tensor {
        &self.module_logits
    }

    /// Replace the logits, e.g. with trained values.
    pub fn set_logits(&mut self, logits: Tensor) -> Result<(), RoutingError> {
        let got = logits.elem_count();
        if got != self.expert_names.len() {
            return Err(RoutingError::LogitsMismatch {
                expected: self.expert_names.len(),
                got,
            });
        }
        self.module_logits = logits;
        Ok(())
    }
}

impl Selector for PolyRouter {
    fn routing_weights(&self) -> Result<Vec<(String, f32)>, RoutingError> {
        if self.expert_names.is_empty() {
            return Ok(Vec::new());
        }
        let probs = candle_nn::ops::sigmoid(&self.module_logits)?;
        let values: Vec<f32> = probs.to_vec1()?;
        let denom: f32 = values.iter().sum::<f32>() + ROUTER_EPS;
        Ok(self
            .expert_names
            .iter()
            .zip(values)
            .map(|(name, p)| (name.clone(), p / denom))
            .collect())
    }

    fn expert_names(&self) -> &[String] {
        &self.expert_names
    }
}

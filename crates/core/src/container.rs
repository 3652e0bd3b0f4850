//! Expert container: per-layer wrapper owning adapters and routing policy.
//!
//! A container wraps exactly one base [`Linear`] layer. Experts are added
//! over its lifetime, either merged into the base weights immediately or
//! retained for per-call routing. Each forward call consults the batch's
//! [`RoutingContext`] and the container's state to decide which adapter
//! computation runs.
//!
//! `add_expert` and `merge_with_layer` mutate container state and require
//! external exclusion if ever invoked from multiple threads; forward is a
//! read-only path.

use std::collections::HashMap;
use std::fmt;

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use thiserror::Error;

use crate::adapters::{AdapterError, AdapterKind, AdapterPrimitive, KvExpert, LoraExpert};
use crate::expert::{ExpertConfig, ModelModifier};
use crate::routing::{RoutingContext, RoutingError, Selector};

/// What to do with an expert's weights when adding it to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpertAction {
    /// Fold the delta into the base layer and discard the adapter.
    Merge,
    /// Keep the adapter for per-call routing.
    Route,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("an expert named '{name}' already exists in layer {layer}")]
    DuplicateExpert { name: String, layer: String },
    #[error("unsupported model modifier for expert '{name}' in layer {layer}")]
    UnsupportedModifier { name: String, layer: String },
    #[error("no expert for task '{task}' in layer {layer} and no default expert is set")]
    MissingExpert { task: String, layer: String },
    #[error("invalid merge: {0}")]
    InvalidMerge(String),
    #[error("experts of different adapter kinds selected in layer {layer}")]
    MixedAdapterKinds { layer: String },
    #[error("no task names in routing context for layer {layer}: set a selector or merge experts into the layer")]
    MissingTaskNames { layer: String },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Per-layer wrapper holding zero or more experts and the routing policy.
pub struct ExpertContainer {
    layer_name: String,
    config: ExpertConfig,
    base: Linear,
    experts: HashMap<String, AdapterPrimitive>,
    /// Insertion order of routed expert names, for deterministic iteration.
    expert_order: Vec<String>,
    default_expert_name: Option<String>,
    /// Names whose deltas were folded into the base weights. A name here is
    /// never simultaneously present in `experts`.
    merged_expert_names: Vec<String>,
    selector: Option<Box<dyn Selector>>,
}

impl fmt::Debug for ExpertContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpertContainer")
            .field("layer_name", &self.layer_name)
            .field("experts", &self.expert_order)
            .field("merged_expert_names", &self.merged_expert_names)
            .field("default_expert_name", &self.default_expert_name)
            .field("has_selector", &self.selector.is_some())
            .finish_non_exhaustive()
    }
}

impl ExpertContainer {
    pub fn new(layer_name: impl Into<String>, config: ExpertConfig, base: Linear) -> Self {
        Self {
            layer_name: layer_name.into(),
            config,
            base,
            experts: HashMap::new(),
            expert_order: Vec::new(),
            default_expert_name: None,
            merged_expert_names: Vec::new(),
            selector: None,
        }
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    /// Routed expert names in insertion order.
    pub fn expert_names(&self) -> &[String] {
        &self.expert_order
    }

    pub fn merged_expert_names(&self) -> &[String] {
        &self.merged_expert_names
    }

    pub fn default_expert_name(&self) -> Option<&str> {
        self.default_expert_name.as_deref()
    }

    pub fn has_expert(&self, name: &str) -> bool {
        self.experts.contains_key(name)
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    /// Install a selector for weighted routing.
    pub fn set_selector(&mut self, selector: Box<dyn Selector>) {
        self.selector = Some(selector);
    }

    pub fn has_selector(&self) -> bool {
        self.selector.is_some()
    }

    /// Add an expert to this container.
    ///
    /// With [`ExpertAction::Merge`] the adapter is folded into the base
    /// weights immediately and discarded (LoRA only); with
    /// [`ExpertAction::Route`] it is retained under `name` for routing.
    /// `is_default` makes it the fallback for unseen tasks and cannot be
    /// combined with merging.
    pub fn add_expert(
        &mut self,
        name: impl Into<String>,
        config: &ExpertConfig,
        weights: &HashMap<String, Tensor>,
        action: ExpertAction,
        is_default: bool,
    ) -> Result<(), ContainerError> {
        let name = name.into();

        if self.experts.contains_key(&name) || self.merged_expert_names.contains(&name) {
            return Err(ContainerError::DuplicateExpert {
                name,
                layer: self.layer_name.clone(),
            });
        }
        if is_default && action == ExpertAction::Merge {
            return Err(ContainerError::InvalidMerge(format!(
                "cannot set expert '{name}' as default while merging it; use the route action"
            )));
        }

        let primitive = match config.model_modifier {
            ModelModifier::Lora => {
                AdapterPrimitive::Lora(LoraExpert::from_weights(config, weights)?)
            }
            ModelModifier::KvAdapter => {
                AdapterPrimitive::Kv(KvExpert::from_weights(config, weights)?)
            }
            ModelModifier::Unknown => {
                return Err(ContainerError::UnsupportedModifier {
                    name,
                    layer: self.layer_name.clone(),
                })
            }
        };

        match action {
            ExpertAction::Merge => match primitive {
                AdapterPrimitive::Lora(lora) => {
                    self.base = lora.merge_into(&self.base)?;
                    self.merged_expert_names.push(name);
                }
                AdapterPrimitive::Kv(_) => {
                    return Err(ContainerError::InvalidMerge(format!(
                        "expert '{name}' is a kv adapter; only low-rank experts can be merged"
                    )));
                }
            },
            ExpertAction::Route => {
                if is_default {
                    self.default_expert_name = Some(name.clone());
                }
                self.expert_order.push(name.clone());
                self.experts.insert(name, primitive);
            }
        }
        Ok(())
    }

    /// Fold every retained expert into the base weights.
    ///
    /// All retained experts must be LoRA; the merge happens only after that
    /// check, so a failure leaves the container unchanged.
    pub fn merge_with_layer(&mut self) -> Result<(), ContainerError> {
        if let Some(name) = self
            .expert_order
            .iter()
            .find(|n| self.experts[*n].as_lora().is_none())
        {
            return Err(ContainerError::InvalidMerge(format!(
                "expert '{name}' is a kv adapter; only low-rank experts can be merged"
            )));
        }

        for name in std::mem::take(&mut self.expert_order) {
            let primitive = self.experts.remove(&name).expect("tracked expert");
            let lora = primitive.as_lora().expect("checked above");
            self.base = lora.merge_into(&self.base)?;
            self.merged_expert_names.push(name);
        }
        self.default_expert_name = None;
        Ok(())
    }

    /// Forward pass with the routing decision described in the module docs:
    /// task-name routing, selector-weighted routing, or base pass-through.
    pub fn forward(&self, x: &Tensor, ctx: &RoutingContext) -> Result<Tensor, ContainerError> {
        let task_names = ctx.task_names();

        if !task_names.is_empty()
            && !self.experts.is_empty()
            && self.default_expert_name.is_none()
        {
            if let Some(unknown) = task_names.iter().find(|t| !self.experts.contains_key(*t)) {
                return Err(ContainerError::MissingExpert {
                    task: unknown.clone(),
                    layer: self.layer_name.clone(),
                });
            }
        }

        if !self.experts.is_empty()
            && self.selector.is_none()
            && !self.config.task_agnostic_routing
        {
            if task_names.is_empty() {
                return Err(ContainerError::MissingTaskNames {
                    layer: self.layer_name.clone(),
                });
            }
            self.route_by_task(x, task_names)
        } else if !self.experts.is_empty() && self.selector.is_some() {
            if self.config.model_modifier == ModelModifier::KvAdapter {
                let experts: Vec<&KvExpert> = self
                    .expert_order
                    .iter()
                    .filter_map(|n| self.experts[n].as_kv())
                    .collect();
                Ok(KvExpert::concat_forward(&self.base, x, &experts)?)
            } else {
                let weights = self
                    .selector
                    .as_ref()
                    .expect("checked above")
                    .routing_weights()?;
                self.weighted_route(x, &weights)
            }
        } else {
            // no routable experts (or task-agnostic without a selector):
            // everything lives in the base weights already
            Ok(self.base.forward(x)?)
        }
    }

    /// Route each example to its named expert (or the default), combining via
    /// a per-example parallel forward.
    fn route_by_task(&self, x: &Tensor, task_names: &[String]) -> Result<Tensor, ContainerError> {
        let mut selected = Vec::with_capacity(task_names.len());
        for task in task_names {
            let name = if self.experts.contains_key(task) {
                task.as_str()
            } else {
                match self.default_expert_name.as_deref() {
                    Some(default) => default,
                    None => {
                        return Err(ContainerError::MissingExpert {
                            task: task.clone(),
                            layer: self.layer_name.clone(),
                        })
                    }
                }
            };
            selected.push(&self.experts[name]);
        }

        let kind = selected[0].kind();
        if selected.iter().any(|p| p.kind() != kind) {
            return Err(ContainerError::MixedAdapterKinds {
                layer: self.layer_name.clone(),
            });
        }

        match kind {
            AdapterKind::Lora => {
                let experts: Vec<&LoraExpert> =
                    selected.iter().filter_map(|p| p.as_lora()).collect();
                Ok(LoraExpert::parallel_forward(&self.base, x, &experts)?)
            }
            AdapterKind::Kv => {
                let experts: Vec<&KvExpert> = selected.iter().filter_map(|p| p.as_kv()).collect();
                Ok(KvExpert::parallel_forward(&self.base, x, &experts)?)
            }
        }
    }

    /// Weighted merge-after-projection over the selector's weighting.
    fn weighted_route(
        &self,
        x: &Tensor,
        weights: &[(String, f32)],
    ) -> Result<Tensor, ContainerError> {
        let mut weighted = Vec::with_capacity(weights.len());
        for (name, weight) in weights {
            let primitive =
                self.experts
                    .get(name)
                    .ok_or_else(|| ContainerError::MissingExpert {
                        task: name.clone(),
                        layer: self.layer_name.clone(),
                    })?;
            let lora = primitive
                .as_lora()
                .ok_or_else(|| ContainerError::MixedAdapterKinds {
                    layer: self.layer_name.clone(),
                })?;
            weighted.push((lora, *weight));
        }
        Ok(LoraExpert::weighted_forward(&self.base, x, &weighted)?)
    }
}

//! Attaching experts to a host model.
//!
//! A [`HostModel`] is an ordered registry of named linear layers.
//! [`add_expert_to_model`] selects layers by the expert config's
//! `modify_modules` / `modify_layers` patterns (full-match regexes over the
//! parent path and the leaf name), promotes each selected layer to an
//! [`ExpertContainer`] on first attachment, and hands it the layer-relative
//! slice of the expert's weights.
//!
//! The function consumes the model and returns the modified one, so the type
//! system tracks that attachment rewrites layers.

use std::collections::HashMap;

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use thiserror::Error;

use crate::container::{ContainerError, ExpertAction, ExpertContainer};
use crate::expert::ExpertConfig;
use crate::routing::RoutingContext;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid module selection pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid layer window '{0}': expected '-N' or 'N-'")]
    LayerWindow(String),
    #[error("no layer at path '{0}'")]
    UnknownLayer(String),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// A registry slot: either the original linear layer or its container
/// replacement.
#[derive(Debug)]
pub enum HostLayer {
    Linear(Linear),
    Container(ExpertContainer),
}

/// Ordered collection of named layers standing in for the host network.
#[derive(Debug, Default)]
pub struct HostModel {
    layers: Vec<(String, HostLayer)>,
    index: HashMap<String, usize>,
}

impl HostModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a linear layer under a dotted path, e.g.
    /// `"layers.0.self_attn.q_proj"`. Insertion order is preserved.
    pub fn insert_linear(&mut self, path: impl Into<String>, linear: Linear) {
        let path = path.into();
        self.index.insert(path.clone(), self.layers.len());
        self.layers.push((path, HostLayer::Linear(linear)));
    }

    pub fn layer_paths(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(path, _)| path.as_str())
    }

    pub fn get(&self, path: &str) -> Option<&HostLayer> {
        self.index.get(path).map(|&i| &self.layers[i].1)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut HostLayer> {
        self.index.get(path).map(|&i| &mut self.layers[i].1)
    }

    /// The container at `path`, if that layer has been promoted.
    pub fn container(&self, path: &str) -> Option<&ExpertContainer> {
        match self.get(path) {
            Some(HostLayer::Container(c)) => Some(c),
            _ => None,
        }
    }

    pub fn container_mut(&mut self, path: &str) -> Option<&mut ExpertContainer> {
        match self.get_mut(path) {
            Some(HostLayer::Container(c)) => Some(c),
            _ => None,
        }
    }

    /// Forward through one layer, consulting the routing context when the
    /// layer carries experts.
    pub fn forward(
        &self,
        path: &str,
        x: &Tensor,
        ctx: &RoutingContext,
    ) -> Result<Tensor, AttachError> {
        match self
            .get(path)
            .ok_or_else(|| AttachError::UnknownLayer(path.to_string()))?
        {
            HostLayer::Linear(linear) => Ok(linear.forward(x).map_err(ContainerError::from)?),
            HostLayer::Container(container) => Ok(container.forward(x, ctx)?),
        }
    }
}

/// Restriction of attachment to a contiguous block of layer indices.
#[derive(Debug, Clone, Copy)]
enum LayerWindow {
    /// Indices strictly below the bound (`"-N"`).
    Below(usize),
    /// Indices at or above the bound (`"N-"`).
    AtLeast(usize),
}

impl LayerWindow {
    fn parse(spec: &str) -> Result<Self, AttachError> {
        let invalid = || AttachError::LayerWindow(spec.to_string());
        if let Some(bound) = spec.strip_prefix('-') {
            bound.parse().map(Self::Below).map_err(|_| invalid())
        } else {
            let bound = spec.strip_suffix('-').unwrap_or(spec);
            bound.parse().map(Self::AtLeast).map_err(|_| invalid())
        }
    }

    fn contains(&self, index: usize) -> bool {
        match self {
            Self::Below(bound) => index < *bound,
            Self::AtLeast(bound) => index >= *bound,
        }
    }
}

/// First dotted path segment that parses as a layer index.
fn first_numeric_segment(path: &str) -> Option<usize> {
    path.split('.').find_map(|s| s.parse().ok())
}

/// Anchor a user pattern so it must match the whole string.
fn full_match(pattern: &str) -> Result<regex::Regex, regex::Error> {
    regex::Regex::new(&format!("^(?:{pattern})$"))
}

/// Weights belonging to one layer, with the layer path prefix stripped.
fn subset_weights(weights: &HashMap<String, Tensor>, path: &str) -> HashMap<String, Tensor> {
    let prefix = format!("{path}.");
    weights
        .iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(&prefix)
                .map(|rel| (rel.to_string(), tensor.clone()))
        })
        .collect()
}

/// Attach an expert to every selected layer of the model.
///
/// Layer selection: the parent path must full-match `config.modify_modules`,
/// the leaf name must full-match `config.modify_layers`, and when
/// `load_only_layers` is set the layer's numeric index must fall in the
/// window (layers without a numeric segment are skipped).
#[allow(clippy::too_many_arguments)]
pub fn add_expert_to_model(
    mut model: HostModel,
    expert_name: impl Into<String>,
    config: &ExpertConfig,
    weights: &HashMap<String, Tensor>,
    action: ExpertAction,
    is_default: bool,
    load_only_layers: Option<&str>,
) -> Result<HostModel, AttachError> {
    let expert_name = expert_name.into();
    let module_re = full_match(&config.modify_modules)?;
    let layer_re = full_match(&config.modify_layers)?;
    let window = load_only_layers.map(LayerWindow::parse).transpose()?;

    let mut attached = 0usize;
    for (path, slot) in &mut model.layers {
        let (parent, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (parent, leaf),
            None => ("", path.as_str()),
        };
        if !module_re.is_match(parent) || !layer_re.is_match(leaf) {
            continue;
        }
        if let Some(window) = window {
            match first_numeric_segment(path) {
                Some(index) if window.contains(index) => {}
                _ => continue,
            }
        }

        if let HostLayer::Linear(linear) = &*slot {
            *slot = HostLayer::Container(ExpertContainer::new(
                path.clone(),
                config.clone(),
                linear.clone(),
            ));
        }
        if let HostLayer::Container(container) = slot {
            container.add_expert(
                &expert_name,
                config,
                &subset_weights(weights, path),
                action,
                is_default,
            )?;
        }
        attached += 1;
    }

    tracing::info!(expert = %expert_name, layers = attached, "attached expert to model");
    Ok(model)
}

//! Graph nodes: arena entries for the module-graph DSL.

use std::collections::HashMap;

/// Arena index of a node inside a [`super::ModuleGraph`].
pub type NodeId = usize;

/// Weight attached to an operator child: a literal, or a free variable
/// identified by its positional ordinal (`$0`, `$1`, ... in the normalized
/// node name).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightSpec {
    Literal(f64),
    Variable(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Terminal or alias node. A leaf resolves through the expert loader; an
    /// alias forwards to its single child.
    Plain,
    /// Weighted sum over children. `weights[i]` pairs with `children[i]`.
    Linear { weights: Vec<WeightSpec> },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) children: Vec<NodeId>,
}

impl Node {
    pub(crate) fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Plain,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_operator(&self) -> bool {
        !matches!(self.kind, NodeKind::Plain)
    }

    /// Fully-qualified keys of this node's own free variables:
    /// `"<normalized-name>[<child-index>]"`.
    pub fn variables(&self) -> Vec<String> {
        match &self.kind {
            NodeKind::Plain => Vec::new(),
            NodeKind::Linear { weights } => weights
                .iter()
                .enumerate()
                .filter(|(_, w)| matches!(w, WeightSpec::Variable(_)))
                .map(|(i, _)| format!("{}[{}]", self.name, i))
                .collect(),
        }
    }

    /// The node name with `$i` tokens substituted from `bindings` (keyed by
    /// fully-qualified variable name) where values are supplied.
    pub fn display_name(&self, bindings: &HashMap<String, f64>) -> String {
        let NodeKind::Linear { weights } = &self.kind else {
            return self.name.clone();
        };
        let mut name = self.name.clone();
        for (i, spec) in weights.iter().enumerate() {
            if let WeightSpec::Variable(ordinal) = spec {
                let key = format!("{}[{}]", self.name, i);
                if let Some(value) = bindings.get(&key) {
                    name = name.replacen(&format!("${ordinal}"), &format_weight(*value), 1);
                }
            }
        }
        name
    }
}

/// Format a weight the way the DSL writes literals: integral values without a
/// trailing `.0`.
pub(crate) fn format_weight(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

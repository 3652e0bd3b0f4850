//! Module graph DSL: parsing, composition and memoized instantiation.
//!
//! A graph is a program of `source -> target(s)` statements separated by
//! `;`. Targets are either plain node names (aliases) or a single operator
//! call, currently `linear(child:weight, ...)`, whose weights may be decimal
//! literals or `$variable` placeholders bound at instantiation time.
//!
//! Nodes live in an arena addressed by [`NodeId`]; identical names resolve to
//! the identical node. Instantiation results are memoized under
//! `(node, bound-variable snapshot)` so reusing a graph with different
//! bindings never observes a stale cache.

mod node;

pub use node::{Node, NodeId, NodeKind, WeightSpec};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::expert::{Expert, ExpertError, ExpertLoader};

use node::format_weight;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown operator '{operator}' in segment '{segment}'")]
    UnknownOperator { operator: String, segment: String },
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("missing value for variable {0}")]
    MissingVariable(String),
    #[error("parameter '{param}' is not shared by all children of node '{node}'")]
    ParameterMismatch { node: String, param: String },
    #[error(transparent)]
    Load(#[from] ExpertError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

fn op_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)\((.+)\)$").expect("static regex"))
}

type BindingsKey = Vec<(String, u64)>;

fn bindings_key(bindings: &HashMap<String, f64>) -> BindingsKey {
    let mut key: BindingsKey = bindings
        .iter()
        .map(|(name, value)| (name.clone(), value.to_bits()))
        .collect();
    key.sort();
    key
}

/// A parsed module graph: an arena of named nodes plus a memo of
/// instantiated experts.
#[derive(Debug)]
pub struct ModuleGraph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    memo: HashMap<(NodeId, BindingsKey), Arc<Expert>>,
}

impl ModuleGraph {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            memo: HashMap::new(),
        }
    }

    /// Parse a graph from its textual form. Parsing is idempotent:
    /// re-parsing the same string yields a structurally identical graph.
    pub fn from_string(source: &str) -> Result<Self, GraphError> {
        let mut graph = Self::new();

        for part in source.split(';') {
            let part = part.trim();
            if part.is_empty() || !part.contains("->") {
                continue;
            }
            let (source_name, targets) = part.split_once("->").expect("checked above");
            let source_name = source_name.trim();
            let targets = targets.trim();

            if op_call_re().is_match(source_name) {
                return Err(GraphError::InvalidGraph(format!(
                    "source cannot be an operator: '{source_name}'"
                )));
            }
            let source_id = graph.get_or_create_plain(source_name);

            if let Some(caps) = op_call_re().captures(targets) {
                let operator = caps.get(1).expect("group 1").as_str();
                let args = caps.get(2).expect("group 2").as_str();
                if operator != "linear" {
                    return Err(GraphError::UnknownOperator {
                        operator: operator.to_string(),
                        segment: part.to_string(),
                    });
                }
                let child = graph.create_linear_node(args)?;
                graph.nodes[source_id].children.push(child);
            } else {
                let ids: Vec<NodeId> = targets
                    .split(',')
                    .map(|t| graph.get_or_create_plain(t.trim()))
                    .collect();
                graph.nodes[source_id].children.extend(ids);
            }
        }

        Ok(graph)
    }

    fn get_or_create_plain(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node::plain(name));
        self.index.insert(name.to_string(), id);
        id
    }

    /// Create (or reuse) a `linear` operator node from its argument list.
    ///
    /// `$name` variables are rewritten positionally (`$0`, `$1`, ...) so the
    /// node's arena key is its normalized form; re-parsing a dumped graph
    /// resolves to identical nodes.
    fn create_linear_node(&mut self, args: &str) -> Result<NodeId, GraphError> {
        let mut child_names = Vec::new();
        let mut weights = Vec::new();
        let mut rendered = Vec::new();
        let mut var_ordinal = 0usize;

        for pair in args.split(',') {
            let (child, weight) = pair.split_once(':').ok_or_else(|| {
                GraphError::InvalidGraph(format!("expected 'name:weight', got '{}'", pair.trim()))
            })?;
            let child = child.trim();
            let weight = weight.trim();

            if let Some(var) = weight.strip_prefix('$') {
                if var.is_empty() {
                    return Err(GraphError::InvalidGraph(format!(
                        "empty variable name for child '{child}'"
                    )));
                }
                weights.push(WeightSpec::Variable(var_ordinal));
                rendered.push(format!("{child}:${var_ordinal}"));
                var_ordinal += 1;
            } else {
                let value: f64 = weight.parse().map_err(|_| {
                    GraphError::InvalidGraph(format!("invalid weight '{weight}' for child '{child}'"))
                })?;
                weights.push(WeightSpec::Literal(value));
                rendered.push(format!("{child}:{}", format_weight(value)));
            }
            child_names.push(child.to_string());
        }

        let name = format!("linear({})", rendered.join(", "));
        if let Some(&id) = self.index.get(&name) {
            return Ok(id);
        }

        let children: Vec<NodeId> = child_names
            .iter()
            .map(|c| self.get_or_create_plain(c))
            .collect();
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.clone(),
            kind: NodeKind::Linear { weights },
            children,
        });
        self.index.insert(name, id);
        Ok(id)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Nodes never referenced as a child.
    pub fn roots(&self) -> Vec<&Node> {
        let referenced: HashSet<NodeId> = self
            .nodes
            .iter()
            .flat_map(|n| n.children.iter().copied())
            .collect();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(id, _)| !referenced.contains(id))
            .map(|(_, n)| n)
            .collect()
    }

    /// Nodes with no children.
    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.children.is_empty()).collect()
    }

    /// All unresolved variable keys reachable from the roots, in first-visit
    /// order.
    pub fn variables(&self) -> Vec<String> {
        let root_ids: Vec<NodeId> = {
            let referenced: HashSet<NodeId> = self
                .nodes
                .iter()
                .flat_map(|n| n.children.iter().copied())
                .collect();
            (0..self.nodes.len())
                .filter(|id| !referenced.contains(id))
                .collect()
        };

        let mut out = Vec::new();
        let mut seen_nodes = HashSet::new();
        for id in root_ids {
            self.collect_variables(id, &mut seen_nodes, &mut out);
        }
        out
    }

    fn collect_variables(
        &self,
        id: NodeId,
        seen: &mut HashSet<NodeId>,
        out: &mut Vec<String>,
    ) {
        if !seen.insert(id) {
            return;
        }
        out.extend(self.nodes[id].variables());
        for &child in &self.nodes[id].children {
            self.collect_variables(child, seen, out);
        }
    }

    /// Render the graph back to its textual form, substituting bound
    /// variables for display.
    pub fn dumps(&self, bindings: &HashMap<String, f64>) -> String {
        let mut statements = Vec::new();
        for node in &self.nodes {
            if node.children.is_empty() || node.is_operator() {
                continue;
            }
            let targets: Vec<String> = node
                .children
                .iter()
                .map(|&c| self.nodes[c].display_name(bindings))
                .collect();
            statements.push(format!("{} -> {}", node.name, targets.join(", ")));
        }
        statements.join("; ")
    }

    /// Instantiate every root node, returning `(root name, expert)` pairs.
    pub fn create_experts(
        &mut self,
        bindings: &HashMap<String, f64>,
        loader: &dyn ExpertLoader,
    ) -> Result<Vec<(String, Arc<Expert>)>, GraphError> {
        let referenced: HashSet<NodeId> = self
            .nodes
            .iter()
            .flat_map(|n| n.children.iter().copied())
            .collect();
        let root_ids: Vec<NodeId> = (0..self.nodes.len())
            .filter(|id| !referenced.contains(id))
            .collect();

        let key = bindings_key(bindings);
        let mut out = Vec::with_capacity(root_ids.len());
        for id in root_ids {
            let name = self.nodes[id].name.clone();
            let expert = self.instantiate_node(id, bindings, &key, loader)?;
            out.push((name, expert));
        }
        Ok(out)
    }

    /// Instantiate a single node by name.
    pub fn instantiate(
        &mut self,
        name: &str,
        bindings: &HashMap<String, f64>,
        loader: &dyn ExpertLoader,
    ) -> Result<Arc<Expert>, GraphError> {
        let id = *self
            .index
            .get(name)
            .ok_or_else(|| GraphError::InvalidGraph(format!("no node named '{name}'")))?;
        let key = bindings_key(bindings);
        self.instantiate_node(id, bindings, &key, loader)
    }

    fn instantiate_node(
        &mut self,
        id: NodeId,
        bindings: &HashMap<String, f64>,
        key: &BindingsKey,
        loader: &dyn ExpertLoader,
    ) -> Result<Arc<Expert>, GraphError> {
        if let Some(expert) = self.memo.get(&(id, key.clone())) {
            return Ok(expert.clone());
        }

        let node = self.nodes[id].clone();
        let expert = match &node.kind {
            NodeKind::Plain => match node.children.len() {
                0 => Arc::new(loader.load_expert(&node.name)?),
                1 => self.instantiate_node(node.children[0], bindings, key, loader)?,
                n => {
                    return Err(GraphError::InvalidGraph(format!(
                        "alias node '{}' has {n} children; use an operator to combine them",
                        node.name
                    )))
                }
            },
            NodeKind::Linear { weights } => {
                self.instantiate_linear(&node, weights, bindings, key, loader)?
            }
        };

        self.memo.insert((id, key.clone()), expert.clone());
        Ok(expert)
    }

    /// Weighted parameter-space merge over the node's children. The merged
    /// expert inherits the first child's config (insertion order); children
    /// must agree on adapter kind and parameter names.
    fn instantiate_linear(
        &mut self,
        node: &Node,
        weights: &[WeightSpec],
        bindings: &HashMap<String, f64>,
        key: &BindingsKey,
        loader: &dyn ExpertLoader,
    ) -> Result<Arc<Expert>, GraphError> {
        let mut merged: Option<Expert> = None;

        for (i, (&child_id, spec)) in node.children.iter().zip(weights).enumerate() {
            let child = self.instantiate_node(child_id, bindings, key, loader)?;
            let weight = match spec {
                WeightSpec::Literal(value) => *value,
                WeightSpec::Variable(_) => {
                    let var_key = format!("{}[{}]", node.name, i);
                    *bindings
                        .get(&var_key)
                        .ok_or(GraphError::MissingVariable(var_key))?
                }
            };

            match &mut merged {
                None => {
                    let mut scaled = HashMap::with_capacity(child.weights.len());
                    for (param, tensor) in &child.weights {
                        scaled.insert(param.clone(), tensor.affine(weight, 0.0)?);
                    }
                    merged = Some(Expert::new(child.config.clone(), scaled));
                }
                Some(acc) => {
                    if child.config.model_modifier != acc.config.model_modifier {
                        return Err(GraphError::InvalidGraph(format!(
                            "children of node '{}' mix adapter kinds",
                            node.name
                        )));
                    }
                    for param in acc.weights.keys() {
                        if !child.weights.contains_key(param) {
                            return Err(GraphError::ParameterMismatch {
                                node: node.name.clone(),
                                param: param.clone(),
                            });
                        }
                    }
                    for (param, tensor) in &child.weights {
                        let slot = acc.weights.get_mut(param).ok_or_else(|| {
                            GraphError::ParameterMismatch {
                                node: node.name.clone(),
                                param: param.clone(),
                            }
                        })?;
                        let scaled = tensor.affine(weight, 0.0)?;
                        *slot = (&*slot + &scaled)?;
                    }
                }
            }
        }

        let merged = merged.ok_or_else(|| {
            GraphError::InvalidGraph(format!("operator node '{}' has no children", node.name))
        })?;
        Ok(Arc::new(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scalar_expert, MapLoader};
    use std::collections::BTreeSet;

    fn name_set(nodes: Vec<&Node>) -> BTreeSet<String> {
        nodes.into_iter().map(|n| n.name().to_string()).collect()
    }

    fn bindings(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parse_roots_and_leaves() {
        let graph = ModuleGraph::from_string(
            "security -> b; b -> linear(base:0.5, studies:3); default -> b",
        )
        .unwrap();
        assert_eq!(
            name_set(graph.roots()),
            BTreeSet::from(["security".to_string(), "default".to_string()])
        );
        assert_eq!(
            name_set(graph.leaves()),
            BTreeSet::from(["base".to_string(), "studies".to_string()])
        );
    }

    #[test]
    fn test_same_name_resolves_to_same_node() {
        let graph = ModuleGraph::from_string("a -> shared; b -> shared").unwrap();
        let shared = graph.node("shared").unwrap() as *const Node;
        // both parents reference the identical arena entry
        let a = graph.node("a").unwrap();
        let b = graph.node("b").unwrap();
        assert_eq!(a.children(), b.children());
        assert_eq!(&graph.nodes()[a.children()[0]] as *const Node, shared);
    }

    #[test]
    fn test_dumps_round_trip() {
        let source = "a -> linear(x:2, y:$w); b -> a, c";
        let graph = ModuleGraph::from_string(source).unwrap();
        let vars = graph.variables();
        assert_eq!(vars, vec!["linear(x:2, y:$0)[1]".to_string()]);

        let bound = bindings(&[("linear(x:2, y:$0)[1]", 3.0)]);
        let dumped = graph.dumps(&bound);
        assert!(dumped.contains("a -> linear(x:2, y:3)"));

        let reparsed = ModuleGraph::from_string(&dumped).unwrap();
        let original_bound = ModuleGraph::from_string(&graph.dumps(&bound)).unwrap();
        assert_eq!(name_set(reparsed.roots()), name_set(original_bound.roots()));
        assert_eq!(
            name_set(reparsed.leaves()),
            name_set(original_bound.leaves())
        );
    }

    #[test]
    fn test_unknown_operator() {
        let err = ModuleGraph::from_string("a -> quadratic(x:1)").unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownOperator { ref operator, .. } if operator == "quadratic"
        ));
    }

    #[test]
    fn test_operator_source_rejected() {
        let err = ModuleGraph::from_string("linear(a:1) -> b").unwrap_err();
        assert!(matches!(err, GraphError::InvalidGraph(_)));
    }

    #[test]
    fn test_malformed_weight_rejected() {
        let err = ModuleGraph::from_string("a -> linear(x:abc)").unwrap_err();
        assert!(matches!(err, GraphError::InvalidGraph(_)));
    }

    #[test]
    fn test_end_to_end_weighted_merge() {
        // w = 3, p_x = p_y = [1.0]: p = 2 * 1 + 3 * 1
        let mut graph = ModuleGraph::from_string("a -> linear(x:2, y:$w)").unwrap();
        let loader = MapLoader::new(vec![
            ("x".to_string(), scalar_expert(1.0)),
            ("y".to_string(), scalar_expert(1.0)),
        ]);

        let bound = bindings(&[("linear(x:2, y:$0)[1]", 3.0)]);
        let expert = graph.instantiate("a", &bound, &loader).unwrap();
        let p: Vec<f32> = expert.weights["p"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(p.len(), 1);
        assert!((p[0] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_variable() {
        let mut graph = ModuleGraph::from_string("a -> linear(x:2, y:$w)").unwrap();
        let loader = MapLoader::new(vec![
            ("x".to_string(), scalar_expert(1.0)),
            ("y".to_string(), scalar_expert(1.0)),
        ]);
        let err = graph
            .instantiate("a", &HashMap::new(), &loader)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::MissingVariable(ref key) if key == "linear(x:2, y:$0)[1]"
        ));
    }

    #[test]
    fn test_literal_merge_is_linear() {
        // weight 1.0 on a, 0.0 on b: result equals a's weights
        let mut graph = ModuleGraph::from_string("m -> linear(a:1.0, b:0.0)").unwrap();
        let loader = MapLoader::new(vec![
            ("a".to_string(), scalar_expert(7.5)),
            ("b".to_string(), scalar_expert(123.0)),
        ]);
        let expert = graph.instantiate("m", &HashMap::new(), &loader).unwrap();
        let p: Vec<f32> = expert.weights["p"].flatten_all().unwrap().to_vec1().unwrap();
        assert!((p[0] - 7.5).abs() < 1e-6);
    }

    #[test]
    fn test_instantiation_is_memoized() {
        let mut graph = ModuleGraph::from_string("m -> linear(a:1.0, b:2.0)").unwrap();
        let loader = MapLoader::new(vec![
            ("a".to_string(), scalar_expert(1.0)),
            ("b".to_string(), scalar_expert(1.0)),
        ]);
        let first = graph.instantiate("m", &HashMap::new(), &loader).unwrap();
        let second = graph.instantiate("m", &HashMap::new(), &loader).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // each leaf was loaded exactly once
        assert_eq!(loader.load_count("a"), 1);
        assert_eq!(loader.load_count("b"), 1);
    }

    #[test]
    fn test_memo_keyed_by_bindings() {
        let mut graph = ModuleGraph::from_string("m -> linear(a:1.0, b:$w)").unwrap();
        let loader = MapLoader::new(vec![
            ("a".to_string(), scalar_expert(1.0)),
            ("b".to_string(), scalar_expert(1.0)),
        ]);
        let key = "linear(a:1, b:$0)[1]";
        let two = graph
            .instantiate("m", &bindings(&[(key, 2.0)]), &loader)
            .unwrap();
        let three = graph
            .instantiate("m", &bindings(&[(key, 3.0)]), &loader)
            .unwrap();
        let p2: Vec<f32> = two.weights["p"].flatten_all().unwrap().to_vec1().unwrap();
        let p3: Vec<f32> = three.weights["p"].flatten_all().unwrap().to_vec1().unwrap();
        assert!((p2[0] - 3.0).abs() < 1e-6);
        assert!((p3[0] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_multi_child_alias_rejected_at_instantiation() {
        let mut graph = ModuleGraph::from_string("a -> b, c").unwrap();
        let loader = MapLoader::new(vec![
            ("b".to_string(), scalar_expert(1.0)),
            ("c".to_string(), scalar_expert(1.0)),
        ]);
        let err = graph.instantiate("a", &HashMap::new(), &loader).unwrap_err();
        assert!(matches!(err, GraphError::InvalidGraph(_)));
    }

    #[test]
    fn test_alias_forwards_to_child() {
        let mut graph = ModuleGraph::from_string("alias -> m; m -> linear(a:2.0)").unwrap();
        let loader = MapLoader::new(vec![("a".to_string(), scalar_expert(3.0))]);
        let expert = graph
            .instantiate("alias", &HashMap::new(), &loader)
            .unwrap();
        let p: Vec<f32> = expert.weights["p"].flatten_all().unwrap().to_vec1().unwrap();
        assert!((p[0] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_parameter_mismatch_is_an_error() {
        let mut graph = ModuleGraph::from_string("m -> linear(a:1.0, b:1.0)").unwrap();
        let mut odd = scalar_expert(1.0);
        let tensor = odd.weights.remove("p").unwrap();
        odd.weights.insert("q".to_string(), tensor);
        let loader = MapLoader::new(vec![
            ("a".to_string(), scalar_expert(1.0)),
            ("b".to_string(), odd),
        ]);
        let err = graph.instantiate("m", &HashMap::new(), &loader).unwrap_err();
        assert!(matches!(err, GraphError::ParameterMismatch { .. }));
    }

    #[test]
    fn test_create_experts_covers_all_roots() {
        let mut graph =
            ModuleGraph::from_string("r1 -> linear(a:1.0); r2 -> linear(a:2.0)").unwrap();
        let loader = MapLoader::new(vec![("a".to_string(), scalar_expert(1.0))]);
        let experts = graph.create_experts(&HashMap::new(), &loader).unwrap();
        let names: BTreeSet<String> = experts.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            BTreeSet::from(["r1".to_string(), "r2".to_string()])
        );
        // the shared leaf was loaded once across both roots
        assert_eq!(loader.load_count("a"), 1);
    }
}

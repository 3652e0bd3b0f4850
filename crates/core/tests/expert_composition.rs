//! Integration tests for the full composition pipeline.
//!
//! These tests exercise the path from expert checkpoints through graph
//! composition, attachment to a host model and routed forward passes. All
//! tests are CPU-only and use tiny rank-1 adapters with hand-computable
//! outputs.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use mttl_core::{
    attach::{add_expert_to_model, HostModel},
    container::ExpertAction,
    expert::{load_expert, CheckpointLoader, Expert, ExpertConfig, CONFIG_FILE, WEIGHTS_FILE},
    graph::ModuleGraph,
    library::InMemoryLibrary,
    routing::{PolyRouter, RoutingContext},
};

const LAYERS: [&str; 2] = ["layers.0.self_attn.q_proj", "layers.1.self_attn.q_proj"];

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn rank1_config() -> ExpertConfig {
    ExpertConfig {
        lora_rank: 1,
        lora_alpha: 1.0,
        modify_layers: "q_proj".to_string(),
        ..Default::default()
    }
}

fn host_model() -> HostModel {
    let mut model = HostModel::new();
    for path in LAYERS {
        let w = Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap();
        model.insert_linear(path, candle_nn::Linear::new(w, None));
    }
    model
}

/// Full-path rank-1 LoRA weights for both layers: delta `value * sum(x)` on
/// every output.
fn expert_weights(value: f32) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let mut weights = HashMap::new();
    for path in LAYERS {
        weights.insert(
            format!("{path}.lora_a"),
            Tensor::ones((1, 4), DType::F32, &device).unwrap(),
        );
        weights.insert(
            format!("{path}.lora_b"),
            (Tensor::ones((4, 1), DType::F32, &device).unwrap() * value as f64).unwrap(),
        );
    }
    weights
}

fn named_expert(name: &str, value: f32) -> Expert {
    let config = ExpertConfig {
        expert_name: Some(name.to_string()),
        ..rank1_config()
    };
    Expert::new(config, expert_weights(value))
}

fn row_values(out: &Tensor) -> Vec<f32> {
    out.flatten_all().unwrap().to_vec1().unwrap()
}

// ─── Task-name routing ───────────────────────────────────────────────────────

#[test]
fn test_task_routing_end_to_end() {
    let model = add_expert_to_model(
        host_model(),
        "piqa",
        &rank1_config(),
        &expert_weights(1.0),
        ExpertAction::Route,
        false,
        None,
    )
    .unwrap();
    let model = add_expert_to_model(
        model,
        "mbpp",
        &rank1_config(),
        &expert_weights(3.0),
        ExpertAction::Route,
        false,
        None,
    )
    .unwrap();

    let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
    let ctx = RoutingContext::for_tasks(["piqa", "mbpp"]);
    for path in LAYERS {
        let vals = row_values(&model.forward(path, &x, &ctx).unwrap());
        // row 0 routed to piqa (delta 4.0), row 1 to mbpp (delta 12.0)
        assert!(vals[..4].iter().all(|&v| (v - 4.0).abs() < 1e-5));
        assert!(vals[4..].iter().all(|&v| (v - 12.0).abs() < 1e-5));
    }
}

#[test]
fn test_selector_routing_end_to_end() {
    let model = add_expert_to_model(
        host_model(),
        "piqa",
        &rank1_config(),
        &expert_weights(1.0),
        ExpertAction::Route,
        false,
        None,
    )
    .unwrap();
    let mut model = add_expert_to_model(
        model,
        "mbpp",
        &rank1_config(),
        &expert_weights(3.0),
        ExpertAction::Route,
        false,
        None,
    )
    .unwrap();
    for path in LAYERS {
        let mut router =
            PolyRouter::new(vec!["piqa".to_string(), "mbpp".to_string()], &Device::Cpu).unwrap();
        router
            .set_logits(Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        model
            .container_mut(path)
            .unwrap()
            .set_selector(Box::new(router));
    }

    let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
    let vals = row_values(
        &model
            .forward(LAYERS[0], &x, &RoutingContext::none())
            .unwrap(),
    );
    // equal routing weights: 0.5 * 4.0 + 0.5 * 12.0
    assert!(vals.iter().all(|&v| (v - 8.0).abs() < 1e-3));
}

// ─── Graph composition ───────────────────────────────────────────────────────

#[test]
fn test_graph_composed_expert_attaches_and_merges() {
    let mut library = InMemoryLibrary::new();
    library
        .add_expert("piqa", named_expert("piqa", 1.0))
        .unwrap();
    library
        .add_expert("mbpp", named_expert("mbpp", 3.0))
        .unwrap();

    let mut graph = ModuleGraph::from_string("blend -> linear(piqa:0.5, mbpp:$w)").unwrap();
    let bindings: HashMap<String, f64> = graph
        .variables()
        .into_iter()
        .map(|key| (key, 0.5))
        .collect();
    let blend = graph.instantiate("blend", &bindings, &library).unwrap();

    let model = add_expert_to_model(
        host_model(),
        "blend",
        &blend.config,
        &blend.weights,
        ExpertAction::Merge,
        false,
        None,
    )
    .unwrap();

    let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
    let vals = row_values(
        &model
            .forward(LAYERS[0], &x, &RoutingContext::none())
            .unwrap(),
    );
    // merged blend: 0.5 * 4.0 + 0.5 * 12.0 folded into the base weights
    assert!(vals.iter().all(|&v| (v - 8.0).abs() < 1e-5));
    assert_eq!(
        model.container(LAYERS[0]).unwrap().merged_expert_names(),
        &["blend"]
    );
}

// ─── Checkpoint loading ──────────────────────────────────────────────────────

#[test]
fn test_checkpoints_feed_graph_leaves() {
    let device = Device::Cpu;
    let root = tempfile::tempdir().unwrap();

    for (name, value) in [("piqa", 1.0f32), ("mbpp", 3.0)] {
        let dir = root.path().join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            serde_json::to_string(&rank1_config()).unwrap(),
        )
        .unwrap();
        candle_core::safetensors::save(&expert_weights(value), dir.join(WEIGHTS_FILE)).unwrap();
    }

    let loaded = load_expert(root.path().join("piqa"), None, &device).unwrap();
    assert_eq!(loaded.name(), Some("piqa"));

    let loader = CheckpointLoader::new(root.path(), device);
    let mut graph = ModuleGraph::from_string("blend -> linear(piqa:1, mbpp:1)").unwrap();
    let blend = graph.instantiate("blend", &HashMap::new(), &loader).unwrap();

    let a: Vec<f32> = blend.weights[&format!("{}.lora_a", LAYERS[0])]
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    // unit weights on both children sum the A factors
    assert!(a.iter().all(|&v| (v - 2.0).abs() < 1e-6));
}

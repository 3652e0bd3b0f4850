//! Adapter primitives attached to base layers.
//!
//! The two supported kinds form a closed set: low-rank linear adapters
//! ([`LoraExpert`]) and key/value prefix adapters ([`KvExpert`]). Containers
//! hold them behind [`AdapterPrimitive`] and pattern-match on the variant, so
//! adding a kind is a compile-checked exhaustiveness change.

mod kv;
mod lora;

pub use kv::KvExpert;
pub use lora::LoraExpert;

use candle_core::Tensor;
use thiserror::Error;

/// Errors from adapter construction and forward passes.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter weights are missing parameter '{0}'")]
    MissingWeight(String),
    #[error("mismatched adapter shapes for '{param}': {dims:?}")]
    ShapeMismatch { param: String, dims: Vec<usize> },
    #[error("adapter prefix has {got} rows, config expects {expected}")]
    PrefixLenMismatch { expected: usize, got: usize },
    #[error("batch of {batch} examples routed to {experts} adapters")]
    BatchMismatch { batch: usize, experts: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// The kind of an adapter primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Lora,
    Kv,
}

/// A loaded adapter retained by a container for routing.
#[derive(Debug, Clone)]
pub enum AdapterPrimitive {
    Lora(LoraExpert),
    Kv(KvExpert),
}

impl AdapterPrimitive {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterPrimitive::Lora(_) => AdapterKind::Lora,
            AdapterPrimitive::Kv(_) => AdapterKind::Kv,
        }
    }

    pub fn as_lora(&self) -> Option<&LoraExpert> {
        match self {
            AdapterPrimitive::Lora(lora) => Some(lora),
            AdapterPrimitive::Kv(_) => None,
        }
    }

    pub fn as_kv(&self) -> Option<&KvExpert> {
        match self {
            AdapterPrimitive::Kv(kv) => Some(kv),
            AdapterPrimitive::Lora(_) => None,
        }
    }
}

/// Collapse a 2D or 3D input to 2D, remembering the batch/seq split.
pub(crate) fn flatten_batch(x: &Tensor) -> candle_core::Result<(Tensor, Option<(usize, usize)>)> {
    let dims = x.dims();
    if dims.len() == 3 {
        let (b, s, f) = (dims[0], dims[1], dims[2]);
        Ok((x.reshape((b * s, f))?, Some((b, s))))
    } else {
        Ok((x.clone(), None))
    }
}

/// Undo [`flatten_batch`].
pub(crate) fn restore_batch(x: Tensor, split: Option<(usize, usize)>) -> candle_core::Result<Tensor> {
    match split {
        Some((b, s)) => {
            let f = x.dims()[1];
            x.reshape((b, s, f))
        }
        None => Ok(x),
    }
}

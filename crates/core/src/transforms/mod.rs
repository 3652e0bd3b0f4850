//! Library transforms: offline computations over a whole expert library.
//!
//! A transform reads every expert in a library and produces one embedding
//! row per expert, optionally persisting the result back into the library
//! under the transform's name.

mod svd;

pub use svd::{SvdEmbeddingTransform, SvdEmbeddingTransformConfig};

use thiserror::Error;

use crate::library::{EmbeddingSet, ExpertLibrary, LibraryError};

/// Candidate magnitude cutoffs tried, in order, when sparsifying expert
/// weights before factorization.
pub const SPARSITY_THRESHOLDS: [f64; 7] = [0.0, 1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 1e-1];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot transform an empty library")]
    EmptyLibrary,
    #[error("expert '{expert}' flattens to {got} parameters, expected {expected}")]
    RowLengthMismatch {
        expert: String,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Computes per-expert embeddings from a library.
pub trait LibraryTransform {
    /// Run the transform. With `persist` the embedding set is also stored in
    /// the library under the transform's name, replacing any previous set.
    fn transform(
        &self,
        library: &mut dyn ExpertLibrary,
        persist: bool,
    ) -> Result<EmbeddingSet, TransformError>;
}

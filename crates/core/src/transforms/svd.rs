//! SVD embedding transform.
//!
//! Each expert's weights are flattened (parameter keys in sorted order) into
//! one row of a matrix, the matrix is sparsified by the smallest magnitude
//! cutoff reaching the configured zero-ratio, and the per-expert scores of a
//! truncated SVD become the embeddings. The expert count is small, so the
//! factorization goes through the n-by-n Gram matrix and a cyclic Jacobi
//! eigensolver rather than a randomized solver.

use serde::{Deserialize, Serialize};

use crate::library::{EmbeddingSet, ExpertLibrary};

use super::{LibraryTransform, TransformError, SPARSITY_THRESHOLDS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvdEmbeddingTransformConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_n_components")]
    pub n_components: usize,
    /// Target fraction of matrix entries zeroed before factorization.
    #[serde(default = "default_sparsity_threshold")]
    pub sparsity_threshold: f64,
}

fn default_name() -> String {
    "svd".to_string()
}

fn default_n_components() -> usize {
    64
}

fn default_sparsity_threshold() -> f64 {
    0.8
}

impl Default for SvdEmbeddingTransformConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            n_components: default_n_components(),
            sparsity_threshold: default_sparsity_threshold(),
        }
    }
}

pub struct SvdEmbeddingTransform {
    config: SvdEmbeddingTransformConfig,
}

impl SvdEmbeddingTransform {
    pub fn new(config: SvdEmbeddingTransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SvdEmbeddingTransformConfig {
        &self.config
    }
}

impl LibraryTransform for SvdEmbeddingTransform {
    fn transform(
        &self,
        library: &mut dyn ExpertLibrary,
        persist: bool,
    ) -> Result<EmbeddingSet, TransformError> {
        let keys: Vec<String> = library.names().iter().map(|n| n.to_string()).collect();
        if keys.is_empty() {
            return Err(TransformError::EmptyLibrary);
        }

        let mut matrix: Vec<Vec<f64>> = Vec::with_capacity(keys.len());
        let mut expected = None;
        for name in &keys {
            let expert = library.get(name)?;
            let mut params: Vec<&String> = expert.weights.keys().collect();
            params.sort();

            let mut row = Vec::new();
            for param in params {
                let values: Vec<f32> = expert.weights[param].flatten_all()?.to_vec1()?;
                row.extend(values.into_iter().map(f64::from));
            }
            match expected {
                None => expected = Some(row.len()),
                Some(len) if len != row.len() => {
                    return Err(TransformError::RowLengthMismatch {
                        expert: name.clone(),
                        expected: len,
                        got: row.len(),
                    });
                }
                Some(_) => {}
            }
            matrix.push(row);
        }

        let cutoff = select_sparsity_threshold(&matrix, self.config.sparsity_threshold);
        let mut zeroed = 0usize;
        let mut total = 0usize;
        for row in &mut matrix {
            for value in row.iter_mut() {
                total += 1;
                if value.abs() <= cutoff {
                    *value = 0.0;
                    zeroed += 1;
                }
            }
        }
        tracing::info!(
            cutoff,
            zero_ratio = zeroed as f64 / total as f64,
            experts = keys.len(),
            "sparsified expert matrix"
        );

        let k = self.config.n_components.min(keys.len());
        let scores = truncated_svd_scores(&matrix, k);

        let flat: Vec<f32> = scores.iter().flatten().map(|&v| v as f32).collect();
        let embeddings =
            candle_core::Tensor::from_vec(flat, (keys.len(), k), &candle_core::Device::Cpu)?;

        if persist {
            library.add_embeddings(
                &self.config.name,
                keys.clone(),
                embeddings.clone(),
                serde_json::to_value(&self.config)?,
                true,
            )?;
        }

        Ok(EmbeddingSet {
            keys,
            embeddings,
            config: serde_json::to_value(&self.config)?,
        })
    }
}

/// Smallest candidate cutoff whose resulting zero-ratio reaches `target`;
/// the largest candidate when none does. Zeroing is inclusive
/// (`|v| <= cutoff`), so pre-existing exact zeros count toward the ratio and
/// an already-sparse matrix selects the zero cutoff, preserving tiny nonzero
/// weights.
fn select_sparsity_threshold(matrix: &[Vec<f64>], target: f64) -> f64 {
    let total: usize = matrix.iter().map(|row| row.len()).sum();
    let mut chosen = SPARSITY_THRESHOLDS[SPARSITY_THRESHOLDS.len() - 1];
    for &cutoff in &SPARSITY_THRESHOLDS {
        let zeroed: usize = matrix
            .iter()
            .flat_map(|row| row.iter())
            .filter(|v| v.abs() <= cutoff)
            .count();
        if zeroed as f64 / total as f64 >= target {
            chosen = cutoff;
            break;
        }
    }
    chosen
}

/// Row scores of the rank-`k` truncated SVD of `matrix`, L2-normalized.
///
/// Scores are `U_k * sqrt(lambda_k)` of the Gram matrix `M M^T`, which equals
/// `U_k * S_k` of `M` itself up to sign of the singular vectors.
///
/// A row with no energy in the kept components scores zero everywhere; the
/// epsilon guard in the normalization keeps it a zero vector rather than a
/// division by zero.
fn truncated_svd_scores(matrix: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
    let n = matrix.len();
    let mut gram = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = matrix[i]
                .iter()
                .zip(&matrix[j])
                .map(|(a, b)| a * b)
                .sum();
            gram[i][j] = dot;
            gram[j][i] = dot;
        }
    }

    let (eigvals, eigvecs) = jacobi_eigh(gram);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigvals[b].total_cmp(&eigvals[a]));

    let mut scores = vec![vec![0.0f64; k]; n];
    for (col, &e) in order.iter().take(k).enumerate() {
        let sigma = eigvals[e].max(0.0).sqrt();
        for i in 0..n {
            scores[i][col] = eigvecs[e][i] * sigma;
        }
    }

    for row in &mut scores {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt() + 1e-12;
        for value in row.iter_mut() {
            *value /= norm;
        }
    }
    scores
}

/// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations.
/// Returns `(eigenvalues, eigenvectors)` with `eigenvectors[j]` the vector
/// for `eigenvalues[j]`, unsorted.
fn jacobi_eigh(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v = vec![vec![0.0f64; n]; n];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _sweep in 0..100 {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[p][q] * a[p][q];
            }
        }
        if off.sqrt() < 1e-12 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for col in 0..n {
                    let apc = a[p][col];
                    let aqc = a[q][col];
                    a[p][col] = c * apc - s * aqc;
                    a[q][col] = s * apc + c * aqc;
                }
                for row in a.iter_mut() {
                    let rp = row[p];
                    let rq = row[q];
                    row[p] = c * rp - s * rq;
                    row[q] = s * rp + c * rq;
                }
                for row in v.iter_mut() {
                    let rp = row[p];
                    let rq = row[q];
                    row[p] = c * rp - s * rq;
                    row[q] = s * rp + c * rq;
                }
            }
        }
    }

    let eigvals: Vec<f64> = (0..n).map(|i| a[i][i]).collect();
    // column j of the accumulated rotation is the j-th eigenvector
    let eigvecs: Vec<Vec<f64>> = (0..n).map(|j| (0..n).map(|i| v[i][j]).collect()).collect();
    (eigvals, eigvecs)
}

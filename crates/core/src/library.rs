//! Expert libraries: named collections of experts plus auxiliary embeddings.
//!
//! A library is the storage seam between training runs and composition:
//! graphs and transforms address experts by name through it. Auxiliary
//! embedding sets (e.g. the output of a library transform) are stored
//! alongside the experts under the name of the transform that produced them.

use std::collections::HashMap;

use candle_core::Tensor;
use thiserror::Error;

use crate::expert::{Expert, ExpertError, ExpertLoader};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("no expert named '{0}' in library")]
    UnknownExpert(String),
    #[error("an expert named '{0}' already exists in library")]
    DuplicateExpert(String),
    #[error("embeddings named '{0}' already exist; pass overwrite to replace them")]
    EmbeddingsExist(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// One named set of per-expert embeddings: `embeddings` row `i` belongs to
/// expert `keys[i]`. `config` records how the set was produced.
#[derive(Debug, Clone)]
pub struct EmbeddingSet {
    pub keys: Vec<String>,
    pub embeddings: Tensor,
    pub config: serde_json::Value,
}

/// A named collection of experts with auxiliary embedding storage.
pub trait ExpertLibrary {
    /// Expert names in insertion order.
    fn names(&self) -> Vec<&str>;

    fn get(&self, name: &str) -> Result<&Expert, LibraryError>;

    fn len(&self) -> usize {
        self.names().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an embedding set under `name`. Fails if a set with that name
    /// already exists, unless `overwrite` is set.
    fn add_embeddings(
        &mut self,
        name: &str,
        keys: Vec<String>,
        embeddings: Tensor,
        config: serde_json::Value,
        overwrite: bool,
    ) -> Result<(), LibraryError>;

    fn embeddings(&self, name: &str) -> Option<&EmbeddingSet>;
}

/// Library backed by process memory, for composition pipelines that hold
/// every expert resident.
#[derive(Default)]
pub struct InMemoryLibrary {
    experts: Vec<(String, Expert)>,
    index: HashMap<String, usize>,
    embedding_sets: HashMap<String, EmbeddingSet>,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_expert(
        &mut self,
        name: impl Into<String>,
        expert: Expert,
    ) -> Result<(), LibraryError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(LibraryError::DuplicateExpert(name));
        }
        self.index.insert(name.clone(), self.experts.len());
        self.experts.push((name, expert));
        Ok(())
    }
}

impl ExpertLibrary for InMemoryLibrary {
    fn names(&self) -> Vec<&str> {
        self.experts.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn get(&self, name: &str) -> Result<&Expert, LibraryError> {
        self.index
            .get(name)
            .map(|&i| &self.experts[i].1)
            .ok_or_else(|| LibraryError::UnknownExpert(name.to_string()))
    }

    fn add_embeddings(
        &mut self,
        name: &str,
        keys: Vec<String>,
        embeddings: Tensor,
        config: serde_json::Value,
        overwrite: bool,
    ) -> Result<(), LibraryError> {
        if self.embedding_sets.contains_key(name) && !overwrite {
            return Err(LibraryError::EmbeddingsExist(name.to_string()));
        }
        self.embedding_sets.insert(
            name.to_string(),
            EmbeddingSet {
                keys,
                embeddings,
                config,
            },
        );
        Ok(())
    }

    fn embeddings(&self, name: &str) -> Option<&EmbeddingSet> {
        self.embedding_sets.get(name)
    }
}

impl ExpertLoader for InMemoryLibrary {
    fn load_expert(&self, name: &str) -> Result<Expert, ExpertError> {
        self.get(name)
            .cloned()
            .map_err(|_| ExpertError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scalar_expert;
    use candle_core::Device;

    fn library() -> InMemoryLibrary {
        let mut lib = InMemoryLibrary::new();
        lib.add_expert("piqa", scalar_expert(1.0)).unwrap();
        lib.add_expert("mbpp", scalar_expert(2.0)).unwrap();
        lib
    }

    #[test]
    fn test_names_preserve_insertion_order() {
        let lib = library();
        assert_eq!(lib.names(), vec!["piqa", "mbpp"]);
        assert_eq!(lib.len(), 2);
    }

    #[test]
    fn test_duplicate_expert_rejected() {
        let mut lib = library();
        let err = lib.add_expert("piqa", scalar_expert(3.0)).unwrap_err();
        assert!(matches!(err, LibraryError::DuplicateExpert(ref n) if n == "piqa"));
    }

    #[test]
    fn test_get_unknown_expert() {
        let lib = library();
        assert!(matches!(
            lib.get("nope").unwrap_err(),
            LibraryError::UnknownExpert(_)
        ));
    }

    #[test]
    fn test_loader_maps_to_not_found() {
        let lib = library();
        let err = lib.load_expert("nope").unwrap_err();
        assert!(matches!(err, ExpertError::NotFound(_)));
        assert!(lib.load_expert("piqa").is_ok());
    }

    #[test]
    fn test_embeddings_overwrite_guard() {
        let mut lib = library();
        let emb = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let keys = vec!["piqa".to_string(), "mbpp".to_string()];

        lib.add_embeddings("svd", keys.clone(), emb.clone(), serde_json::json!({}), false)
            .unwrap();
        let err = lib
            .add_embeddings("svd", keys.clone(), emb.clone(), serde_json::json!({}), false)
            .unwrap_err();
        assert!(matches!(err, LibraryError::EmbeddingsExist(_)));

        lib.add_embeddings("svd", keys, emb, serde_json::json!({"v": 2}), true)
            .unwrap();
        assert_eq!(lib.embeddings("svd").unwrap().config["v"], 2);
    }
}

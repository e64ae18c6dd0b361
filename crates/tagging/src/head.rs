// Classification head mapping encoder embeddings to per-tag logits.

use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder, VarMap, linear_no_bias};
use std::path::Path;

/// Width of the encoder embedding the head consumes.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// `Linear(512 -> N)`, parameter `weight`.
    Linear,
    /// `Linear(512 -> 512) -> ReLU -> Linear(512 -> N)`, parameters `0.weight`, `2.weight`.
    Mlp,
}

impl HeadKind {
    pub fn from_mlp_flag(mlp_head: bool) -> Self {
        if mlp_head { HeadKind::Mlp } else { HeadKind::Linear }
    }
}

#[derive(Debug)]
enum Layers {
    Linear(Linear),
    Mlp { fc1: Linear, fc2: Linear },
}

/// Trainable projection head.
///
/// Owns its own `VarMap` so it can be checkpointed and optimised apart
/// from the encoder. No layer carries a bias.
pub struct Head {
    kind: HeadKind,
    layers: Layers,
    varmap: VarMap,
    n_classes: usize,
}

impl Head {
    pub fn new(kind: HeadKind, n_classes: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        // names follow a sequential container: index 1 is the parameter-free ReLU
        let layers = match kind {
            HeadKind::Linear => Layers::Linear(linear_no_bias(EMBEDDING_DIM, n_classes, vb)?),
            HeadKind::Mlp => Layers::Mlp {
                fc1: linear_no_bias(EMBEDDING_DIM, EMBEDDING_DIM, vb.pp("0"))?,
                fc2: linear_no_bias(EMBEDDING_DIM, n_classes, vb.pp("2"))?,
            },
        };
        Ok(Self {
            kind,
            layers,
            varmap,
            n_classes,
        })
    }

    pub fn kind(&self) -> HeadKind {
        self.kind
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Warm-start from a head checkpoint (non-strict).
    pub fn load(&self, path: impl AsRef<Path>) -> Result<crate::weights::LoadReport> {
        crate::weights::load_weights(&self.varmap, path)
    }

    /// Persist only the head's parameters.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::weights::save_weights(&self.varmap, path)
    }
}

impl std::fmt::Debug for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Head")
            .field("kind", &self.kind)
            .field("n_classes", &self.n_classes)
            .finish()
    }
}

impl Module for Head {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match &self.layers {
            Layers::Linear(fc) => fc.forward(xs),
            Layers::Mlp { fc1, fc2 } => xs.apply(fc1)?.relu()?.apply(fc2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(head: &Head) -> Vec<String> {
        let mut names: Vec<String> = head.varmap().data().lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    #[test]
    fn test_linear_head_shapes() {
        let head = Head::new(HeadKind::Linear, 50, &Device::Cpu).unwrap();
        assert_eq!(names(&head), vec!["weight".to_string()]);

        let x = Tensor::ones((4, EMBEDDING_DIM), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(head.forward(&x).unwrap().dims(), &[4, 50]);
    }

    #[test]
    fn test_mlp_head_shapes() {
        let head = Head::new(HeadKind::Mlp, 10, &Device::Cpu).unwrap();
        assert_eq!(names(&head), vec!["0.weight".to_string(), "2.weight".to_string()]);

        let data = head.varmap().data().lock().unwrap();
        assert_eq!(data["0.weight"].dims(), &[EMBEDDING_DIM, EMBEDDING_DIM]);
        assert_eq!(data["2.weight"].dims(), &[10, EMBEDDING_DIM]);
        drop(data);

        let x = Tensor::ones((3, EMBEDDING_DIM), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(head.forward(&x).unwrap().dims(), &[3, 10]);
    }

    #[test]
    fn test_head_kind_from_flag() {
        assert_eq!(HeadKind::from_mlp_flag(true), HeadKind::Mlp);
        assert_eq!(HeadKind::from_mlp_flag(false), HeadKind::Linear);
    }
}

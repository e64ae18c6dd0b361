//! Non-strict checkpoint loading.
//!
//! Checkpoints are safetensors files mapping parameter names to tensors.
//! Loading merges the intersection of checkpoint and target by name: a
//! parameter is copied only when the name exists on both sides with the same
//! shape. Everything else is reported, never fatal, since a warm-start
//! checkpoint routinely carries a differently-shaped pretraining head.
//!
//! Fresh parameters are drawn from a seeded host generator so that two runs
//! with the same seed start from the same point on every backend.

use crate::error::{Result, TaggerError};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;

/// Prefix left on keys by checkpoints exported from a `{"state_dict": ...}` container.
const STATE_DICT_PREFIX: &str = "state_dict.";

/// What a non-strict load did and did not transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Target parameters overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Target parameters with no entry in the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries with no target parameter.
    pub unexpected: Vec<String>,
    /// Names present on both sides whose shapes disagree: `(name, target, checkpoint)`.
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Load `path` into the variables of `varmap`, skipping names or shapes that do not line up.
///
/// Fails with `CheckpointLoad` when the file cannot be read or is not a
/// safetensors container; in that case `varmap` is untouched.
pub fn load_weights(varmap: &VarMap, path: impl AsRef<Path>) -> Result<LoadReport> {
    let path = path.as_ref();
    let (checkpoint, shadowed) = read_checkpoint(path)?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TaggerError::IllegalState("variable map lock poisoned".to_string()))?;

    let mut report = LoadReport::default();
    let mut updates = Vec::new();

    for (name, var) in vars.iter() {
        let Some(source) = checkpoint.get(name) else {
            report.missing.push(name.clone());
            continue;
        };
        if source.dims() != var.dims() {
            log::debug!(
                "skipping '{}': target shape {:?}, checkpoint shape {:?}",
                name,
                var.dims(),
                source.dims()
            );
            report
                .mismatched
                .push((name.clone(), var.dims().to_vec(), source.dims().to_vec()));
            continue;
        }
        // convert everything up front so a failure cannot leave a half-written model
        let source = source.to_dtype(var.dtype())?.to_device(var.device())?;
        updates.push((name.clone(), var, source));
    }

    for (name, var, source) in updates {
        var.set(&source)?;
        report.loaded.push(name);
    }

    report.unexpected = checkpoint
        .keys()
        .filter(|name| !vars.contains_key(*name))
        .cloned()
        .chain(shadowed)
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    report.mismatched.sort_by(|a, b| a.0.cmp(&b.0));

    log::info!(
        "loaded {} of {} parameters from {} ({} missing, {} unexpected, {} shape mismatches)",
        report.loaded.len(),
        vars.len(),
        path.display(),
        report.missing.len(),
        report.unexpected.len(),
        report.mismatched.len()
    );

    Ok(report)
}

/// Persist every variable of `varmap` as a safetensors file.
pub fn save_weights(varmap: &VarMap, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path)?;
    log::debug!("saved {} parameters to {}", varmap.all_vars().len(), path.display());
    Ok(())
}

/// Read and parse the whole container before anything is mutated.
///
/// Returns the tensors keyed by their unprefixed names, plus the original
/// names of prefixed entries that were dropped because the bare name is
/// also present. The bare entry always wins.
fn read_checkpoint(path: &Path) -> Result<(HashMap<String, Tensor>, Vec<String>)> {
    // the handle is dropped inside fs::read whether or not parsing succeeds
    let bytes = std::fs::read(path).map_err(|e| {
        TaggerError::CheckpointLoad(format!("cannot read {}: {e}", path.display()))
    })?;

    let tensors = candle_core::safetensors::load_buffer(&bytes, &Device::Cpu).map_err(|e| {
        TaggerError::CheckpointLoad(format!("{} is not a valid checkpoint: {e}", path.display()))
    })?;

    let (prefixed, bare): (Vec<_>, Vec<_>) = tensors
        .into_iter()
        .partition(|(name, _)| name.starts_with(STATE_DICT_PREFIX));
    let mut checkpoint: HashMap<String, Tensor> = bare.into_iter().collect();
    let mut shadowed = Vec::new();

    for (name, tensor) in prefixed {
        let stripped = &name[STATE_DICT_PREFIX.len()..];
        if checkpoint.contains_key(stripped) {
            log::warn!("'{}' collides with '{}' in {}, dropping it", name, stripped, path.display());
            shadowed.push(name);
        } else {
            checkpoint.insert(stripped.to_string(), tensor);
        }
    }

    Ok((checkpoint, shadowed))
}

/// Redraw every weight matrix of `varmap`, and the bias next to it, from
/// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` using a generator seeded with `seed`.
///
/// Other rank-1 variables (batch-norm scale, shift, running statistics) keep
/// their values. Returns the number of variables redrawn.
pub fn seed_parameters(varmap: &VarMap, seed: u64) -> Result<usize> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TaggerError::IllegalState("variable map lock poisoned".to_string()))?;

    // HashMap order is unstable, the draw order must not be
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut seeded = 0;
    for name in names {
        let var = &vars[name];
        let fan_in = if var.rank() >= 2 {
            var.dims()[1..].iter().product::<usize>()
        } else {
            let Some(stem) = name.strip_suffix("bias") else {
                continue;
            };
            match vars.get(&format!("{stem}weight")) {
                Some(weight) if weight.rank() >= 2 => weight.dims()[1..].iter().product(),
                _ => continue,
            }
        };
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let values: Vec<f32> = (0..var.elem_count())
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let fresh = Tensor::from_vec(values, var.dims(), &Device::Cpu)?
            .to_dtype(var.dtype())?
            .to_device(var.device())?;
        var.set(&fresh)?;
        seeded += 1;
    }
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tagging-weights-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_state_dict_prefix_is_stripped() {
        let device = Device::Cpu;
        let path = temp_path("prefixed.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "state_dict.weight".to_string(),
            Tensor::full(3f32, (2, 4), &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((2, 4), "weight", Init::Const(0.0)).unwrap();

        let report = load_weights(&varmap, &path).unwrap();
        assert_eq!(report.loaded, vec!["weight".to_string()]);
        assert!(report.is_complete());

        let data = varmap.data().lock().unwrap();
        let values: Vec<f32> = data["weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 3.0));
        drop(data);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_prefixed_key_colliding_with_bare_key_is_reported() {
        let device = Device::Cpu;
        let path = temp_path("colliding.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "state_dict.weight".to_string(),
            Tensor::full(3f32, (2, 4), &device).unwrap(),
        );
        tensors.insert("weight".to_string(), Tensor::full(5f32, (2, 4), &device).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints((2, 4), "weight", Init::Const(0.0)).unwrap();

        let report = load_weights(&varmap, &path).unwrap();
        assert_eq!(report.loaded, vec!["weight".to_string()]);
        assert_eq!(report.unexpected, vec!["state_dict.weight".to_string()]);

        let data = varmap.data().lock().unwrap();
        let values: Vec<f32> = data["weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 5.0));
        drop(data);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_seeded_parameters_are_reproducible() {
        let device = Device::Cpu;
        let build = |seed| {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            vb.get_with_hints((3, 8), "fc.weight", Init::Const(0.0)).unwrap();
            vb.get_with_hints(3, "fc.bias", Init::Const(0.0)).unwrap();
            vb.get_with_hints(3, "bn.weight", Init::Const(1.0)).unwrap();
            vb.get_with_hints(3, "bn.bias", Init::Const(0.0)).unwrap();
            assert_eq!(seed_parameters(&varmap, seed).unwrap(), 2);
            let data = varmap.data().lock().unwrap();
            let flat = |name: &str| -> Vec<f32> { data[name].flatten_all().unwrap().to_vec1().unwrap() };
            (flat("fc.weight"), flat("fc.bias"), flat("bn.weight"), flat("bn.bias"))
        };

        let (weight, bias, bn_scale, bn_shift) = build(123);
        assert_eq!(build(123).0, weight);
        assert_eq!(build(123).1, bias);
        assert_ne!(build(124).0, weight);

        let bound = 1.0 / 8f32.sqrt();
        assert!(weight.iter().chain(&bias).all(|v| v.abs() <= bound));
        assert!(weight.iter().any(|&v| v != 0.0));
        assert_eq!(bn_scale, vec![1.0; 3]);
        assert_eq!(bn_shift, vec![0.0; 3]);
    }

    #[test]
    fn test_corrupt_file_leaves_target_untouched() {
        let device = Device::Cpu;
        let path = temp_path("corrupt.safetensors");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints(4, "weight", Init::Const(1.5)).unwrap();

        let result = load_weights(&varmap, &path);
        assert!(matches!(result, Err(TaggerError::CheckpointLoad(_))));

        let data = varmap.data().lock().unwrap();
        let values: Vec<f32> = data["weight"].to_vec1().unwrap();
        assert_eq!(values, vec![1.5; 4]);
        drop(data);
        std::fs::remove_file(&path).ok();
    }
}

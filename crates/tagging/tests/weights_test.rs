use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::PathBuf;
use tagging::{EncoderAdapter, Head, HeadKind, SampleCnnConfig, TaggerError, load_weights};

fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tagging-{}-{}.safetensors", name, std::process::id()))
}

fn tiny_encoder() -> SampleCnnConfig {
    SampleCnnConfig {
        stem_channels: 4,
        stem_stride: 3,
        block_channels: vec![4, 8],
        pool: 3,
        bn_eps: 1e-5,
    }
}

fn snapshot(varmap: &VarMap) -> HashMap<String, Tensor> {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().copy().unwrap()))
        .collect()
}

fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_head_round_trip_is_exact() {
    let path = temp_file("head-round-trip");
    let source = Head::new(HeadKind::Mlp, 50, &Device::Cpu).unwrap();
    source.save(&path).unwrap();

    let target = Head::new(HeadKind::Mlp, 50, &Device::Cpu).unwrap();
    let report = target.load(&path).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.loaded, vec!["0.weight".to_string(), "2.weight".to_string()]);
    assert!(report.unexpected.is_empty());

    let expected = snapshot(source.varmap());
    let actual = snapshot(target.varmap());
    for (name, tensor) in &expected {
        assert_eq!(flat(tensor), flat(&actual[name]), "{name} differs");
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_mlp_checkpoint_into_linear_head() {
    let path = temp_file("mlp-into-linear");
    Head::new(HeadKind::Mlp, 50, &Device::Cpu).unwrap().save(&path).unwrap();

    let target = Head::new(HeadKind::Linear, 50, &Device::Cpu).unwrap();
    let before = snapshot(target.varmap());
    let report = target.load(&path).unwrap();

    assert!(report.loaded.is_empty());
    assert_eq!(report.missing, vec!["weight".to_string()]);
    assert_eq!(report.unexpected, vec!["0.weight".to_string(), "2.weight".to_string()]);
    assert!(!report.is_complete());
    assert_eq!(flat(&before["weight"]), flat(&snapshot(target.varmap())["weight"]));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_shape_mismatch_is_skipped() {
    let path = temp_file("shape-mismatch");
    Head::new(HeadKind::Linear, 50, &Device::Cpu).unwrap().save(&path).unwrap();

    let target = Head::new(HeadKind::Linear, 10, &Device::Cpu).unwrap();
    let before = snapshot(target.varmap());
    let report = target.load(&path).unwrap();

    assert!(report.loaded.is_empty());
    assert_eq!(report.mismatched, vec![("weight".to_string(), vec![10, 512], vec![50, 512])]);
    assert_eq!(flat(&before["weight"]), flat(&snapshot(target.varmap())["weight"]));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_encoder_checkpoint_with_pretraining_head() {
    let path = temp_file("encoder-pretrained");
    let pretrained = EncoderAdapter::sample_cnn(&tiny_encoder(), false, &Device::Cpu).unwrap();
    let mut tensors = snapshot(pretrained.varmap());
    let n_encoder = tensors.len();
    tensors.insert("head.weight".to_string(), Tensor::ones((128, 512), candle_core::DType::F32, &Device::Cpu).unwrap());
    candle_core::safetensors::save(&tensors, &path).unwrap();

    let target = EncoderAdapter::sample_cnn(&tiny_encoder(), true, &Device::Cpu).unwrap();
    let report = target.load(&path).unwrap();

    assert_eq!(report.loaded.len(), n_encoder);
    assert!(report.missing.is_empty());
    assert_eq!(report.unexpected, vec!["head.weight".to_string()]);

    let loaded = snapshot(target.varmap());
    assert_eq!(
        flat(&tensors["encoder.stem.conv.weight"]),
        flat(&loaded["encoder.stem.conv.weight"])
    );
    assert_eq!(flat(&tensors["encoder.proj.weight"]), flat(&loaded["encoder.proj.weight"]));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_missing_file_is_checkpoint_error() {
    let varmap = VarMap::new();
    let result = load_weights(&varmap, "/nonexistent/encoder.safetensors");
    assert!(matches!(result, Err(TaggerError::CheckpointLoad(_))));
}

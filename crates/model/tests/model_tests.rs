use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use vit_model::{ViTConfig, VisionTransformer};

const IMG: usize = 8;

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, IMG, IMG), &Device::Cpu)?)
}

#[test]
fn forward_produces_logits_and_attention_maps() -> Result<()> {
    let model = VisionTransformer::new(ViTConfig::testing(), IMG, 10, false, &Device::Cpu)?;
    let (logits, attention) = model.forward(&images(2)?)?;

    assert_eq!(logits.dims(), &[2, 10]);
    assert_eq!(logits.dtype(), DType::F32);
    assert_eq!(attention.len(), 1);
    // 2x2 patches plus the class token
    assert_eq!(attention[0].dims(), &[2, 2, 5, 5]);
    Ok(())
}

#[test]
fn zero_head_starts_with_zero_logits() -> Result<()> {
    let model = VisionTransformer::new(ViTConfig::testing(), IMG, 10, true, &Device::Cpu)?;
    let (logits, _) = model.forward(&images(3)?)?;
    let max = logits.abs()?.max_keepdim(1)?.max_keepdim(0)?.flatten_all()?;
    assert_eq!(max.to_vec1::<f32>()?, vec![0.0]);
    Ok(())
}

#[test]
fn rejects_wrong_image_size() -> Result<()> {
    let model = VisionTransformer::new(ViTConfig::testing(), IMG, 10, true, &Device::Cpu)?;
    let wrong = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&wrong).is_err());
    Ok(())
}

#[test]
fn frozen_backbone_only_exposes_head() -> Result<()> {
    let mut model = VisionTransformer::new(ViTConfig::testing(), IMG, 10, true, &Device::Cpu)?;
    let all = model.parameters().len();
    assert_eq!(model.trainable_parameters().len(), all);

    model.set_backbone_frozen(true);
    let trainable: Vec<String> = model
        .trainable_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(trainable, vec!["head.bias".to_string(), "head.weight".to_string()]);
    Ok(())
}

#[test]
fn safetensors_backbone_round_trip_skips_head() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("backbone.safetensors");

    let source = VisionTransformer::new(ViTConfig::testing(), IMG, 10, false, &Device::Cpu)?;
    let tensors: HashMap<String, Tensor> = source
        .parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, &path)?;

    let target = VisionTransformer::new(ViTConfig::testing(), IMG, 10, true, &Device::Cpu)?;
    let applied = target.load_pretrained(&path)?;
    assert_eq!(applied, source.parameters().len() - 2);

    let src_cls = source
        .parameters()
        .into_iter()
        .find(|(name, _)| name == "embeddings.position_embeddings")
        .map(|(_, var)| var.as_tensor().flatten_all())
        .transpose()?
        .unwrap();
    let dst_cls = target
        .parameters()
        .into_iter()
        .find(|(name, _)| name == "embeddings.position_embeddings")
        .map(|(_, var)| var.as_tensor().flatten_all())
        .transpose()?
        .unwrap();
    assert_eq!(src_cls.to_vec1::<f32>()?, dst_cls.to_vec1::<f32>()?);

    let head = target
        .parameters()
        .into_iter()
        .find(|(name, _)| name == "head.weight")
        .map(|(_, var)| var.as_tensor().abs().and_then(|t| t.sum_all()))
        .transpose()?
        .unwrap();
    assert_eq!(head.to_vec0::<f32>()?, 0.0);
    Ok(())
}

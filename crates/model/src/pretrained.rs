//! Pretrained backbone readers.
//!
//! Two layouts are understood: the `.npz` archives published with the
//! original JAX ViT release (`Transformer/encoderblock_{i}/...`, kernels stored
//! input-major), and `.safetensors` files written with this crate's own
//! parameter names. Classification-head tensors are always discarded so the
//! task head keeps its zero initialization.

use std::{collections::HashMap, path::Path};

use candle_core::{Device, Error, Result, Tensor};

use crate::config::ViTConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Identity,
    /// `[in, out]` dense kernel to `[out, in]`.
    Dense,
    /// `[h, w, in, out]` conv kernel to `[out, in, h, w]`.
    Conv,
    /// `[hidden, heads, head_dim]` projection kernel to `[hidden, hidden]`.
    AttentionIn,
    /// `[heads, head_dim, hidden]` output kernel to `[hidden, hidden]`.
    AttentionOut,
    /// Any bias that needs flattening to `[hidden]`.
    Flatten,
}

pub(crate) fn read_backbone(
    path: &Path,
    cfg: &ViTConfig,
    img_size: usize,
) -> Result<HashMap<String, Tensor>> {
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let mut tensors = match extension {
        "npz" => {
            let mut mapped = HashMap::new();
            for (name, tensor) in Tensor::read_npz(path)? {
                let Some((local, layout)) = map_jax_name(&name) else {
                    continue;
                };
                mapped.insert(local, convert(tensor, layout, cfg.hidden_size)?);
            }
            mapped
        }
        "safetensors" => candle_core::safetensors::load(path, &Device::Cpu)?,
        other => {
            return Err(Error::Msg(format!(
                "unsupported pretrained checkpoint format '{other}' ({})",
                path.display()
            )))
        }
    };

    tensors.retain(|name, _| !name.starts_with("head."));

    if let Some(posemb) = tensors.remove(POSITION_KEY) {
        let grid = cfg.grid_size(img_size);
        tensors.insert(POSITION_KEY.to_string(), resize_position_embeddings(posemb, grid)?);
    }

    if tensors.is_empty() {
        return Err(Error::Msg(format!(
            "no backbone tensors found in {}",
            path.display()
        )));
    }
    Ok(tensors)
}

const POSITION_KEY: &str = "embeddings.position_embeddings";

fn map_jax_name(name: &str) -> Option<(String, Layout)> {
    match name {
        "embedding/kernel" => {
            return Some(("embeddings.patch_embeddings.weight".into(), Layout::Conv))
        }
        "embedding/bias" => {
            return Some(("embeddings.patch_embeddings.bias".into(), Layout::Identity))
        }
        "cls" => return Some(("embeddings.cls_token".into(), Layout::Identity)),
        "Transformer/posembed_input/pos_embedding" => {
            return Some((POSITION_KEY.into(), Layout::Identity))
        }
        "Transformer/encoder_norm/scale" => {
            return Some(("encoder.encoder_norm.weight".into(), Layout::Identity))
        }
        "Transformer/encoder_norm/bias" => {
            return Some(("encoder.encoder_norm.bias".into(), Layout::Identity))
        }
        _ => {}
    }

    let rest = name.strip_prefix("Transformer/encoderblock_")?;
    let (index, rest) = rest.split_once('/')?;
    let index: usize = index.parse().ok()?;
    let prefix = format!("encoder.layer.{index}");

    let (module, param) = rest.rsplit_once('/')?;
    let suffix = match param {
        "kernel" | "scale" => "weight",
        "bias" => "bias",
        _ => return None,
    };
    let is_kernel = param == "kernel";

    let (local, layout) = match module {
        "LayerNorm_0" => ("attention_norm".to_string(), Layout::Identity),
        "LayerNorm_2" => ("ffn_norm".to_string(), Layout::Identity),
        "MlpBlock_3/Dense_0" => ("ffn.fc1".to_string(), dense_layout(is_kernel)),
        "MlpBlock_3/Dense_1" => ("ffn.fc2".to_string(), dense_layout(is_kernel)),
        other => {
            let projection = other.strip_prefix("MultiHeadDotProductAttention_1/")?;
            let layout = match (projection, is_kernel) {
                ("query" | "key" | "value", true) => Layout::AttentionIn,
                ("out", true) => Layout::AttentionOut,
                ("query" | "key" | "value", false) => Layout::Flatten,
                ("out", false) => Layout::Identity,
                _ => return None,
            };
            (format!("attn.{projection}"), layout)
        }
    };
    Some((format!("{prefix}.{local}.{suffix}"), layout))
}

fn dense_layout(is_kernel: bool) -> Layout {
    if is_kernel {
        Layout::Dense
    } else {
        Layout::Identity
    }
}

fn convert(tensor: Tensor, layout: Layout, hidden: usize) -> Result<Tensor> {
    match layout {
        Layout::Identity => Ok(tensor),
        Layout::Dense => tensor.t()?.contiguous(),
        Layout::Conv => tensor.permute((3, 2, 0, 1))?.contiguous(),
        Layout::AttentionIn => tensor.reshape((hidden, hidden))?.t()?.contiguous(),
        Layout::AttentionOut => tensor.reshape((hidden, hidden))?.t()?.contiguous(),
        Layout::Flatten => tensor.reshape(hidden),
    }
}

/// Resamples `[1, 1 + g*g, hidden]` position embeddings to a `grid x grid`
/// patch layout, keeping the class-token slot untouched.
fn resize_position_embeddings(posemb: Tensor, grid: usize) -> Result<Tensor> {
    let (_, tokens, hidden) = posemb.dims3()?;
    if tokens == grid * grid + 1 {
        return Ok(posemb);
    }
    let old_grid = ((tokens - 1) as f64).sqrt() as usize;
    if old_grid * old_grid + 1 != tokens {
        return Err(Error::Msg(format!(
            "cannot resize position embeddings with {tokens} tokens"
        )));
    }
    log::info!(
        "resizing position embeddings from {}x{} to {}x{}",
        old_grid,
        old_grid,
        grid,
        grid
    );
    let cls = posemb.narrow(1, 0, 1)?;
    let patches = posemb
        .narrow(1, 1, tokens - 1)?
        .reshape((1, old_grid, old_grid, hidden))?
        .permute((0, 3, 1, 2))?
        .contiguous()?
        .upsample_nearest2d(grid, grid)?
        .permute((0, 2, 3, 1))?
        .reshape((1, grid * grid, hidden))?;
    Tensor::cat(&[&cls, &patches], 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_encoder_block_names() {
        assert_eq!(
            map_jax_name("Transformer/encoderblock_3/MultiHeadDotProductAttention_1/query/kernel"),
            Some((
                "encoder.layer.3.attn.query.weight".to_string(),
                Layout::AttentionIn
            ))
        );
        assert_eq!(
            map_jax_name("Transformer/encoderblock_0/MlpBlock_3/Dense_1/bias"),
            Some(("encoder.layer.0.ffn.fc2.bias".to_string(), Layout::Identity))
        );
        assert_eq!(
            map_jax_name("Transformer/encoderblock_11/LayerNorm_2/scale"),
            Some(("encoder.layer.11.ffn_norm.weight".to_string(), Layout::Identity))
        );
        assert_eq!(map_jax_name("head/kernel"), None);
        assert_eq!(map_jax_name("pre_logits/kernel"), None);
    }

    #[test]
    fn attention_kernel_becomes_output_major() {
        let hidden = 4;
        // [hidden, heads=2, head_dim=2]
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let kernel = Tensor::from_vec(data, (hidden, 2, 2), &Device::Cpu).unwrap();
        let weight = convert(kernel, Layout::AttentionIn, hidden).unwrap();
        let rows = weight.to_vec2::<f32>().unwrap();
        // weight[out][in] == kernel[in][out]
        assert_eq!(rows[1][0], 1.0);
        assert_eq!(rows[0][1], 4.0);
    }

    #[test]
    fn position_embeddings_resize_keeps_class_token() {
        let posemb = Tensor::arange(0f32, 5.0 * 2.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 5, 2))
            .unwrap();
        let resized = resize_position_embeddings(posemb, 4).unwrap();
        assert_eq!(resized.dims(), &[1, 17, 2]);
        let values = resized.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(values[0], vec![0.0, 1.0]);
        assert_eq!(values[1], vec![2.0, 3.0]);
    }
}

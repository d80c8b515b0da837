use candle_core::{Device, Tensor, Var};
use vit_model::{ViTConfig, VisionTransformer};

use crate::{config::TrainingConfig, loss::to_runtime_error, TrainingError};

/// The model surface the trainer drives: `images -> (logits, auxiliary)`,
/// a train/eval switch and the parameters the optimizer may update.
pub trait ImageClassifier {
    fn forward(&self, images: &Tensor) -> candle_core::Result<(Tensor, Vec<Tensor>)>;
    fn set_training(&self, training: bool);
    fn is_training(&self) -> bool;
    fn num_classes(&self) -> usize;
    /// Every parameter, sorted by name. Used for checkpoints.
    fn named_parameters(&self) -> Vec<(String, Var)>;
    /// Subset updated by the optimizer.
    fn trainable_parameters(&self) -> Vec<(String, Var)>;
}

impl ImageClassifier for VisionTransformer {
    fn forward(&self, images: &Tensor) -> candle_core::Result<(Tensor, Vec<Tensor>)> {
        VisionTransformer::forward(self, images)
    }

    fn set_training(&self, training: bool) {
        VisionTransformer::set_training(self, training)
    }

    fn is_training(&self) -> bool {
        VisionTransformer::is_training(self)
    }

    fn num_classes(&self) -> usize {
        VisionTransformer::num_classes(self)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameters()
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        VisionTransformer::trainable_parameters(self)
    }
}

/// Builds the ViT described by `config.model`, loading the pretrained
/// backbone when one is configured.
pub fn build_model(config: &TrainingConfig, device: &Device) -> Result<VisionTransformer, TrainingError> {
    let vit = ViTConfig::named(&config.model.name).ok_or_else(|| {
        TrainingError::initialization(format!("unknown model '{}'", config.model.name))
    })?;
    let mut model = VisionTransformer::new(
        vit,
        config.data.img_size,
        config.num_classes(),
        config.model.zero_head,
        device,
    )
    .map_err(|err| TrainingError::initialization(err.to_string()))?;

    if let Some(path) = &config.model.pretrained {
        model.load_pretrained(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load pretrained weights from {}: {}",
                path.display(),
                err
            ))
        })?;
    } else {
        log::warn!("no pretrained backbone configured; training {} from scratch", config.model.name);
    }

    if config.model.freeze_backbone {
        model.set_backbone_frozen(true);
        log::info!("backbone frozen; only the classification head is trained");
    }
    Ok(model)
}

/// Total element count over `params`.
pub fn count_parameters(params: &[(String, Var)]) -> usize {
    params
        .iter()
        .map(|(_, var)| var.as_tensor().elem_count())
        .sum()
}

/// Copies checkpointed tensors into the model's parameters by name.
pub fn assign_parameters<M>(
    model: &M,
    tensors: &std::collections::HashMap<String, Tensor>,
) -> Result<usize, TrainingError>
where
    M: ImageClassifier + ?Sized,
{
    let mut applied = 0usize;
    for (name, var) in model.named_parameters() {
        let tensor = tensors.get(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint is missing parameter '{}'", name))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter '{}' has shape {:?}, model expects {:?}",
                name,
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_device(var.as_tensor().device())
            .and_then(|t| t.to_dtype(var.as_tensor().dtype()))
            .map_err(to_runtime_error)?;
        var.set(&tensor).map_err(to_runtime_error)?;
        applied += 1;
    }
    Ok(applied)
}

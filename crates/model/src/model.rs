use std::{cell::Cell, collections::HashMap, path::Path};

use candle_core::{DType, Device, Error, IndexOp, Module, Result, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Init, Linear, ModuleT, VarBuilder, VarMap};

use crate::{block::Encoder, config::ViTConfig, pretrained};

const HEAD_PREFIX: &str = "head.";

/// Patch projection, class token and learned position embeddings.
#[derive(Debug)]
struct Embeddings {
    patch_embeddings: Conv2d,
    cls_token: Tensor,
    position_embeddings: Tensor,
    dropout: Dropout,
}

impl Embeddings {
    fn new(cfg: &ViTConfig, img_size: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embeddings = candle_nn::conv2d(
            3,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embeddings"),
        )?;
        let grid = cfg.grid_size(img_size);
        let cls_token = vb.get_with_hints((1, 1, cfg.hidden_size), "cls_token", Init::Const(0.0))?;
        let position_embeddings = vb.get_with_hints(
            (1, grid * grid + 1, cfg.hidden_size),
            "position_embeddings",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            patch_embeddings,
            cls_token,
            position_embeddings,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn forward(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let batch = images.dim(0)?;
        // [batch, hidden, grid, grid] -> [batch, grid*grid, hidden]
        let patches = self
            .patch_embeddings
            .forward(images)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let hidden = patches.dim(2)?;
        let cls = self.cls_token.broadcast_as((batch, 1, hidden))?;
        let tokens = Tensor::cat(&[&cls, &patches], 1)?;
        let tokens = tokens.broadcast_add(&self.position_embeddings)?;
        self.dropout.forward_t(&tokens, train)
    }
}

/// Vision Transformer image classifier with a task-specific linear head.
pub struct VisionTransformer {
    config: ViTConfig,
    img_size: usize,
    num_classes: usize,
    varmap: VarMap,
    device: Device,
    embeddings: Embeddings,
    encoder: Encoder,
    head: Linear,
    training: Cell<bool>,
    backbone_frozen: bool,
}

impl VisionTransformer {
    /// Builds the model with freshly initialized parameters on `device`.
    ///
    /// When `zero_head` is set the classification head starts at zero, which
    /// is the usual starting point for fine-tuning a pretrained backbone.
    pub fn new(
        config: ViTConfig,
        img_size: usize,
        num_classes: usize,
        zero_head: bool,
        device: &Device,
    ) -> Result<Self> {
        config.validate(img_size)?;
        if num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embeddings = Embeddings::new(&config, img_size, vb.pp("embeddings"))?;
        let encoder = Encoder::new(&config, vb.pp("encoder"))?;

        let head_vb = vb.pp("head");
        let head = if zero_head {
            let weight = head_vb.get_with_hints(
                (num_classes, config.hidden_size),
                "weight",
                Init::Const(0.0),
            )?;
            let bias = head_vb.get_with_hints(num_classes, "bias", Init::Const(0.0))?;
            Linear::new(weight, Some(bias))
        } else {
            candle_nn::linear(config.hidden_size, num_classes, head_vb)?
        };

        Ok(Self {
            config,
            img_size,
            num_classes,
            varmap,
            device: device.clone(),
            embeddings,
            encoder,
            head,
            training: Cell::new(true),
            backbone_frozen: false,
        })
    }

    pub fn config(&self) -> &ViTConfig {
        &self.config
    }

    pub fn img_size(&self) -> usize {
        self.img_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Restricts gradient flow to the classification head.
    pub fn set_backbone_frozen(&mut self, frozen: bool) {
        self.backbone_frozen = frozen;
    }

    pub fn backbone_frozen(&self) -> bool {
        self.backbone_frozen
    }

    /// Returns `(logits [batch, num_classes], attention maps per layer)`.
    pub fn forward(&self, images: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let dims = images.dims();
        if dims.len() != 4 || dims[1] != 3 || dims[2] != self.img_size || dims[3] != self.img_size
        {
            return Err(Error::Msg(format!(
                "expected images shaped [batch, 3, {size}, {size}] got {:?}",
                dims,
                size = self.img_size
            )));
        }
        let train = self.is_training();
        let tokens = self.embeddings.forward(images, train)?;
        let (encoded, attention_maps) = self.encoder.forward(&tokens, train)?;
        let mut features = encoded.i((.., 0))?;
        if self.backbone_frozen {
            features = features.detach();
        }
        let logits = self.head.forward(&features)?;
        Ok((logits, attention_maps))
    }

    /// Every parameter keyed by its dotted path, sorted by name.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    /// Parameters that receive optimizer updates.
    pub fn trainable_parameters(&self) -> Vec<(String, Var)> {
        let frozen = self.backbone_frozen;
        self.parameters()
            .into_iter()
            .filter(|(name, _)| !frozen || name.starts_with(HEAD_PREFIX))
            .collect()
    }

    /// Overwrites parameters with same-named tensors; names absent from
    /// `tensors` keep their current values. Returns the number of tensors applied.
    pub fn assign(&self, tensors: HashMap<String, Tensor>) -> Result<usize> {
        let mut applied = 0usize;
        let mut remaining = tensors;
        for (name, var) in self.parameters() {
            let Some(tensor) = remaining.remove(&name) else {
                continue;
            };
            let target = var.as_tensor();
            if tensor.dims() != target.dims() {
                return Err(Error::Msg(format!(
                    "shape mismatch for {name}: checkpoint {:?} vs model {:?}",
                    tensor.dims(),
                    target.dims()
                )));
            }
            let tensor = tensor.to_device(&self.device)?.to_dtype(target.dtype())?;
            var.set(&tensor)?;
            applied += 1;
        }
        if !remaining.is_empty() {
            let mut extra: Vec<_> = remaining.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "unknown parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(applied)
    }

    /// Loads a pretrained backbone from `.npz` (original JAX layout) or
    /// `.safetensors` (this crate's naming). Head tensors are ignored.
    pub fn load_pretrained(&self, path: &Path) -> Result<usize> {
        let tensors = pretrained::read_backbone(path, &self.config, self.img_size)?;
        let applied = self.assign(tensors)?;
        log::info!(
            "loaded {} pretrained tensor(s) from {}",
            applied,
            path.display()
        );
        Ok(applied)
    }
}

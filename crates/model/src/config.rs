use candle_core::{Error, Result};

/// Structural hyperparameters of a Vision Transformer backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct ViTConfig {
    pub patch_size: usize,
    pub hidden_size: usize,
    pub mlp_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub attention_dropout: f32,
    pub dropout: f32,
    pub layer_norm_eps: f64,
}

/// Names accepted by [`ViTConfig::named`].
pub const KNOWN_MODELS: &[&str] = &[
    "ViT-B_16",
    "ViT-B_32",
    "ViT-L_16",
    "ViT-L_32",
    "ViT-H_14",
    "ViT-B_16-h2",
    "ViT-B_16-h4",
    "ViT-B_16-h8",
    "ViT-B_16-h12",
    "ViT-B_16-h16",
    "ViT-B_16-h32",
    "testing",
];

impl ViTConfig {
    pub fn b16() -> Self {
        Self {
            patch_size: 16,
            hidden_size: 768,
            mlp_dim: 3072,
            num_heads: 12,
            num_layers: 12,
            attention_dropout: 0.0,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    pub fn b32() -> Self {
        Self {
            patch_size: 32,
            ..Self::b16()
        }
    }

    pub fn l16() -> Self {
        Self {
            patch_size: 16,
            hidden_size: 1024,
            mlp_dim: 4096,
            num_heads: 16,
            num_layers: 24,
            attention_dropout: 0.0,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    pub fn l32() -> Self {
        Self {
            patch_size: 32,
            ..Self::l16()
        }
    }

    pub fn h14() -> Self {
        Self {
            patch_size: 14,
            hidden_size: 1280,
            mlp_dim: 5120,
            num_heads: 16,
            num_layers: 32,
            attention_dropout: 0.0,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    /// Minimal configuration for tests and smoke runs.
    pub fn testing() -> Self {
        Self {
            patch_size: 4,
            hidden_size: 8,
            mlp_dim: 16,
            num_heads: 2,
            num_layers: 1,
            attention_dropout: 0.0,
            dropout: 0.0,
            layer_norm_eps: 1e-6,
        }
    }

    /// Resolves a configuration by its published name, e.g. `ViT-B_16` or
    /// the head-count variant `ViT-B_16-h8`.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "ViT-B_16" => Some(Self::b16()),
            "ViT-B_32" => Some(Self::b32()),
            "ViT-L_16" => Some(Self::l16()),
            "ViT-L_32" => Some(Self::l32()),
            "ViT-H_14" => Some(Self::h14()),
            "testing" => Some(Self::testing()),
            other => {
                let heads = other.strip_prefix("ViT-B_16-h")?.parse::<usize>().ok()?;
                if !matches!(heads, 2 | 4 | 8 | 12 | 16 | 32) {
                    return None;
                }
                Some(Self {
                    num_heads: heads,
                    ..Self::b16()
                })
            }
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }

    /// Number of patches along one side of a square `img_size` input.
    pub fn grid_size(&self, img_size: usize) -> usize {
        img_size / self.patch_size.max(1)
    }

    pub fn validate(&self, img_size: usize) -> Result<()> {
        if self.patch_size == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(Error::Msg(
                "patch_size, hidden_size and num_layers must be greater than zero".into(),
            ));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if img_size == 0 || img_size % self.patch_size != 0 {
            return Err(Error::Msg(format!(
                "img_size ({}) must be a positive multiple of patch_size ({})",
                img_size, self.patch_size
            )));
        }
        for (label, p) in [
            ("attention_dropout", self.attention_dropout),
            ("dropout", self.dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{label} must be in [0, 1)")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_head_variants() {
        let cfg = ViTConfig::named("ViT-B_16-h4").unwrap();
        assert_eq!(cfg.num_heads, 4);
        assert_eq!(cfg.hidden_size, 768);
        assert!(ViTConfig::named("ViT-B_16-h5").is_none());
        assert!(ViTConfig::named("R50-ViT-B_16").is_none());
    }

    #[test]
    fn every_known_name_resolves() {
        for name in KNOWN_MODELS {
            assert!(ViTConfig::named(name).is_some(), "{name}");
        }
    }

    #[test]
    fn rejects_unaligned_image_size() {
        assert!(ViTConfig::b16().validate(224).is_ok());
        assert!(ViTConfig::b16().validate(200).is_err());
    }
}

//! Model manifest parsing and the resolved descriptor.
//!
//! The manifest is the JSON record handed to `load_model`; extras are
//! ignored. [`ModelDescriptor`] is the validated, immutable form every other
//! component derives its shapes from.

use candle_core::DType;
use serde::Deserialize;

use doppler_runtime::kernels::RopeScaling;
use doppler_runtime::ElementType;
use doppler_tokenizer::config::TokenizerConfig;

use crate::attention::AttentionKernel;
use crate::kv::KvLayout;
use crate::{ModelError, Result};

/// Dense FFN activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    /// SwiGLU gate.
    #[default]
    Silu,
    /// GeGLU gate.
    Gelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeScalingType {
    Linear,
    Yarn,
    Ntk,
}

/// Type-specific rope scaling parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScalingParams {
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub original_max_len: Option<usize>,
    #[serde(default)]
    pub beta_fast: Option<f64>,
    #[serde(default)]
    pub beta_slow: Option<f64>,
}

/// Chat template fragments wrapped around a raw prompt when
/// `use_chat_template` is requested.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatTemplate {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

fn default_rms_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_one() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// The raw manifest record. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    #[serde(default)]
    pub num_kv_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,

    #[serde(default = "default_rms_eps")]
    pub rms_norm_eps: f64,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_one")]
    pub rope_scale: f64,
    #[serde(default)]
    pub rope_scaling_type: Option<RopeScalingType>,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingParams>,

    #[serde(default)]
    pub sliding_window: Option<usize>,

    #[serde(default)]
    pub num_experts: Option<usize>,
    #[serde(default)]
    pub moe_top_k: Option<usize>,
    #[serde(default)]
    pub expert_intermediate_size: Option<usize>,
    #[serde(default = "default_true")]
    pub moe_renormalize: bool,

    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
    #[serde(default)]
    pub attention_kernel: Option<AttentionKernel>,
    #[serde(default)]
    pub is_gemma: bool,
    #[serde(default)]
    pub hidden_act: HiddenAct,

    /// Paged KV layout when set; sliding window wins if both are present.
    #[serde(default)]
    pub kv_page_size: Option<usize>,
    #[serde(default)]
    pub kv_dtype: Option<ElementType>,

    #[serde(default)]
    pub chat_template: Option<ChatTemplate>,

    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Nested descriptor for speculative decoding.
    #[serde(default)]
    pub draft_model: Option<Box<ModelManifest>>,
}

/// Mixture-of-experts shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoeSpec {
    pub num_experts: usize,
    pub top_k: usize,
    pub expert_intermediate_size: usize,
    pub renormalize: bool,
}

/// Validated, immutable model shape record. All tensor shapes derived
/// elsewhere refer back to this.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub rope_scaling: RopeScaling,
    pub sliding_window: Option<usize>,
    pub moe: Option<MoeSpec>,
    pub stop_token_ids: Vec<u32>,
    pub attention_kernel: Option<AttentionKernel>,
    /// Gemma family: multiply embeddings by sqrt(hidden_size).
    pub scale_embeddings: bool,
    /// Gemma family: RMSNorm weights are stored as `w - 1`.
    pub norm_weight_offset: bool,
    pub hidden_act: HiddenAct,
    pub kv_layout: KvLayout,
    pub kv_dtype: DType,
    pub chat_template: Option<ChatTemplate>,
    pub tokenizer: TokenizerConfig,
    pub draft: Option<Box<ModelDescriptor>>,
}

impl ModelManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ModelError::InvalidManifest(e.to_string()))
    }

    /// Validate and resolve derived fields.
    pub fn resolve(&self) -> Result<ModelDescriptor> {
        let num_kv_heads = self.num_kv_heads.unwrap_or(self.num_heads);
        if num_kv_heads == 0 || self.num_heads % num_kv_heads != 0 {
            return Err(ModelError::InvalidManifest(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, num_kv_heads
            )));
        }
        let head_dim = self.head_dim.unwrap_or(self.hidden_size / self.num_heads);
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(ModelError::InvalidManifest(format!(
                "head_dim must be even, got {head_dim}"
            )));
        }
        if self.num_layers == 0 || self.vocab_size == 0 || self.max_seq_len == 0 {
            return Err(ModelError::InvalidManifest(
                "num_layers, vocab_size and max_seq_len must be non-zero".to_string(),
            ));
        }

        let moe = match self.num_experts {
            Some(num_experts) => {
                let top_k = self.moe_top_k.unwrap_or(2);
                if top_k == 0 || top_k > num_experts {
                    return Err(ModelError::InvalidManifest(format!(
                        "moe_top_k ({top_k}) must be in 1..={num_experts}"
                    )));
                }
                Some(MoeSpec {
                    num_experts,
                    top_k,
                    expert_intermediate_size: self
                        .expert_intermediate_size
                        .unwrap_or(self.intermediate_size),
                    renormalize: self.moe_renormalize,
                })
            }
            None => None,
        };

        let kv_layout = if let Some(window) = self.sliding_window {
            if window == 0 {
                return Err(ModelError::InvalidManifest(
                    "sliding_window must be non-zero".to_string(),
                ));
            }
            KvLayout::SlidingWindow { window }
        } else if let Some(page_size) = self.kv_page_size {
            if page_size == 0 {
                return Err(ModelError::InvalidManifest(
                    "kv_page_size must be non-zero".to_string(),
                ));
            }
            KvLayout::Paged { page_size }
        } else {
            KvLayout::Contiguous
        };

        let kv_dtype = match self.kv_dtype {
            None => DType::F32,
            Some(t) => t.dense_dtype().ok_or_else(|| {
                ModelError::InvalidManifest(format!("kv_dtype {t} is not a dense dtype"))
            })?,
        };

        let draft = match &self.draft_model {
            Some(inner) => Some(Box::new(inner.resolve()?)),
            None => None,
        };

        Ok(ModelDescriptor {
            num_layers: self.num_layers,
            hidden_size: self.hidden_size,
            num_heads: self.num_heads,
            num_kv_heads,
            head_dim,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            max_seq_len: self.max_seq_len,
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            rope_scaling: self.resolve_rope_scaling()?,
            sliding_window: self.sliding_window,
            moe,
            stop_token_ids: self.stop_token_ids.clone(),
            attention_kernel: self.attention_kernel,
            scale_embeddings: self.is_gemma,
            norm_weight_offset: self.is_gemma,
            hidden_act: self.hidden_act,
            kv_layout,
            kv_dtype,
            chat_template: self.chat_template.clone(),
            tokenizer: self.tokenizer.clone(),
            draft,
        })
    }

    fn resolve_rope_scaling(&self) -> Result<RopeScaling> {
        let params = self.rope_scaling.clone().unwrap_or_default();
        let factor = params.factor.unwrap_or(self.rope_scale);

        match self.rope_scaling_type {
            None => {
                if (self.rope_scale - 1.0).abs() > f64::EPSILON {
                    Ok(RopeScaling::Linear {
                        factor: self.rope_scale,
                    })
                } else {
                    Ok(RopeScaling::None)
                }
            }
            Some(RopeScalingType::Linear) => Ok(RopeScaling::Linear { factor }),
            Some(RopeScalingType::Ntk) => Ok(RopeScaling::Ntk { factor }),
            Some(RopeScalingType::Yarn) => {
                let original_max_len = params.original_max_len.ok_or_else(|| {
                    ModelError::InvalidManifest(
                        "yarn scaling requires rope_scaling.original_max_len".to_string(),
                    )
                })?;
                Ok(RopeScaling::Yarn {
                    factor,
                    original_max_len,
                    beta_fast: params.beta_fast.unwrap_or(32.0),
                    beta_slow: params.beta_slow.unwrap_or(1.0),
                })
            }
        }
    }
}

impl ModelDescriptor {
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "num_layers": 2,
            "hidden_size": 8,
            "num_heads": 2,
            "intermediate_size": 16,
            "vocab_size": 32,
            "max_seq_len": 64,
        })
    }

    #[test]
    fn test_minimal_manifest_resolves() {
        let manifest = ModelManifest::from_json(&minimal_json().to_string()).unwrap();
        let d = manifest.resolve().unwrap();
        assert_eq!(d.num_kv_heads, 2);
        assert_eq!(d.head_dim, 4);
        assert_eq!(d.kv_layout, KvLayout::Contiguous);
        assert_eq!(d.kv_dtype, DType::F32);
        assert!(matches!(d.rope_scaling, RopeScaling::None));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut json = minimal_json();
        json["totally_new_field"] = serde_json::json!({"a": 1});
        assert!(ModelManifest::from_json(&json.to_string()).is_ok());
    }

    #[test]
    fn test_gqa_divisibility_enforced() {
        let mut json = minimal_json();
        json["num_heads"] = serde_json::json!(4);
        json["num_kv_heads"] = serde_json::json!(3);
        let manifest = ModelManifest::from_json(&json.to_string()).unwrap();
        assert!(matches!(
            manifest.resolve(),
            Err(ModelError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_sliding_window_wins_over_paged() {
        let mut json = minimal_json();
        json["sliding_window"] = serde_json::json!(16);
        json["kv_page_size"] = serde_json::json!(8);
        let d = ModelManifest::from_json(&json.to_string())
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(d.kv_layout, KvLayout::SlidingWindow { window: 16 });
    }

    #[test]
    fn test_moe_spec_defaults() {
        let mut json = minimal_json();
        json["num_experts"] = serde_json::json!(4);
        let d = ModelManifest::from_json(&json.to_string())
            .unwrap()
            .resolve()
            .unwrap();
        let moe = d.moe.unwrap();
        assert_eq!(moe.top_k, 2);
        assert_eq!(moe.expert_intermediate_size, 16);
        assert!(moe.renormalize);
    }

    #[test]
    fn test_yarn_requires_original_len() {
        let mut json = minimal_json();
        json["rope_scaling_type"] = serde_json::json!("yarn");
        json["rope_scaling"] = serde_json::json!({"factor": 4.0});
        let manifest = ModelManifest::from_json(&json.to_string()).unwrap();
        assert!(manifest.resolve().is_err());
    }

    #[test]
    fn test_draft_model_resolves_recursively() {
        let mut json = minimal_json();
        json["draft_model"] = minimal_json();
        let d = ModelManifest::from_json(&json.to_string())
            .unwrap()
            .resolve()
            .unwrap();
        assert!(d.draft.is_some());
        assert_eq!(d.draft.unwrap().num_layers, 2);
    }
}

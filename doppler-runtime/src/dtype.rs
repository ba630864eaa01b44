//! Dtype and layout metadata for device buffers.

use candle_core::quantized::GgmlDType;
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Element type of a weight or activation buffer.
///
/// Dense types map 1:1 onto candle dtypes; the quantized types are stored as
/// GGML block formats and only ever appear on weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    Bf16,
    Q4,
    Q4k,
    Q8,
}

impl ElementType {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Q4 | Self::Q4k | Self::Q8)
    }

    /// The candle dtype for dense element types.
    pub fn dense_dtype(&self) -> Option<DType> {
        match self {
            Self::F32 => Some(DType::F32),
            Self::F16 => Some(DType::F16),
            Self::Bf16 => Some(DType::BF16),
            _ => None,
        }
    }

    /// The GGML block format for quantized element types.
    pub fn ggml_dtype(&self) -> Option<GgmlDType> {
        match self {
            Self::Q4 => Some(GgmlDType::Q4_0),
            Self::Q4k => Some(GgmlDType::Q4K),
            Self::Q8 => Some(GgmlDType::Q8_0),
            _ => None,
        }
    }

    /// Bytes per element for dense types (quantized formats are block-packed).
    pub fn dense_size(&self) -> Option<usize> {
        match self {
            Self::F32 => Some(4),
            Self::F16 | Self::Bf16 => Some(2),
            _ => None,
        }
    }

    pub fn from_dense(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Self::F32),
            DType::F16 => Some(Self::F16),
            DType::BF16 => Some(Self::Bf16),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::Q4 => "q4",
            Self::Q4k => "q4k",
            Self::Q8 => "q8",
        };
        f.write_str(s)
    }
}

/// Storage order of a 2-D weight.
///
/// `Row` is `[out, in]` (the safetensors convention), `Column` is `[in, out]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Row,
    Column,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_mapping() {
        assert_eq!(ElementType::F16.dense_dtype(), Some(DType::F16));
        assert_eq!(ElementType::F16.dense_size(), Some(2));
        assert!(!ElementType::Bf16.is_quantized());
    }

    #[test]
    fn test_quantized_mapping() {
        assert!(ElementType::Q4k.is_quantized());
        assert_eq!(ElementType::Q4k.dense_dtype(), None);
        assert_eq!(ElementType::Q8.ggml_dtype(), Some(GgmlDType::Q8_0));
    }

    #[test]
    fn test_serde_names() {
        let t: ElementType = serde_json::from_str("\"q4k\"").unwrap();
        assert_eq!(t, ElementType::Q4k);
        let l: Layout = serde_json::from_str("\"column\"").unwrap();
        assert_eq!(l, Layout::Column);
    }
}

//! Data types for tensor and cache elements

use std::fmt;

/// Supported data types for query tensors and cache storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Convert from the `torch_dtype` string found in HF `config.json`
    #[must_use]
    pub fn from_torch_dtype(s: &str) -> Option<Self> {
        match s {
            "float32" | "float" => Some(Self::F32),
            "float16" | "half" => Some(Self::F16),
            "bfloat16" => Some(Self::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
        }
    }
}

/// Element type a KV cache store can hold.
///
/// Attention math always runs in `f32`; values are widened on read and
/// narrowed on write.
pub trait CacheScalar: bytemuck::Pod + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;
}

impl CacheScalar for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl CacheScalar for half::f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn from_f32(value: f32) -> Self {
        half::f16::from_f32(value)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }
}

impl CacheScalar for half::bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn from_f32(value: f32) -> Self {
        half::bf16::from_f32(value)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
    }

    #[test]
    fn test_dtype_from_torch_dtype() {
        assert_eq!(DType::from_torch_dtype("float32"), Some(DType::F32));
        assert_eq!(DType::from_torch_dtype("float16"), Some(DType::F16));
        assert_eq!(DType::from_torch_dtype("bfloat16"), Some(DType::BF16));
        assert_eq!(DType::from_torch_dtype("int8"), None);
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::F16), "f16");
        assert_eq!(format!("{}", DType::BF16), "bf16");
    }

    #[test]
    fn test_cache_scalar_roundtrip_is_close() {
        assert_eq!(<f32 as CacheScalar>::from_f32(1.25).to_f32(), 1.25);
        assert_eq!(<half::f16 as CacheScalar>::from_f32(0.5).to_f32(), 0.5);
        let bf = <half::bf16 as CacheScalar>::from_f32(3.0);
        assert_eq!(bf.to_f32(), 3.0);
        assert_eq!(<half::bf16 as CacheScalar>::DTYPE, DType::BF16);
    }
}

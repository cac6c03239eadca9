//! CPU tensor implementation.

use std::borrow::Cow;
use std::sync::Arc;

use pagedkv::dtype::{CacheScalar, DType};
use pagedkv::tensor::Tensor;

/// A CPU-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones and reshapes are cheap (shared backing).
/// Attention math runs in f32; f16/bf16 data is widened on access.
#[derive(Clone)]
pub struct CpuTensor {
    data: Arc<Vec<u8>>,
    shape: Vec<usize>,
    dtype: DType,
}

impl CpuTensor {
    /// Create a tensor from an f32 slice.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        Self::from_scalars(shape, data)
    }

    /// Create a tensor from any cache scalar slice (f32, f16, bf16).
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    #[must_use]
    pub fn from_scalars<T: CacheScalar>(shape: &[usize], data: &[T]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        }
    }

    /// Create a zero-filled f32 tensor.
    #[must_use]
    pub fn zeros_f32(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: Arc::new(vec![0u8; numel * 4]),
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice(&self.data[..self.numel() * 4])
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.numel() * self.dtype.size_in_bytes()]
    }

    /// View the data as f32, widening f16/bf16 into a fresh buffer.
    #[must_use]
    pub fn f32_data(&self) -> Cow<'_, [f32]> {
        match self.dtype {
            DType::F32 => Cow::Borrowed(self.as_f32_slice()),
            DType::BF16 => Cow::Owned(widen::<half::bf16>(self.as_bytes())),
            DType::F16 => Cow::Owned(widen::<half::f16>(self.as_bytes())),
        }
    }

    /// Convert to an f32 Vec, casting from bf16/f16 if necessary.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.f32_data().into_owned()
    }
}

fn widen<T: CacheScalar>(bytes: &[u8]) -> Vec<f32> {
    let values: &[T] = bytemuck::cast_slice(bytes);
    values.iter().map(|v| v.to_f32()).collect()
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }
}

impl std::fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

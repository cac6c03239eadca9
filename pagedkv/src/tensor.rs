//! Tensor trait definition

use crate::dtype::DType;

/// Minimal tensor interface the attention entry points validate against.
///
/// Backends own the storage; the core only needs shapes and dtypes to check
/// inputs against the configured head layout before a kernel is issued.
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    fn reshape(&self, shape: &[usize]) -> Self;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }
}

/// Check that `tensor` has exactly `expected` as its shape.
///
/// # Errors
/// Returns [`Error::ShapeMismatch`](crate::Error::ShapeMismatch) otherwise.
pub fn expect_shape<T: Tensor>(tensor: &T, expected: &[usize]) -> crate::Result<()> {
    if tensor.shape() == expected {
        Ok(())
    } else {
        Err(crate::Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        })
    }
}

//! CPU backend for pagedkv.
//!
//! Provides a pure-CPU implementation of the KV store and attention op
//! traits. Attention math is done in f32; the store may hold f32, f16 or
//! bf16 and widens on read. Work is spread over (row, head) pairs with rayon.
//!
//! This backend is the reference the runtime is tested against. It is not
//! optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod ops;
pub mod tensor;

use std::marker::PhantomData;

use pagedkv::backend::Backend;
use pagedkv::dtype::CacheScalar;

pub use ops::kv_store::CpuKvStore;
pub use tensor::CpuTensor;

/// Marker type for the CPU backend, parameterised by the cache element type.
///
/// All op trait impls are on this type. The engine, parameterised by
/// `B: Backend`, can use `CpuBackend` (f32 cache) or e.g.
/// `CpuBackend<half::bf16>` to run on CPU.
pub struct CpuBackend<T: CacheScalar = f32>(PhantomData<T>);

impl<T: CacheScalar> Backend for CpuBackend<T> {
    type Tensor = CpuTensor;
    type KvStore = CpuKvStore<T>;
}

//! pagedkv: paged key/value cache and attention core for batched serving.
//!
//! This crate provides the slot allocator, request table, sliding-window
//! arithmetic, batch plans and the backend op traits. Backend-specific
//! kernels (CPU, ...) live in separate crates; the per-step engine is in
//! `pagedkv-runtime`.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod batch;
pub mod config;
pub mod dtype;
pub mod error;
pub mod slot_allocator;
pub mod tensor;
pub mod window;

pub use backend::{Backend, ContextAttentionOps, DecodeAttentionOps, KvStoreOps};
pub use batch::{
    BatchDescriptor, BatchEntry, DecodePlan, DecodeView, Phase, PrefillPlan, PrefillView,
};
pub use config::{
    ActivationKind, CacheConfig, DecodeStrategy, EngineConfig, HeadLayout, LayerCapabilities,
    ModelAttentionConfig, NormKind,
};
pub use dtype::{CacheScalar, DType};
pub use error::{Error, Result};
pub use slot_allocator::{RequestId, RequestTable, SlotAllocator, SlotRange, TokenTable};
pub use tensor::Tensor;
pub use window::{SlidingWindow, VisibleRange};

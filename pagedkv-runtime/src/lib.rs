//! pagedkv runtime: the per-step attention engine
//!
//! This crate provides the [`AttentionEngine`], which ties the slot
//! allocator, request table and KV store together and drives the backend
//! kernels for prefill and decode steps.
//!
//! # Architecture
//!
//! ```text
//! scheduler (external)        ← builds a BatchDescriptor per step
//!   └── AttentionEngine<B>    ← owns RequestTable + KvStore, resolves slots
//!         └── B: ContextAttentionOps + DecodeAttentionOps  ← kernels only
//! ```

mod engine;

pub use engine::AttentionEngine;

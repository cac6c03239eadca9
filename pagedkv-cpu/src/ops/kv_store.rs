//! Slot-addressed KV store and its `KvStoreOps` implementation.

use tracing::debug;

use pagedkv::backend::KvStoreOps;
use pagedkv::config::{CacheConfig, HeadLayout};
use pagedkv::dtype::CacheScalar;
use pagedkv::tensor::Tensor;
use pagedkv::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// CPU KV store: one key pool and one value pool per layer.
///
/// Each pool is `(num_slots, num_kv_heads, head_dim)` flattened, so slot `s`
/// of kv head `h` lives at `(s * num_kv_heads + h) * head_dim`.
pub struct CpuKvStore<T: CacheScalar = f32> {
    k_pools: Vec<Vec<T>>,
    v_pools: Vec<Vec<T>>,
    num_slots: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl<T: CacheScalar> CpuKvStore<T> {
    /// Allocate a zeroed store.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDtype`] if `config.dtype` is not `T`, or
    /// [`Error::InvalidConfig`] for an empty store.
    pub fn new(config: &CacheConfig, layout: &HeadLayout) -> Result<Self> {
        if config.dtype != T::DTYPE {
            return Err(Error::UnsupportedDtype(format!(
                "cache configured as {} but store holds {}",
                config.dtype,
                T::DTYPE
            )));
        }
        if config.num_layers == 0 || config.max_total_tokens == 0 {
            return Err(Error::InvalidConfig(format!(
                "kv store needs at least one layer and one slot, got {} layers, {} slots",
                config.num_layers, config.max_total_tokens
            )));
        }
        let pool_size = config.max_total_tokens * layout.kv_width();
        let k_pools = (0..config.num_layers)
            .map(|_| vec![T::default(); pool_size])
            .collect();
        let v_pools = (0..config.num_layers)
            .map(|_| vec![T::default(); pool_size])
            .collect();
        let store = Self {
            k_pools,
            v_pools,
            num_slots: config.max_total_tokens,
            num_kv_heads: layout.num_kv_heads,
            head_dim: layout.head_dim,
        };
        debug!(
            layers = config.num_layers,
            slots = store.num_slots,
            dtype = %T::DTYPE,
            bytes = store.size_in_bytes(),
            "allocated cpu kv store"
        );
        Ok(store)
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.k_pools.len()
    }

    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Elements per slot (`num_kv_heads * head_dim`).
    #[must_use]
    pub fn row_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Approximate bytes held by all pools.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        2 * self.num_layers() * self.num_slots * self.row_width() * T::DTYPE.size_in_bytes()
    }

    /// Check that the store was built for `layout`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on a different kv head count or head dim.
    pub fn check_layout(&self, layout: &HeadLayout) -> Result<()> {
        if self.num_kv_heads == layout.num_kv_heads && self.head_dim == layout.head_dim {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: vec![self.num_kv_heads, self.head_dim],
                got: vec![layout.num_kv_heads, layout.head_dim],
            })
        }
    }

    /// Check that `layer` exists and every slot is inside the pool.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] naming the first bad index.
    pub fn check_slots(&self, layer: usize, slots: &[usize]) -> Result<()> {
        if layer >= self.num_layers() {
            return Err(Error::InvalidShape(format!(
                "layer {layer} out of range ({} layers)",
                self.num_layers()
            )));
        }
        match slots.iter().find(|&&s| s >= self.num_slots) {
            None => Ok(()),
            Some(slot) => Err(Error::InvalidShape(format!(
                "slot {slot} out of range ({} slots)",
                self.num_slots
            ))),
        }
    }

    /// Key of `kv_head` at `slot`. Indices must have been checked.
    #[inline]
    pub(crate) fn key(&self, layer: usize, slot: usize, kv_head: usize) -> &[T] {
        let off = (slot * self.num_kv_heads + kv_head) * self.head_dim;
        &self.k_pools[layer][off..off + self.head_dim]
    }

    /// Value of `kv_head` at `slot`. Indices must have been checked.
    #[inline]
    pub(crate) fn value(&self, layer: usize, slot: usize, kv_head: usize) -> &[T] {
        let off = (slot * self.num_kv_heads + kv_head) * self.head_dim;
        &self.v_pools[layer][off..off + self.head_dim]
    }

    fn write_row(&mut self, layer: usize, slot: usize, key: &[f32], value: &[f32]) {
        let width = self.row_width();
        let off = slot * width;
        narrow_into(&mut self.k_pools[layer][off..off + width], key);
        narrow_into(&mut self.v_pools[layer][off..off + width], value);
    }

    fn read_row(&self, layer: usize, slot: usize) -> (&[T], &[T]) {
        let width = self.row_width();
        let off = slot * width;
        (
            &self.k_pools[layer][off..off + width],
            &self.v_pools[layer][off..off + width],
        )
    }
}

fn narrow_into<T: CacheScalar>(dst: &mut [T], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = T::from_f32(s);
    }
}

fn widen<T: CacheScalar>(src: &[T]) -> Vec<f32> {
    src.iter().map(|v| v.to_f32()).collect()
}

impl<T: CacheScalar> KvStoreOps for CpuBackend<T> {
    fn allocate_kv_store(config: &CacheConfig, layout: &HeadLayout) -> Result<CpuKvStore<T>> {
        CpuKvStore::new(config, layout)
    }

    fn write_slot(
        store: &mut CpuKvStore<T>,
        layer: usize,
        slot: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<()> {
        store.check_slots(layer, &[slot])?;
        let width = store.row_width();
        for row in [key, value] {
            if row.len() != width {
                return Err(Error::ShapeMismatch {
                    expected: vec![width],
                    got: vec![row.len()],
                });
            }
        }
        store.write_row(layer, slot, key, value);
        Ok(())
    }

    fn read_slot(store: &CpuKvStore<T>, layer: usize, slot: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        store.check_slots(layer, &[slot])?;
        let (k, v) = store.read_row(layer, slot);
        Ok((widen(k), widen(v)))
    }

    fn write_rows(
        store: &mut CpuKvStore<T>,
        layer: usize,
        slots: &[usize],
        k: &CpuTensor,
        v: &CpuTensor,
        first_row: usize,
    ) -> Result<()> {
        store.check_slots(layer, slots)?;
        let rows = k.shape().first().copied().unwrap_or(0);
        let expected = [rows, store.num_kv_heads, store.head_dim];
        pagedkv::tensor::expect_shape(k, &expected)?;
        pagedkv::tensor::expect_shape(v, &expected)?;
        if first_row + slots.len() > expected[0] {
            return Err(Error::InvalidShape(format!(
                "rows {first_row}..{} exceed {} input rows",
                first_row + slots.len(),
                expected[0]
            )));
        }

        let k_data = k.f32_data();
        let v_data = v.f32_data();
        let width = store.row_width();
        for (t, &slot) in slots.iter().enumerate() {
            let src = (first_row + t) * width;
            store.write_row(
                layer,
                slot,
                &k_data[src..src + width],
                &v_data[src..src + width],
            );
        }
        Ok(())
    }

    fn gather(
        store: &CpuKvStore<T>,
        layer: usize,
        slots: &[usize],
    ) -> Result<(CpuTensor, CpuTensor)> {
        store.check_slots(layer, slots)?;
        let width = store.row_width();
        let mut k_out = Vec::with_capacity(slots.len() * width);
        let mut v_out = Vec::with_capacity(slots.len() * width);
        for &slot in slots {
            let (k, v) = store.read_row(layer, slot);
            k_out.extend(k.iter().map(|x| x.to_f32()));
            v_out.extend(v.iter().map(|x| x.to_f32()));
        }
        let shape = [slots.len(), store.num_kv_heads, store.head_dim];
        Ok((
            CpuTensor::from_f32(&shape, &k_out),
            CpuTensor::from_f32(&shape, &v_out),
        ))
    }
}

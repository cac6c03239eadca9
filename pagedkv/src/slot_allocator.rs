//! Token-slot allocator and request index table.
//!
//! The KV cache store is a pool of `num_slots` rows per layer; each row
//! holds one token's keys and values. [`SlotAllocator`] hands out rows from a
//! LIFO free-list and records which request owns each one.
//! [`RequestTable`] keeps, per request, the ordered list of its slots
//! ([`TokenTable`]): entry `i` is the physical slot of token position `i`.
//! Slots are not contiguous across extensions, so consumers always gather
//! through the table.
//!
//! This is CPU-side bookkeeping only; the storage itself lives in the
//! backend's KV store.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::window::VisibleRange;
use crate::{Error, Result};

/// Identifier the external scheduler assigns to a request.
pub type RequestId = u64;

/// Manages the pool of token slots.
///
/// Allocation is all-or-nothing: a request that cannot be satisfied leaves
/// the free-list untouched.
#[derive(Debug)]
pub struct SlotAllocator {
    free_slots: Vec<usize>,
    owners: Vec<Option<RequestId>>,
}

impl SlotAllocator {
    /// Create a new allocator with all slots free.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `num_slots` is zero.
    pub fn new(num_slots: usize) -> Result<Self> {
        if num_slots == 0 {
            return Err(Error::InvalidConfig("num_slots must be > 0".to_string()));
        }
        // Reversed so that a fresh pool hands out 0, 1, 2, ...
        let free_slots: Vec<usize> = (0..num_slots).rev().collect();
        Ok(Self {
            free_slots,
            owners: vec![None; num_slots],
        })
    }

    /// Allocate `n` slots for `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfCacheCapacity`] if fewer than `n` slots are free.
    pub fn allocate(&mut self, request_id: RequestId, n: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(n) {
            warn!(
                request_id,
                requested = n,
                available = self.num_free(),
                "slot pool exhausted"
            );
            return Err(Error::OutOfCacheCapacity {
                requested: n,
                available: self.num_free(),
            });
        }
        let split = self.free_slots.len() - n;
        let mut slots = self.free_slots.split_off(split);
        slots.reverse();
        for &slot in &slots {
            self.owners[slot] = Some(request_id);
        }
        Ok(slots)
    }

    /// Return `slots` owned by `request_id` to the free-list.
    ///
    /// Every slot is checked before any is released.
    ///
    /// # Errors
    /// Returns [`Error::SlotOwnershipViolation`] if a slot is out of range,
    /// already free, or owned by another request.
    pub fn release(&mut self, request_id: RequestId, slots: &[usize]) -> Result<()> {
        let mut seen = HashSet::with_capacity(slots.len());
        for &slot in slots {
            self.check_owner(slot, request_id)?;
            if !seen.insert(slot) {
                return Err(Error::InvalidShape(format!(
                    "slot {slot} listed twice in release for request {request_id}"
                )));
            }
        }
        for &slot in slots.iter().rev() {
            self.owners[slot] = None;
            self.free_slots.push(slot);
        }
        Ok(())
    }

    /// Current owner of `slot`, `None` if free or out of range.
    #[must_use]
    pub fn owner(&self, slot: usize) -> Option<RequestId> {
        self.owners.get(slot).copied().flatten()
    }

    /// Verify that `slot` belongs to `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::SlotOwnershipViolation`] otherwise.
    pub fn check_owner(&self, slot: usize, request_id: RequestId) -> Result<()> {
        let owner = self.owner(slot);
        if owner == Some(request_id) {
            Ok(())
        } else {
            warn!(slot, request_id, ?owner, "slot ownership violation");
            Err(Error::SlotOwnershipViolation {
                slot,
                request_id,
                owner,
            })
        }
    }

    /// Number of free slots remaining.
    #[must_use]
    pub fn num_free(&self) -> usize {
        self.free_slots.len()
    }

    /// Number of slots currently owned by some request.
    #[must_use]
    pub fn num_used(&self) -> usize {
        self.num_slots() - self.num_free()
    }

    /// Total number of slots in the pool.
    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.owners.len()
    }

    /// Whether at least `n` slots can be allocated.
    #[must_use]
    pub fn can_allocate(&self, n: usize) -> bool {
        self.free_slots.len() >= n
    }
}

/// Ordered logical-to-physical slot mapping for one request.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    slots: Vec<usize>,
}

impl TokenTable {
    /// Physical slots in token order.
    #[must_use]
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Number of tokens the request holds in the cache.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.slots.len()
    }

    /// Physical slot of token position `pos`.
    #[must_use]
    pub fn slot_at(&self, pos: usize) -> Option<usize> {
        self.slots.get(pos).copied()
    }

    /// Slots covering `range`, in token order.
    ///
    /// # Panics
    /// Panics if `range` extends past the table.
    #[must_use]
    pub fn range(&self, range: VisibleRange) -> &[usize] {
        &self.slots[range.start..range.end()]
    }

    fn append(&mut self, slots: &[usize]) {
        self.slots.extend_from_slice(slots);
    }
}

/// Slots newly assigned to a request by [`RequestTable::allocate`] or
/// [`RequestTable::extend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Token position of `slots[0]`.
    pub first_position: usize,
    /// Physical slots for positions `first_position..first_position + slots.len()`.
    pub slots: Vec<usize>,
}

impl SlotRange {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Request-to-token-index table backed by a single slot allocator.
///
/// One instance exists per inference process; it is the only place slot
/// ownership changes.
#[derive(Debug)]
pub struct RequestTable {
    allocator: SlotAllocator,
    tables: HashMap<RequestId, TokenTable>,
}

impl RequestTable {
    /// Create a table over a pool of `num_slots` slots.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `num_slots` is zero.
    pub fn new(num_slots: usize) -> Result<Self> {
        Ok(Self {
            allocator: SlotAllocator::new(num_slots)?,
            tables: HashMap::new(),
        })
    }

    /// Admit `request_id` with `num_tokens` slots.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateRequest`] if the request is already present
    /// and [`Error::OutOfCacheCapacity`] if the pool cannot satisfy it.
    pub fn allocate(&mut self, request_id: RequestId, num_tokens: usize) -> Result<SlotRange> {
        if self.tables.contains_key(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        let slots = self.allocator.allocate(request_id, num_tokens)?;
        let mut table = TokenTable::default();
        table.append(&slots);
        self.tables.insert(request_id, table);
        debug!(
            request_id,
            num_tokens,
            free = self.allocator.num_free(),
            "allocated request slots"
        );
        Ok(SlotRange {
            first_position: 0,
            slots,
        })
    }

    /// Append `num_new_tokens` slots to an admitted request.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] or [`Error::OutOfCacheCapacity`].
    pub fn extend(&mut self, request_id: RequestId, num_new_tokens: usize) -> Result<SlotRange> {
        let Some(table) = self.tables.get_mut(&request_id) else {
            return Err(Error::UnknownRequest(request_id));
        };
        let slots = self.allocator.allocate(request_id, num_new_tokens)?;
        let first_position = table.seq_len();
        table.append(&slots);
        debug!(
            request_id,
            num_new_tokens,
            seq_len = table.seq_len(),
            "extended request slots"
        );
        Ok(SlotRange {
            first_position,
            slots,
        })
    }

    /// Release every slot of `request_id`. Returns the number freed.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present, or
    /// [`Error::SlotOwnershipViolation`] if the allocator disagrees about
    /// ownership (the request is left in place in that case).
    pub fn free(&mut self, request_id: RequestId) -> Result<usize> {
        let Some(table) = self.tables.get(&request_id) else {
            return Err(Error::UnknownRequest(request_id));
        };
        self.allocator.release(request_id, table.slots())?;
        let freed = table.seq_len();
        self.tables.remove(&request_id);
        debug!(
            request_id,
            freed,
            free = self.allocator.num_free(),
            "freed request slots"
        );
        Ok(freed)
    }

    /// Token table of an admitted request.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present.
    pub fn table(&self, request_id: RequestId) -> Result<&TokenTable> {
        self.tables
            .get(&request_id)
            .ok_or(Error::UnknownRequest(request_id))
    }

    /// Current cached length of a request.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present.
    pub fn seq_len(&self, request_id: RequestId) -> Result<usize> {
        self.table(request_id).map(TokenTable::seq_len)
    }

    /// Check that every slot in `slots` is owned by `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::SlotOwnershipViolation`] on the first foreign slot.
    pub fn verify_owned(&self, request_id: RequestId, slots: &[usize]) -> Result<()> {
        slots
            .iter()
            .try_for_each(|&slot| self.allocator.check_owner(slot, request_id))
    }

    #[must_use]
    pub fn contains(&self, request_id: RequestId) -> bool {
        self.tables.contains_key(&request_id)
    }

    /// Number of admitted requests.
    #[must_use]
    pub fn num_requests(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bump-pointer staging arena for cross-domain copies.
//
// Feature flag: bump_alloc — enables BumpArena (backed by bumpalo).
//
// Cross-domain `take` (ring.rs) stages device<->host payloads through a
// per-call scratch buffer; routing that scratch buffer through a bump arena
// instead of a fresh heap allocation per copy avoids the malloc/free churn
// the original C allocator's staging buffer incurred on every mismatched
// take (see DESIGN_NOTES on staging buffers).

// ---------------------------------------------------------------------------
// BumpArena — monotonic bump-pointer arena (mirrors monotonic_buffer_resource)
// ---------------------------------------------------------------------------

/// A thread-local bump-pointer arena backed by `bumpalo::Bump`.
///
/// Semantics mirror C++ `monotonic_buffer_resource`:
/// - `alloc_bytes` / `alloc_slice` never free individual allocations.
/// - `reset()` releases all memory at once (equivalent to `release()`).
///
/// The arena is **not** `Send`; use one per thread or wrap in a `Mutex`.
#[cfg(feature = "bump_alloc")]
pub struct BumpArena {
    bump: bumpalo::Bump,
}

#[cfg(feature = "bump_alloc")]
impl BumpArena {
    /// Create a new arena with the default initial capacity.
    pub fn new() -> Self {
        Self { bump: bumpalo::Bump::new() }
    }

    /// Create a new arena pre-allocated with `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { bump: bumpalo::Bump::with_capacity(capacity) }
    }

    /// Allocate `len` uninitialised bytes aligned to `align`.
    ///
    /// # Panics
    /// Panics if `align` is not a power of two or if allocation fails.
    pub fn alloc_bytes(&self, len: usize, align: usize) -> &mut [u8] {
        let layout = std::alloc::Layout::from_size_align(len, align)
            .expect("invalid layout");
        let ptr = self.bump.alloc_layout(layout);
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Allocate space for a `Vec<u8>` of `len` bytes and copy `src` into it.
    /// The returned slice lives for the lifetime of the arena.
    pub fn alloc_slice_copy<'a>(&'a self, src: &[u8]) -> &'a [u8] {
        bumpalo::collections::Vec::from_iter_in(src.iter().copied(), &self.bump)
            .into_bump_slice()
    }

    /// Allocate a `bumpalo::collections::Vec<u8>` inside this arena.
    /// Useful for building messages without a separate heap allocation.
    pub fn alloc_vec(&self) -> bumpalo::collections::Vec<'_, u8> {
        bumpalo::collections::Vec::new_in(&self.bump)
    }

    /// Allocate a `bumpalo::collections::Vec<u8>` with pre-reserved capacity.
    pub fn alloc_vec_with_capacity(&self, cap: usize) -> bumpalo::collections::Vec<'_, u8> {
        bumpalo::collections::Vec::with_capacity_in(cap, &self.bump)
    }

    /// Release all allocations and reset the arena to its initial state.
    /// Equivalent to C++ `monotonic_buffer_resource::release()`.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    /// Total bytes currently allocated inside the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Expose the underlying `bumpalo::Bump` for direct use with bumpalo APIs.
    pub fn inner(&self) -> &bumpalo::Bump {
        &self.bump
    }
}

#[cfg(feature = "bump_alloc")]
impl Default for BumpArena {
    fn default() -> Self {
        Self::new()
    }
}

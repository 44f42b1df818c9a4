// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process allocator registry: shmem_id -> locally mapped allocator.
// Grounded on platform::posix's ShmCache (same "first local use creates an
// Arc-backed cache entry, later lookups clone the Arc" shape), generalized
// from a named-mutex cache to an id-keyed allocator cache, and extended
// with the descriptor-reference counting the design notes call for so that
// foreign allocators get unmapped once nothing in any topic queue still
// points at them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::alloc::Allocator;
use crate::error::Result;

struct Entry {
    allocator: Arc<Allocator>,
    /// Number of live topic-queue descriptors that reference this allocator.
    /// Allocators this process itself created are exempt (see `own`).
    refs: AtomicUsize,
    own: bool,
}

/// Process-wide map from `shmem_id` to a mapped allocator handle.
pub struct AllocatorRegistry {
    entries: Mutex<HashMap<i32, Entry>>,
}

impl AllocatorRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Process-global instance, matching the single registry per process
    /// the transport assumes (one `init()`/`fini()` pair per process).
    pub fn global() -> &'static AllocatorRegistry {
        static REG: OnceLock<AllocatorRegistry> = OnceLock::new();
        REG.get_or_init(AllocatorRegistry::new)
    }

    /// Register an allocator this process itself created or attached by
    /// explicit request (not merely because a descriptor mentioned it).
    pub fn insert_own(&self, shmem_id: i32, allocator: Arc<Allocator>) {
        let mut map = self.entries.lock().unwrap();
        map.insert(
            shmem_id,
            Entry {
                allocator,
                refs: AtomicUsize::new(0),
                own: true,
            },
        );
    }

    /// Resolve `shmem_id` to a mapped allocator, remapping it on first
    /// sighting via `open_fn` if it isn't cached yet.
    pub fn lookup_or_remap<F>(&self, shmem_id: i32, open_fn: F) -> Result<Arc<Allocator>>
    where
        F: FnOnce() -> Result<Allocator>,
    {
        {
            let map = self.entries.lock().unwrap();
            if let Some(entry) = map.get(&shmem_id) {
                return Ok(Arc::clone(&entry.allocator));
            }
        }
        let allocator = Arc::new(open_fn()?);
        let mut map = self.entries.lock().unwrap();
        // Another thread may have raced us; prefer whichever landed first.
        let entry = map.entry(shmem_id).or_insert_with(|| Entry {
            allocator: Arc::clone(&allocator),
            refs: AtomicUsize::new(0),
            own: false,
        });
        Ok(Arc::clone(&entry.allocator))
    }

    /// Called when a new descriptor referencing `shmem_id` is recorded in a
    /// topic queue row (publish or cross-domain materialization in take).
    pub fn descriptor_attached(&self, shmem_id: i32) {
        let map = self.entries.lock().unwrap();
        if let Some(entry) = map.get(&shmem_id) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Called when the matching `DEALLOCATE` has run for that descriptor.
    /// Drops (unmaps) the registry entry once no descriptor references a
    /// foreign allocator and the registry does not own it.
    pub fn descriptor_detached(&self, shmem_id: i32) {
        let mut map = self.entries.lock().unwrap();
        let should_remove = if let Some(entry) = map.get(&shmem_id) {
            if entry.own {
                false
            } else {
                let prev = entry.refs.fetch_sub(1, Ordering::AcqRel);
                prev <= 1
            }
        } else {
            false
        };
        if should_remove {
            log::debug!("registry: unmapping idle foreign allocator {shmem_id}");
            map.remove(&shmem_id);
        }
    }

    /// Remove an allocator this process owned (called from unregister).
    pub fn remove_own(&self, shmem_id: i32) {
        self.entries.lock().unwrap().remove(&shmem_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, AllocatorConfig, DeviceType};
    use std::sync::Mutex as StdMutex;

    // AllocatorRegistry::global() is a single process-wide singleton;
    // serialize these tests so one test's inserts/removes can't be observed
    // mid-flight by another running concurrently in this test binary.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn host_config(capacity: u32) -> AllocatorConfig {
        AllocatorConfig {
            capacity,
            item_size: 32,
            domain: DeviceType::Host,
            device_number: 0,
        }
    }

    #[test]
    fn own_allocator_is_not_evicted_by_descriptor_detach() {
        let _guard = TEST_LOCK.lock().unwrap();
        let registry = AllocatorRegistry::global();
        let before = registry.len();

        let alloc = Allocator::create(host_config(4)).expect("create");
        let shmem_id = alloc.shmem_id();
        assert_eq!(registry.len(), before + 1);

        // insert_own entries are exempt from descriptor refcounting.
        registry.descriptor_detached(shmem_id);
        assert_eq!(registry.len(), before + 1);

        registry.remove_own(shmem_id);
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn foreign_allocator_is_evicted_once_descriptors_reach_zero() {
        let _guard = TEST_LOCK.lock().unwrap();
        let registry = AllocatorRegistry::global();

        let owner = Allocator::create(host_config(4)).expect("create");
        let shmem_id = owner.shmem_id();
        let before = registry.len();

        // Drop the owned entry and rediscover the same segment as a
        // "foreign" allocator, the same way a remote subscriber process
        // would first see it via a topic descriptor.
        registry.remove_own(shmem_id);
        assert_eq!(registry.len(), before - 1);

        let remapped = registry
            .lookup_or_remap(shmem_id, || Allocator::remap(shmem_id))
            .expect("remap");
        assert_eq!(remapped.shmem_id(), shmem_id);
        assert_eq!(registry.len(), before);

        registry.descriptor_attached(shmem_id);
        registry.descriptor_attached(shmem_id);
        registry.descriptor_detached(shmem_id);
        // one descriptor still outstanding
        assert_eq!(registry.len(), before);

        registry.descriptor_detached(shmem_id);
        // last descriptor gone: the foreign mapping is evicted
        assert_eq!(registry.len(), before - 1);
    }

    #[test]
    fn lookup_or_remap_caches_across_calls() {
        let _guard = TEST_LOCK.lock().unwrap();
        let registry = AllocatorRegistry::global();
        let owner = Allocator::create(host_config(4)).expect("create");
        let shmem_id = owner.shmem_id();

        let a = registry
            .lookup_or_remap(shmem_id, || Allocator::remap(shmem_id))
            .expect("first lookup");
        let b = registry
            .lookup_or_remap(shmem_id, || panic!("should not remap twice"))
            .expect("second lookup hits cache");
        assert_eq!(a.shmem_id(), b.shmem_id());

        registry.remove_own(shmem_id);
    }
}

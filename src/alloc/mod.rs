// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocator framework: creates and remaps heterogeneous-memory allocators
// and dispatches ALLOCATE/SHARE/DEALLOCATE/COPY_* by (strategy, domain).
// Grounded on hma_template.h for the create/remap/unmap lifecycle and on
// cpu_ringbuf_allocator.c for the host ring strategy (ring.rs). The
// function-pointer table the C header positions in a private page becomes,
// here, a `match` over `(Strategy, DeviceType)` in `open_strategy` — see
// SPEC_FULL.md §4.1 for why that substitution is the idiomatic rendition
// rather than a literal port.

pub mod device;
pub mod ring;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::{HazmemError, Result};
use crate::shm::{ShmHandle, ShmOpenMode};
use ring::RingBufferState;

/// Memory domain an allocator manages. `Host` is always domain column 0 of
/// any topic that uses it; other variants extend to accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DeviceType {
    Host = 0,
    Cuda = 1,
}

impl DeviceType {
    pub fn from_wire(v: u16) -> Result<Self> {
        match v {
            0 => Ok(DeviceType::Host),
            1 => Ok(DeviceType::Cuda),
            other => Err(HazmemError::invalid_argument(format!(
                "unknown device_type {other}"
            ))),
        }
    }
}

/// Allocation strategy an allocator's shared state follows. Only the ring
/// buffer is implemented; the enum exists so a second strategy can be added
/// without changing the registry or topic-queue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Strategy {
    Ring = 0,
}

impl Strategy {
    pub fn from_wire(v: u16) -> Result<Self> {
        match v {
            0 => Ok(Strategy::Ring),
            other => Err(HazmemError::invalid_argument(format!(
                "unknown strategy {other}"
            ))),
        }
    }
}

/// Parameters for creating a new allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub capacity: u32,
    pub item_size: u32,
    pub domain: DeviceType,
    pub device_number: u16,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            item_size: 256,
            domain: DeviceType::Host,
            device_number: 0,
        }
    }
}

#[repr(C)]
struct AllocatorHeader {
    shmem_id: AtomicI32,
    device_type: std::sync::atomic::AtomicU32,
    device_number: std::sync::atomic::AtomicU32,
    strategy: std::sync::atomic::AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<AllocatorHeader>();

const DEVICE_HANDLE_MAX: usize = 64;

/// Device pool descriptor, placed unconditionally between `AllocatorHeader`
/// and the ring region (even for host allocators, which leave it zeroed) so
/// the ring's offset from `base` doesn't depend on which domain created it.
#[repr(C)]
struct DeviceHeader {
    pool_size: std::sync::atomic::AtomicU64,
    handle_len: std::sync::atomic::AtomicU32,
    handle: [u8; DEVICE_HANDLE_MAX],
}

const DEVICE_HEADER_SIZE: usize = std::mem::size_of::<DeviceHeader>();

fn next_shmem_id() -> i32 {
    static COUNTER: AtomicI32 = AtomicI32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() as i32).wrapping_mul(0x01000193).wrapping_add(n)
}

fn shm_name_for(shmem_id: i32) -> String {
    format!("hazcat_alloc.{:08x}", shmem_id as u32)
}

/// A mapped allocator: the shared region (header + ring-buffer state, and
/// for host domains the payload itself) plus, for device domains, an
/// imported device pool.
pub struct Allocator {
    shmem_id: i32,
    domain: DeviceType,
    device_number: u16,
    strategy: Strategy,
    shm: ShmHandle,
    ring: RingBufferState,
    #[cfg(feature = "cuda")]
    device_alloc: Option<Box<dyn device::DeviceAlloc>>,
    #[cfg(feature = "cuda")]
    device_backend: Option<Box<dyn device::DeviceBackend>>,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Create a brand-new allocator for `domain`, registering it with the
    /// process-wide registry as an owned entry.
    pub fn create(config: AllocatorConfig) -> Result<Arc<Allocator>> {
        #[cfg(not(feature = "cuda"))]
        if matches!(config.domain, DeviceType::Cuda) {
            return Err(HazmemError::resource_exhausted(
                "CUDA domain requires the `cuda` feature",
            ));
        }

        let shmem_id = next_shmem_id();
        let embed_payload = matches!(config.domain, DeviceType::Host);
        let ring_size = RingBufferState::region_size(config.capacity, config.item_size, embed_payload);
        let shared_size = HEADER_SIZE + DEVICE_HEADER_SIZE + ring_size;

        let name = shm_name_for(shmem_id);
        let shm = ShmHandle::acquire(&name, shared_size, ShmOpenMode::Create)?;

        let base = shm.as_mut_ptr();
        unsafe {
            let header = base as *mut AllocatorHeader;
            (*header).shmem_id.store(shmem_id, Ordering::Relaxed);
            (*header)
                .device_type
                .store(config.domain as u16 as u32, Ordering::Relaxed);
            (*header)
                .device_number
                .store(config.device_number as u32, Ordering::Relaxed);
            (*header)
                .strategy
                .store(Strategy::Ring as u16 as u32, Ordering::Relaxed);
        }
        let ring_base = unsafe { base.add(HEADER_SIZE + DEVICE_HEADER_SIZE) };
        let ring = unsafe { RingBufferState::init(ring_base, config.capacity, config.item_size) };

        #[cfg(feature = "cuda")]
        let (device_alloc, device_backend) = if matches!(config.domain, DeviceType::Cuda) {
            let backend: Box<dyn device::DeviceBackend> = Box::new(
                device::cuda_backend::CudaBackend::new(config.device_number as usize)?,
            );
            let pool = backend.alloc_pool(config.capacity as usize * config.item_size as usize)?;
            let handle = backend.export_handle(pool.as_ref())?;
            unsafe {
                let dh = base.add(HEADER_SIZE) as *mut DeviceHeader;
                (*dh).pool_size.store(pool.size() as u64, Ordering::Relaxed);
                let len = handle.len().min(DEVICE_HANDLE_MAX);
                (*dh).handle_len.store(len as u32, Ordering::Relaxed);
                std::ptr::copy_nonoverlapping(handle.as_ptr(), (*dh).handle.as_mut_ptr(), len);
            }
            (Some(pool), Some(backend))
        } else {
            (None, None)
        };

        log::debug!(
            "allocator {shmem_id:08x}: created, domain={:?}, capacity={}, item_size={}",
            config.domain,
            config.capacity,
            config.item_size
        );

        let allocator = Arc::new(Allocator {
            shmem_id,
            domain: config.domain,
            device_number: config.device_number,
            strategy: Strategy::Ring,
            shm,
            ring,
            #[cfg(feature = "cuda")]
            device_alloc,
            #[cfg(feature = "cuda")]
            device_backend,
        });
        crate::registry::AllocatorRegistry::global().insert_own(shmem_id, Arc::clone(&allocator));
        Ok(allocator)
    }

    /// Remap an existing allocator given its `shmem_id` (found in a topic
    /// descriptor). Does not register it as owned.
    ///
    /// Two-step open: the ring's header (capacity, item_size) has a fixed
    /// size regardless of capacity, so a small probe mapping is enough to
    /// learn how large the full region actually is before remapping it at
    /// its real size.
    pub fn remap(shmem_id: i32) -> Result<Allocator> {
        let name = shm_name_for(shmem_id);
        let probe_size = HEADER_SIZE + DEVICE_HEADER_SIZE + RingBufferState::header_size();
        let probe = ShmHandle::acquire(&name, probe_size, ShmOpenMode::Open)?;
        let (domain, device_number, strategy, capacity, item_size, pool_size, handle_bytes) = unsafe {
            let header = probe.as_ptr() as *const AllocatorHeader;
            let domain = DeviceType::from_wire((*header).device_type.load(Ordering::Relaxed) as u16)?;
            let device_number = (*header).device_number.load(Ordering::Relaxed) as u16;
            let strategy = Strategy::from_wire((*header).strategy.load(Ordering::Relaxed) as u16)?;
            let dh = probe.as_ptr().add(HEADER_SIZE) as *const DeviceHeader;
            let pool_size = (*dh).pool_size.load(Ordering::Relaxed);
            let handle_len = ((*dh).handle_len.load(Ordering::Relaxed) as usize).min(DEVICE_HANDLE_MAX);
            let handle_bytes = (*dh).handle[..handle_len].to_vec();
            let ring_base = probe.as_mut_ptr().add(HEADER_SIZE + DEVICE_HEADER_SIZE);
            let probe_ring = RingBufferState::attach(ring_base);
            (
                domain,
                device_number,
                strategy,
                probe_ring.capacity(),
                probe_ring.item_size(),
                pool_size,
                handle_bytes,
            )
        };
        drop(probe);
        #[cfg(not(feature = "cuda"))]
        let _ = (pool_size, handle_bytes);

        #[cfg(not(feature = "cuda"))]
        if matches!(domain, DeviceType::Cuda) {
            return Err(HazmemError::resource_exhausted(
                "CUDA domain requires the `cuda` feature",
            ));
        }

        let embed_payload = matches!(domain, DeviceType::Host);
        let full_size = HEADER_SIZE + DEVICE_HEADER_SIZE + RingBufferState::region_size(capacity, item_size, embed_payload);
        let shm = ShmHandle::acquire(&name, full_size, ShmOpenMode::Open)?;
        let ring_base = unsafe { shm.as_mut_ptr().add(HEADER_SIZE + DEVICE_HEADER_SIZE) };
        let ring = unsafe { RingBufferState::attach(ring_base) };

        #[cfg(feature = "cuda")]
        let (device_alloc, device_backend) = if matches!(domain, DeviceType::Cuda) {
            let backend: Box<dyn device::DeviceBackend> =
                Box::new(device::cuda_backend::CudaBackend::new(device_number as usize)?);
            let pool = backend.import_handle(&handle_bytes, pool_size as usize)?;
            (Some(pool), Some(backend))
        } else {
            (None, None)
        };

        log::debug!("allocator {shmem_id:08x}: remapped, domain={domain:?}");

        Ok(Allocator {
            shmem_id,
            domain,
            device_number,
            strategy,
            shm,
            ring,
            #[cfg(feature = "cuda")]
            device_alloc,
            #[cfg(feature = "cuda")]
            device_backend,
        })
    }

    pub fn shmem_id(&self) -> i32 {
        self.shmem_id
    }

    pub fn domain(&self) -> DeviceType {
        self.domain
    }

    pub fn device_number(&self) -> u16 {
        self.device_number
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn item_size(&self) -> u32 {
        self.ring.item_size()
    }

    fn payload_ptr(&self, slot: u32) -> *mut u8 {
        let slot_base =
            HEADER_SIZE + DEVICE_HEADER_SIZE + RingBufferState::payload_base_offset(self.ring.capacity());
        unsafe {
            self.shm
                .as_mut_ptr()
                .add(slot_base + slot as usize * self.ring.item_size() as usize)
        }
    }

    /// Stride, in bytes, between two consecutive slots' externally visible
    /// offsets: the slot's payload plus its refcount word (see the Data
    /// Model / Glossary's "byte displacement from an allocator handle").
    fn slot_stride(&self) -> i64 {
        self.ring.item_size() as i64 + RingBufferState::refcount_stride() as i64
    }

    fn slot_from_offset(&self, offset: i64) -> u32 {
        (offset / self.slot_stride()) as u32
    }

    /// ALLOCATE: reserve a slot, returning its byte offset from this
    /// allocator's handle, or `ResourceExhausted` when full.
    pub fn allocate(&self) -> Result<i64> {
        match self.ring.allocate() {
            Some(slot) => Ok(slot as i64 * self.slot_stride()),
            None => Err(HazmemError::resource_exhausted("ring buffer full")),
        }
    }

    /// SHARE: bump the refcount of the slot at `offset`.
    pub fn share(&self, offset: i64) {
        self.ring.share(self.slot_from_offset(offset));
    }

    /// DEALLOCATE: drop a reference to the slot at `offset`.
    pub fn deallocate(&self, offset: i64) {
        self.ring.deallocate(self.slot_from_offset(offset));
    }

    /// Resolve a slot offset to a pointer valid in this process, for host
    /// domains only (device domains must go through copy_to/copy_from).
    pub fn resolve(&self, offset: i64) -> *mut u8 {
        self.payload_ptr(self.slot_from_offset(offset))
    }

    /// Copy `src` into the slot at `offset`.
    pub fn copy_to(&self, offset: i64, src: &[u8]) -> Result<()> {
        match self.domain {
            DeviceType::Host => {
                let dst = self.payload_ptr(self.slot_from_offset(offset));
                let n = src.len().min(self.ring.item_size() as usize);
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, n) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            DeviceType::Cuda => {
                let slot = self.slot_from_offset(offset);
                let backend = self.device_backend.as_ref().ok_or_else(|| {
                    HazmemError::invalid_argument("cuda allocator has no device pool")
                })?;
                let pool = self.device_alloc.as_deref().ok_or_else(|| {
                    HazmemError::invalid_argument("cuda allocator has no device pool")
                })?;
                let byte_offset = slot as usize * self.ring.item_size() as usize;
                backend.copy_to(pool, byte_offset, src)
            }
            #[cfg(not(feature = "cuda"))]
            DeviceType::Cuda => {
                HazmemError::fatal("cuda domain requires the `cuda` feature")
            }
        }
    }

    /// Copy the slot at `offset` into `dst`.
    pub fn copy_from(&self, offset: i64, dst: &mut [u8]) -> Result<()> {
        match self.domain {
            DeviceType::Host => {
                let src = self.payload_ptr(self.slot_from_offset(offset));
                let n = dst.len().min(self.ring.item_size() as usize);
                unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), n) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            DeviceType::Cuda => {
                let slot = self.slot_from_offset(offset);
                let backend = self.device_backend.as_ref().ok_or_else(|| {
                    HazmemError::invalid_argument("cuda allocator has no device pool")
                })?;
                let pool = self.device_alloc.as_deref().ok_or_else(|| {
                    HazmemError::invalid_argument("cuda allocator has no device pool")
                })?;
                let byte_offset = slot as usize * self.ring.item_size() as usize;
                backend.copy_from(pool, byte_offset, dst)
            }
            #[cfg(not(feature = "cuda"))]
            DeviceType::Cuda => {
                HazmemError::fatal("cuda domain requires the `cuda` feature")
            }
        }
    }

    /// COPY: move `len` bytes from `(src_alloc, src_offset)` into a freshly
    /// allocated slot in `self`, staging through a host buffer when domains
    /// differ and bypassing it entirely when both are host.
    pub fn copy_cross(&self, src_alloc: &Allocator, src_offset: i64, len: usize) -> Result<i64> {
        let dst_offset = self.allocate()?;
        match (src_alloc.domain, self.domain) {
            (DeviceType::Host, DeviceType::Host) => {
                let src = src_alloc.payload_ptr(src_alloc.slot_from_offset(src_offset));
                let dst = self.payload_ptr(self.slot_from_offset(dst_offset));
                let n = len.min(self.ring.item_size() as usize);
                unsafe { std::ptr::copy_nonoverlapping(src, dst, n) };
            }
            _ => {
                #[cfg(feature = "bump_alloc")]
                {
                    let arena = crate::mem::BumpArena::with_capacity(len);
                    let staging = arena.alloc_bytes(len, 1);
                    src_alloc.copy_from(src_offset, staging)?;
                    self.copy_to(dst_offset, staging)?;
                }
                #[cfg(not(feature = "bump_alloc"))]
                {
                    let mut staging = vec![0u8; len];
                    src_alloc.copy_from(src_offset, &mut staging)?;
                    self.copy_to(dst_offset, &staging)?;
                }
            }
        }
        Ok(dst_offset)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        log::debug!("allocator {:08x}: unmapped", self.shmem_id);
        // ShmHandle's own Drop unmaps and, if we were the creator and the
        // last attacher, unlinks the backing segment.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors upstream's `example_allocator.c`: a minimal strategy that
    /// exercises nothing but the header reservation/mapping machinery, kept
    /// test-only so it never has to carry real allocate/share/deallocate
    /// semantics.
    struct NoopHeaderProbe {
        shm: ShmHandle,
    }

    impl NoopHeaderProbe {
        fn create(shmem_id: i32) -> Result<Self> {
            let name = format!("hazcat_alloc_noop.{:08x}", shmem_id as u32);
            let shm = ShmHandle::acquire(&name, HEADER_SIZE, ShmOpenMode::Create)?;
            unsafe {
                let header = shm.as_mut_ptr() as *mut AllocatorHeader;
                (*header).shmem_id.store(shmem_id, Ordering::Relaxed);
                (*header)
                    .device_type
                    .store(DeviceType::Host as u16 as u32, Ordering::Relaxed);
                (*header).device_number.store(0, Ordering::Relaxed);
                (*header)
                    .strategy
                    .store(Strategy::Ring as u16 as u32, Ordering::Relaxed);
            }
            Ok(Self { shm })
        }

        fn reopen(&self, shmem_id: i32) -> Result<Self> {
            let name = format!("hazcat_alloc_noop.{:08x}", shmem_id as u32);
            let shm = ShmHandle::acquire(&name, HEADER_SIZE, ShmOpenMode::Open)?;
            Ok(Self { shm })
        }

        fn read_header(&self) -> (i32, DeviceType, Strategy) {
            unsafe {
                let header = self.shm.as_ptr() as *const AllocatorHeader;
                let shmem_id = (*header).shmem_id.load(Ordering::Relaxed);
                let domain =
                    DeviceType::from_wire((*header).device_type.load(Ordering::Relaxed) as u16)
                        .unwrap();
                let strategy =
                    Strategy::from_wire((*header).strategy.load(Ordering::Relaxed) as u16)
                        .unwrap();
                (shmem_id, domain, strategy)
            }
        }
    }

    #[test]
    fn noop_strategy_round_trips_the_shared_header() {
        let shmem_id = next_shmem_id();
        let probe = NoopHeaderProbe::create(shmem_id).expect("create");
        let other = probe.reopen(shmem_id).expect("reopen from a second handle");

        assert_eq!(probe.read_header(), (shmem_id, DeviceType::Host, Strategy::Ring));
        assert_eq!(other.read_header(), (shmem_id, DeviceType::Host, Strategy::Ring));
    }
}

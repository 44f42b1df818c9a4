// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Topic message queue: a file-backed circular buffer of message descriptors
// shared by every publisher and subscriber of one topic, fanning out to as
// many memory domains as the topic's subscribers need. Grounded on
// hazcat_message_queue.h for the public operation surface and on the
// register/publish/take/unregister algorithm in SPEC_FULL.md §4.3, which
// resolves several ambiguities the original left open (resize timing, the
// sub_count snapshot race, reclaim-safe reference counting).

pub mod directory;

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::alloc::{Allocator, DeviceType};
use crate::error::{HazmemError, Result};
use crate::registry::AllocatorRegistry;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;
use crate::DOMAINS_PER_TOPIC;

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(unix)]
use crate::fifo::SignalFifo;
#[cfg(unix)]
use crate::filelock;

#[repr(C)]
struct RawQueueHeader {
    index: AtomicU32,
    len: AtomicU64,
    num_domains: AtomicU64,
    domains: [AtomicU32; DOMAINS_PER_TOPIC],
    pub_count: AtomicU32,
    sub_count: AtomicU32,
    /// Set on the first successful publish; once set, register() refuses
    /// any resize rather than risk shifting the descriptor matrix under a
    /// live row (see SPEC_FULL.md §9).
    published: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<RawQueueHeader>();

#[repr(C)]
struct RawRowRef {
    interest_count: AtomicU32,
    availability: AtomicU32,
    row_lock: AtomicU64,
}

const ROWREF_SIZE: usize = std::mem::size_of::<RawRowRef>();

#[repr(C)]
struct RawEntry {
    alloc_shmem_id: AtomicI32,
    offset: AtomicI32,
    len: AtomicU64,
}

const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

fn region_size(len: u64) -> usize {
    HEADER_SIZE + len as usize * ROWREF_SIZE + len as usize * DOMAINS_PER_TOPIC * ENTRY_SIZE
}

fn lock_row(row: &RawRowRef) {
    let mut k = 0u32;
    while row
        .row_lock
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        crate::spin_lock::adaptive_yield_pub(&mut k);
    }
}

fn unlock_row(row: &RawRowRef) {
    row.row_lock.store(0, Ordering::Release);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Publisher,
    Subscriber,
}

/// A single publisher or subscriber's registration against one topic.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub role: EndpointRole,
    pub domain: DeviceType,
    pub alloc_shmem_id: i32,
    pub array_num: usize,
    pub depth: u32,
    next_index: u32,
}

/// A descriptor `take` resolved into this endpoint's domain, ready for the
/// caller to resolve through `AllocatorRegistry::lookup_or_remap`.
#[derive(Debug, Clone, Copy)]
pub struct TakeResult {
    pub alloc_shmem_id: i32,
    pub offset: i64,
    pub len: u64,
}

/// A file-backed circular queue of message descriptors for one topic.
pub struct TopicQueue {
    topic: String,
    shm: ShmHandle,
    #[cfg(unix)]
    lock_fd: RawFd,
    #[cfg(unix)]
    fifo: SignalFifo,
}

unsafe impl Send for TopicQueue {}
unsafe impl Sync for TopicQueue {}

impl TopicQueue {
    /// Attach to an existing topic queue or create one with an initial
    /// history depth of 1 (register_publisher/subscriber grows it as
    /// needed before the first publish).
    pub fn open_or_create(topic: &str) -> Result<Self> {
        let suffix = shm_name::sanitize_topic(topic);
        let name = format!("ros2_hazcat.{suffix}");
        let initial_len: u64 = 1;
        let initial_size = region_size(initial_len);

        let shm = ShmHandle::acquire(&name, initial_size, ShmOpenMode::CreateOrOpen)?;
        let is_creator = shm.ref_count() == 1;
        if is_creator {
            let header = shm.as_mut_ptr() as *mut RawQueueHeader;
            unsafe {
                (*header).index.store(0, Ordering::Relaxed);
                (*header).len.store(initial_len, Ordering::Relaxed);
                // Domain column 0 is always host memory (SPEC §3/§4.3): seed
                // it unconditionally so the first registrant, whatever its
                // domain, can never claim column 0 for itself.
                (*header).domains[0].store(DeviceType::Host as u16 as u32, Ordering::Relaxed);
                for d in &(*header).domains[1..] {
                    d.store(0, Ordering::Relaxed);
                }
                (*header).num_domains.store(1, Ordering::Relaxed);
                (*header).pub_count.store(0, Ordering::Relaxed);
                (*header).sub_count.store(0, Ordering::Relaxed);
                (*header).published.store(0, Ordering::Relaxed);
            }
            log::debug!("topic '{topic}': created queue file");
        }

        #[cfg(unix)]
        {
            let posix_name = shm.name();
            let c_name = std::ffi::CString::new(posix_name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let lock_fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
            if lock_fd == -1 {
                return Err(io::Error::last_os_error().into());
            }
            let fifo = SignalFifo::open(topic)?;
            Ok(Self {
                topic: topic.to_string(),
                shm,
                lock_fd,
                fifo,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {
                topic: topic.to_string(),
                shm,
            })
        }
    }

    #[cfg(unix)]
    fn write_lock(&self) -> Result<filelock::FileLockGuard> {
        Ok(filelock::write_lock(self.lock_fd)?)
    }

    #[cfg(unix)]
    fn read_lock(&self) -> Result<filelock::FileLockGuard> {
        Ok(filelock::read_lock(self.lock_fd)?)
    }

    fn header(&self) -> &RawQueueHeader {
        unsafe { &*(self.shm.as_ptr() as *const RawQueueHeader) }
    }

    fn row_refs(&self, len: u64) -> &[RawRowRef] {
        unsafe {
            std::slice::from_raw_parts(
                self.shm.as_ptr().add(HEADER_SIZE) as *const RawRowRef,
                len as usize,
            )
        }
    }

    fn entries(&self, len: u64) -> &[RawEntry] {
        unsafe {
            let base = self.shm.as_ptr().add(HEADER_SIZE + len as usize * ROWREF_SIZE);
            std::slice::from_raw_parts(base as *const RawEntry, len as usize * DOMAINS_PER_TOPIC)
        }
    }

    fn find_or_reserve_domain(&self, domain: DeviceType) -> Result<usize> {
        let header = self.header();
        let code = domain as u16 as u32;
        let num_domains = header.num_domains.load(Ordering::Relaxed) as usize;
        for i in 0..num_domains {
            if header.domains[i].load(Ordering::Relaxed) == code {
                return Ok(i);
            }
        }
        if num_domains == DOMAINS_PER_TOPIC {
            return Err(HazmemError::resource_exhausted(
                "topic already uses the maximum number of memory domains",
            ));
        }
        header.domains[num_domains].store(code, Ordering::Relaxed);
        header.num_domains.store(num_domains as u64 + 1, Ordering::Release);
        Ok(num_domains)
    }

    fn register(
        &mut self,
        role: EndpointRole,
        domain: DeviceType,
        alloc_shmem_id: i32,
        depth: u32,
    ) -> Result<Endpoint> {
        #[cfg(unix)]
        let _guard = self.write_lock()?;

        let array_num = self.find_or_reserve_domain(domain)?;

        let cur_len = self.header().len.load(Ordering::Relaxed);
        if (depth as u64) > cur_len {
            if self.header().published.load(Ordering::Relaxed) != 0 {
                return Err(HazmemError::resource_exhausted(
                    "cannot grow history depth after the topic's first publish",
                ));
            }
            let new_len = depth as u64;
            let new_size = region_size(new_len);
            #[cfg(unix)]
            {
                self.shm.resize(new_size)?;
            }
            #[cfg(not(unix))]
            {
                return Err(HazmemError::resource_exhausted(
                    "topic queue resize is POSIX-only in this build",
                ));
            }
            self.header().len.store(new_len, Ordering::Release);
            log::debug!("topic '{}': resized history depth to {new_len}", self.topic);
        }

        let next_index = self.header().index.load(Ordering::Acquire);

        let header = self.header();
        match role {
            EndpointRole::Publisher => {
                let prev = header.pub_count.fetch_add(1, Ordering::AcqRel);
                if prev as u64 >= u16::MAX as u64 {
                    header.pub_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(HazmemError::resource_exhausted("too many publishers"));
                }
            }
            EndpointRole::Subscriber => {
                let prev = header.sub_count.fetch_add(1, Ordering::AcqRel);
                if prev as u64 >= u16::MAX as u64 {
                    header.sub_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(HazmemError::resource_exhausted("too many subscribers"));
                }
            }
        }

        log::debug!(
            "topic '{}': registered {:?} domain={:?} array_num={array_num}",
            self.topic,
            role,
            domain
        );

        Ok(Endpoint {
            role,
            domain,
            alloc_shmem_id,
            array_num,
            depth,
            next_index,
        })
    }

    pub fn register_publisher(
        &mut self,
        domain: DeviceType,
        alloc_shmem_id: i32,
        depth: u32,
    ) -> Result<Endpoint> {
        self.register(EndpointRole::Publisher, domain, alloc_shmem_id, depth)
    }

    pub fn register_subscriber(
        &mut self,
        domain: DeviceType,
        alloc_shmem_id: i32,
        depth: u32,
    ) -> Result<Endpoint> {
        self.register(EndpointRole::Subscriber, domain, alloc_shmem_id, depth)
    }

    pub fn unregister(&mut self, endpoint: &Endpoint) -> Result<()> {
        #[cfg(unix)]
        let _guard = self.write_lock()?;

        let header = self.header();
        let remaining = match endpoint.role {
            EndpointRole::Publisher => {
                header.pub_count.fetch_sub(1, Ordering::AcqRel) - 1 + header.sub_count.load(Ordering::Acquire)
            }
            EndpointRole::Subscriber => {
                header.sub_count.fetch_sub(1, Ordering::AcqRel) - 1 + header.pub_count.load(Ordering::Acquire)
            }
        };

        if remaining == 0 {
            self.shm.unlink();
            log::debug!("topic '{}': last endpoint gone, unlinked queue file", self.topic);
        }
        Ok(())
    }

    /// Publish `len` bytes already written at `offset` in `alloc` to the
    /// topic, overwriting the oldest row if it is still live.
    pub fn publish(
        &self,
        endpoint: &Endpoint,
        alloc: &Allocator,
        offset: i64,
        len: u64,
        registry: &AllocatorRegistry,
    ) -> Result<()> {
        #[cfg(unix)]
        let _guard = self.read_lock()?;

        let header = self.header();
        let ring_len = header.len.load(Ordering::Relaxed);
        let ring_len32 = ring_len as u32;

        let prev = header.index.fetch_add(1, Ordering::AcqRel);
        let slot = (prev % ring_len32) as usize;
        let mut normalized = prev + 1;
        while normalized >= ring_len32 {
            match header.index.compare_exchange_weak(
                normalized,
                normalized - ring_len32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => normalized = actual,
            }
        }

        let row_refs = self.row_refs(ring_len);
        let row = &row_refs[slot];
        lock_row(row);

        if row.interest_count.load(Ordering::Acquire) > 0 {
            log::warn!(
                "topic '{}': overwriting still-live row {slot} (overwrite-oldest policy)",
                self.topic
            );
            let availability = row.availability.load(Ordering::Acquire);
            let entries = self.entries(ring_len);
            for d in 0..DOMAINS_PER_TOPIC {
                if availability & (1 << d) != 0 {
                    let entry = &entries[d * ring_len as usize + slot];
                    let shmem_id = entry.alloc_shmem_id.load(Ordering::Relaxed);
                    let off = entry.offset.load(Ordering::Relaxed) as i64;
                    if let Ok(a) = registry.lookup_or_remap(shmem_id, || Allocator::remap(shmem_id)) {
                        a.deallocate(off);
                        registry.descriptor_detached(shmem_id);
                    }
                }
            }
        }

        let entries = self.entries(ring_len);
        let entry = &entries[endpoint.array_num * ring_len as usize + slot];
        entry.alloc_shmem_id.store(alloc.shmem_id(), Ordering::Relaxed);
        entry.offset.store(offset as i32, Ordering::Relaxed);
        entry.len.store(len, Ordering::Relaxed);
        registry.descriptor_attached(alloc.shmem_id());

        let sub_count = header.sub_count.load(Ordering::Acquire);
        row.availability.store(1 << endpoint.array_num, Ordering::Release);
        row.interest_count.store(sub_count, Ordering::Release);
        header.published.store(1, Ordering::Release);

        unlock_row(row);

        #[cfg(unix)]
        self.fifo.signal()?;

        Ok(())
    }

    /// Advance `endpoint` to the next available message, returning `None`
    /// when caught up with the publisher(s).
    pub fn take(
        &self,
        endpoint: &mut Endpoint,
        own_alloc: &Allocator,
        registry: &AllocatorRegistry,
    ) -> Result<Option<TakeResult>> {
        #[cfg(unix)]
        let _guard = self.read_lock()?;

        let header = self.header();
        let ring_len = header.len.load(Ordering::Relaxed);
        let ring_len32 = ring_len as u32;
        let head = header.index.load(Ordering::Acquire);

        let backlog = (head + ring_len32 - endpoint.next_index) % ring_len32;
        let mut i = endpoint.next_index;
        if backlog > endpoint.depth {
            i = (head + ring_len32 - endpoint.depth) % ring_len32;
        }
        if i == head {
            return Ok(None);
        }

        let row_refs = self.row_refs(ring_len);
        let row = &row_refs[i as usize];
        lock_row(row);

        let availability = row.availability.load(Ordering::Acquire);
        let my_bit = 1u32 << endpoint.array_num;

        let result = if availability & my_bit != 0 {
            let entries = self.entries(ring_len);
            let entry = &entries[endpoint.array_num * ring_len as usize + i as usize];
            let shmem_id = entry.alloc_shmem_id.load(Ordering::Relaxed);
            let offset = entry.offset.load(Ordering::Relaxed) as i64;
            let len = entry.len.load(Ordering::Relaxed);
            let src = registry.lookup_or_remap(shmem_id, || Allocator::remap(shmem_id))?;
            src.share(offset);
            TakeResult {
                alloc_shmem_id: shmem_id,
                offset,
                len,
            }
        } else {
            let src_domain = match (0..DOMAINS_PER_TOPIC).find(|d| availability & (1 << d) != 0) {
                Some(d) => d,
                None => HazmemError::fatal("row has no available domain copies"),
            };
            let entries = self.entries(ring_len);
            let src_entry = &entries[src_domain * ring_len as usize + i as usize];
            let src_shmem_id = src_entry.alloc_shmem_id.load(Ordering::Relaxed);
            let src_offset = src_entry.offset.load(Ordering::Relaxed) as i64;
            let src_len = src_entry.len.load(Ordering::Relaxed);

            let src_alloc = registry.lookup_or_remap(src_shmem_id, || Allocator::remap(src_shmem_id))?;
            let dst_offset = own_alloc.copy_cross(&src_alloc, src_offset, src_len as usize)?;

            let dst_entry = &entries[endpoint.array_num * ring_len as usize + i as usize];
            dst_entry
                .alloc_shmem_id
                .store(own_alloc.shmem_id(), Ordering::Relaxed);
            dst_entry.offset.store(dst_offset as i32, Ordering::Relaxed);
            dst_entry.len.store(src_len, Ordering::Relaxed);
            row.availability.fetch_or(my_bit, Ordering::AcqRel);
            registry.descriptor_attached(own_alloc.shmem_id());

            log::trace!(
                "topic '{}': materialized row {i} into domain {:?}",
                self.topic,
                endpoint.domain
            );

            TakeResult {
                alloc_shmem_id: own_alloc.shmem_id(),
                offset: dst_offset,
                len: src_len,
            }
        };

        let prev_interest = row.interest_count.fetch_sub(1, Ordering::AcqRel);
        if prev_interest <= 1 {
            let availability = row.availability.load(Ordering::Acquire);
            let entries = self.entries(ring_len);
            for d in 0..DOMAINS_PER_TOPIC {
                if availability & (1 << d) != 0 {
                    let entry = &entries[d * ring_len as usize + i as usize];
                    let shmem_id = entry.alloc_shmem_id.load(Ordering::Relaxed);
                    let off = entry.offset.load(Ordering::Relaxed) as i64;
                    if let Ok(a) = registry.lookup_or_remap(shmem_id, || Allocator::remap(shmem_id)) {
                        a.deallocate(off);
                        registry.descriptor_detached(shmem_id);
                    }
                }
            }
        }

        unlock_row(row);

        endpoint.next_index = (i + 1) % ring_len32;

        Ok(Some(result))
    }

    /// Render the header and per-row state for diagnosing a wedged queue.
    /// Carried over from the original's `dump_message_queue` debug helper.
    pub fn debug_dump(&self) -> String {
        let header = self.header();
        let len = header.len.load(Ordering::Relaxed);
        let mut out = format!(
            "topic '{}': index={} len={len} num_domains={} pub={} sub={}\n",
            self.topic,
            header.index.load(Ordering::Relaxed),
            header.num_domains.load(Ordering::Relaxed),
            header.pub_count.load(Ordering::Relaxed),
            header.sub_count.load(Ordering::Relaxed),
        );
        for (i, row) in self.row_refs(len).iter().enumerate() {
            out.push_str(&format!(
                "  row {i}: interest={} availability={:#04b}\n",
                row.interest_count.load(Ordering::Relaxed),
                row.availability.load(Ordering::Relaxed),
            ));
        }
        out
    }
}

#[cfg(unix)]
impl Drop for TopicQueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.lock_fd) };
    }
}

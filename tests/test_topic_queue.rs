// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Integration tests for TopicQueue: real /dev/shm segments, a sibling FIFO,
// and fcntl advisory locks, exercised by opening the same named queue twice
// in this process to stand in for two cooperating processes (the same
// technique the teacher's own shm/channel integration tests use).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hazmem::alloc::{Allocator, AllocatorConfig, DeviceType};
use hazmem::registry::AllocatorRegistry;
use hazmem::{EndpointRole, ShmHandle, ShmOpenMode, TopicDirectory, TopicQueue};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_topic(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/{prefix}_{}", n)
}

fn host_config(capacity: u32, item_size: u32) -> AllocatorConfig {
    AllocatorConfig {
        capacity,
        item_size,
        domain: DeviceType::Host,
        device_number: 0,
    }
}

#[test]
fn publish_take_same_domain_is_zero_copy() {
    let topic = unique_topic("zero_copy");
    let mut queue = TopicQueue::open_or_create(&topic).expect("open queue");
    let registry = AllocatorRegistry::global();

    let alloc = Allocator::create(host_config(4, 16)).expect("create allocator");

    let pub_ep = queue
        .register_publisher(DeviceType::Host, alloc.shmem_id(), 2)
        .expect("register publisher");
    let mut sub_ep = queue
        .register_subscriber(DeviceType::Host, alloc.shmem_id(), 2)
        .expect("register subscriber");

    let offset = alloc.allocate().expect("allocate");
    alloc.copy_to(offset, b"hello").expect("copy_to");
    queue
        .publish(&pub_ep, &alloc, offset, 5, registry)
        .expect("publish");

    let result = queue
        .take(&mut sub_ep, &alloc, registry)
        .expect("take")
        .expect("message available");

    assert_eq!(result.alloc_shmem_id, alloc.shmem_id());
    assert_eq!(result.offset, offset);

    let mut buf = [0u8; 5];
    alloc.copy_from(result.offset, &mut buf).expect("copy_from");
    assert_eq!(&buf, b"hello");

    queue.unregister(&pub_ep).expect("unregister pub");
    queue.unregister(&sub_ep).expect("unregister sub");
}

#[test]
fn overwriting_a_row_reclaims_its_descriptor() {
    let topic = unique_topic("overwrite");
    let mut queue = TopicQueue::open_or_create(&topic).expect("open queue");
    let registry = AllocatorRegistry::global();

    // Ring capacity exactly matches the queue depth so the fourth publish
    // both wraps the queue and exhausts the allocator unless the overwritten
    // row's slot is actually reclaimed.
    let alloc = Allocator::create(host_config(4, 8)).expect("create allocator");

    let pub_ep = queue
        .register_publisher(DeviceType::Host, alloc.shmem_id(), 3)
        .expect("register publisher");
    // A registered-but-not-yet-taken subscriber gives every row a nonzero
    // interest_count, so overwriting it must go through the reclaim path.
    let _sub_ep = queue
        .register_subscriber(DeviceType::Host, alloc.shmem_id(), 3)
        .expect("register subscriber");

    for marker in 0u8..4 {
        let offset = alloc.allocate().expect("ring has room for this publish");
        alloc.copy_to(offset, &[marker]).expect("copy_to");
        queue
            .publish(&pub_ep, &alloc, offset, 1, registry)
            .expect("publish");
    }

    // The 4th publish overwrote row 0 (still holding sub's uncollected
    // interest), which must have deallocated that row's original slot.
    let fifth = alloc.allocate();
    assert!(
        fifth.is_ok(),
        "overwrite should have reclaimed the evicted row's slot"
    );
}

#[test]
fn unregistering_last_endpoint_unlinks_the_queue_but_not_the_fifo() {
    let topic = unique_topic("teardown");
    let mut queue = TopicQueue::open_or_create(&topic).expect("open queue");

    let alloc = Allocator::create(host_config(2, 8)).expect("create allocator");
    let pub_ep = queue
        .register_publisher(DeviceType::Host, alloc.shmem_id(), 1)
        .expect("register publisher");
    let sub_ep = queue
        .register_subscriber(DeviceType::Host, alloc.shmem_id(), 1)
        .expect("register subscriber");

    queue.unregister(&pub_ep).expect("unregister pub");
    queue.unregister(&sub_ep).expect("unregister sub");

    let suffix = hazmem::shm_name::sanitize_topic(&topic);
    let name = format!("ros2_hazcat.{suffix}");
    let reopened = ShmHandle::acquire(&name, 1, ShmOpenMode::Open);
    assert!(
        reopened.is_err(),
        "queue segment should be unlinked once pub_count + sub_count reaches zero"
    );

    let fifo_path = hazmem::fifo::fifo_path(&topic);
    assert!(
        fifo_path.exists(),
        "the signal FIFO is meant to outlive any single endpoint"
    );
}

#[test]
fn registering_endpoint_role_is_recorded() {
    let topic = unique_topic("role");
    let mut queue = TopicQueue::open_or_create(&topic).expect("open queue");
    let alloc = Allocator::create(host_config(2, 8)).expect("create allocator");

    let pub_ep = queue
        .register_publisher(DeviceType::Host, alloc.shmem_id(), 1)
        .expect("register publisher");
    assert_eq!(pub_ep.role, EndpointRole::Publisher);
    assert_eq!(pub_ep.array_num, 0);

    queue.unregister(&pub_ep).expect("unregister");
}

#[test]
fn topic_directory_shares_one_queue_across_local_endpoints() {
    let topic = unique_topic("directory");
    let dir = TopicDirectory::global();
    let alloc = Allocator::create(host_config(2, 8)).expect("create allocator");

    let (pub_queue, pub_ep) = dir
        .register_publisher(&topic, DeviceType::Host, alloc.shmem_id(), 1)
        .expect("register publisher via directory");
    let (sub_queue, sub_ep) = dir
        .register_subscriber(&topic, DeviceType::Host, alloc.shmem_id(), 1)
        .expect("register subscriber via directory");

    assert!(
        Arc::ptr_eq(&pub_queue, &sub_queue),
        "two local endpoints on the same topic must share one TopicQueue"
    );

    dir.unregister(&topic, &pub_queue, &pub_ep).expect("unregister pub");
    dir.unregister(&topic, &sub_queue, &sub_ep).expect("unregister sub");
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide directory of attached topic queues, keyed by topic name so
// that two endpoints in the same process share one mapping (and one file
// lock fd, one FIFO) instead of opening the segment twice. Grounded on the
// same cache shape as `registry.rs` / the teacher's `ShmCache`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::alloc::DeviceType;
use crate::error::Result;

use super::{Endpoint, TopicQueue};

struct Entry {
    queue: Arc<Mutex<TopicQueue>>,
    refs: usize,
}

/// Process-wide map from topic name to its attached queue.
pub struct TopicDirectory {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TopicDirectory {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static TopicDirectory {
        static DIR: OnceLock<TopicDirectory> = OnceLock::new();
        DIR.get_or_init(TopicDirectory::new)
    }

    /// Attach to `topic`, creating the backing queue on first use in this
    /// process and incrementing an in-process reference count thereafter.
    pub fn attach(&self, topic: &str) -> Result<Arc<Mutex<TopicQueue>>> {
        let mut map = self.entries.lock().unwrap();
        if let Some(entry) = map.get_mut(topic) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.queue));
        }
        let queue = Arc::new(Mutex::new(TopicQueue::open_or_create(topic)?));
        map.insert(
            topic.to_string(),
            Entry {
                queue: Arc::clone(&queue),
                refs: 1,
            },
        );
        Ok(queue)
    }

    /// Drop this process's interest in `topic`, dropping the shared
    /// `TopicQueue` (and unmapping its shm) once no local endpoint still
    /// holds it.
    pub fn detach(&self, topic: &str) {
        let mut map = self.entries.lock().unwrap();
        if let Some(entry) = map.get_mut(topic) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(topic);
                log::debug!("directory: last local endpoint for topic '{topic}' detached");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Attach to `topic` and register a publisher on it in one step, so
    /// that two local endpoints on the same topic share one `TopicQueue`
    /// (and its fd/FIFO) instead of each opening the segment independently.
    pub fn register_publisher(
        &self,
        topic: &str,
        domain: DeviceType,
        alloc_shmem_id: i32,
        depth: u32,
    ) -> Result<(Arc<Mutex<TopicQueue>>, Endpoint)> {
        let queue = self.attach(topic)?;
        let endpoint = {
            let mut guard = queue.lock().unwrap();
            guard.register_publisher(domain, alloc_shmem_id, depth)
        };
        match endpoint {
            Ok(endpoint) => Ok((queue, endpoint)),
            Err(e) => {
                self.detach(topic);
                Err(e)
            }
        }
    }

    /// Same as `register_publisher`, for a subscriber.
    pub fn register_subscriber(
        &self,
        topic: &str,
        domain: DeviceType,
        alloc_shmem_id: i32,
        depth: u32,
    ) -> Result<(Arc<Mutex<TopicQueue>>, Endpoint)> {
        let queue = self.attach(topic)?;
        let endpoint = {
            let mut guard = queue.lock().unwrap();
            guard.register_subscriber(domain, alloc_shmem_id, depth)
        };
        match endpoint {
            Ok(endpoint) => Ok((queue, endpoint)),
            Err(e) => {
                self.detach(topic);
                Err(e)
            }
        }
    }

    /// Unregister `endpoint` from `topic`'s queue and drop this process's
    /// local interest in it, unmapping the queue once nothing else in this
    /// process still holds it.
    pub fn unregister(&self, topic: &str, queue: &Mutex<TopicQueue>, endpoint: &Endpoint) -> Result<()> {
        queue.lock().unwrap().unregister(endpoint)?;
        self.detach(topic);
        Ok(())
    }
}

//! Consumer handle registry.
//! A slot arena of weak consumer references, deduplicated by object identity,
//! with liveness flags and container-destruction cascading. Also remembers the
//! last text each consumer submitted, independent of handle lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tracing::debug;

/// Identifier of a host-side container (window, panel, scene) owning consumers.
pub type ContainerId = u64;

/// Receives finished translations. Implemented by the host's presentation layer.
pub trait TextConsumer: Send + Sync {
    /// Locate `original` in the current live text and substitute `translated`.
    fn apply_translation(&self, original: &str, translated: &str);

    /// Containers whose destruction also destroys this consumer.
    fn containers(&self) -> Vec<ContainerId> {
        Vec::new()
    }
}

/// Stable handle: slot index plus the slot's generation at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Entry {
    consumer: Weak<dyn TextConsumer>,
    key: usize,
    alive: bool,
    refs: u32,
    /// Part of `refs` taken through `acquire_host`.
    host_refs: u32,
    containers: Vec<ContainerId>,
}

/// Last text a consumer submitted. Lives until the consumer dies, so prefix
/// stripping still works after the earlier text was delivered and its handle freed.
struct Submitted {
    consumer: Weak<dyn TextConsumer>,
    containers: Vec<ContainerId>,
    text: String,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Identity of a consumer object: the address of its allocation.
fn identity(consumer: &Arc<dyn TextConsumer>) -> usize {
    Arc::as_ptr(consumer) as *const () as usize
}

#[derive(Default)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<usize, HandleId>,
    by_container: HashMap<ContainerId, HashSet<HandleId>>,
    submitted: HashMap<usize, Submitted>,
    /// Size at which dead `submitted` records are swept.
    prune_at: usize,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing live handle for `consumer`, or a freshly allocated one.
    /// Either way the handle gains one reference.
    pub fn acquire(&mut self, consumer: &Arc<dyn TextConsumer>) -> HandleId {
        let key = identity(consumer);
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(entry) = self.entry_mut(id) {
                // Same address but the old object is gone: a new object reused the allocation.
                if entry.alive && entry.consumer.strong_count() > 0 {
                    entry.refs += 1;
                    return id;
                }
            }
            self.kill(id);
        }

        let containers = consumer.containers();
        let entry = Entry {
            consumer: Arc::downgrade(consumer),
            key,
            alive: true,
            refs: 1,
            host_refs: 0,
            containers: containers.clone(),
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                HandleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                HandleId {
                    index,
                    generation: 0,
                }
            }
        };

        self.by_key.insert(key, id);
        for container in containers {
            self.by_container.entry(container).or_default().insert(id);
        }
        debug!(index = id.index, generation = id.generation, "consumer handle allocated");
        id
    }

    /// Add a reference to an existing handle.
    pub fn retain(&mut self, id: HandleId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.refs += 1;
        }
    }

    /// Like `acquire`, for a reference the host holds itself. Only
    /// `release_host` gives it back, so it cannot eat a queued request's reference.
    pub fn acquire_host(&mut self, consumer: &Arc<dyn TextConsumer>) -> HandleId {
        let id = self.acquire(consumer);
        if let Some(entry) = self.entry_mut(id) {
            entry.host_refs += 1;
        }
        id
    }

    /// Return a reference taken with `acquire_host`. False when none is held.
    pub fn release_host(&mut self, id: HandleId) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        if entry.host_refs == 0 {
            return false;
        }
        entry.host_refs -= 1;
        self.release(id);
        true
    }

    /// Drop one reference; at zero the handle is unregistered and its slot freed.
    pub fn release(&mut self, id: HandleId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        self.kill(id);

        let slot = &mut self.slots[id.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    /// Current live handle for `consumer`, if any.
    pub fn lookup(&self, consumer: &Arc<dyn TextConsumer>) -> Option<HandleId> {
        let id = *self.by_key.get(&identity(consumer))?;
        self.is_alive(id).then_some(id)
    }

    /// Host-driven destruction notice for one consumer.
    pub fn mark_dead(&mut self, consumer: &Arc<dyn TextConsumer>) {
        let key = identity(consumer);
        self.submitted.remove(&key);
        if let Some(&id) = self.by_key.get(&key) {
            self.kill(id);
        }
    }

    /// Marks every handle registered under `container` dead.
    pub fn notify_container_destroyed(&mut self, container: ContainerId) -> usize {
        self.submitted
            .retain(|_, record| !record.containers.contains(&container));
        let Some(members) = self.by_container.remove(&container) else {
            return 0;
        };
        let count = members.len();
        for id in members {
            self.kill(id);
        }
        debug!(container, handles = count, "container destroyed");
        count
    }

    pub fn is_alive(&self, id: HandleId) -> bool {
        self.entry(id)
            .map_or(false, |e| e.alive && e.consumer.strong_count() > 0)
    }

    /// The consumer behind a live handle.
    pub fn live_consumer(&self, id: HandleId) -> Option<Arc<dyn TextConsumer>> {
        let entry = self.entry(id)?;
        if !entry.alive {
            return None;
        }
        entry.consumer.upgrade()
    }

    /// Record `text` as `consumer`'s latest submission, returning the previous one.
    pub fn swap_last_submitted(
        &mut self,
        consumer: &Arc<dyn TextConsumer>,
        text: &str,
    ) -> Option<String> {
        let key = identity(consumer);
        if let Some(record) = self.submitted.get_mut(&key) {
            // The record's weak ref pins the allocation, so a live one is this consumer.
            if record.consumer.strong_count() > 0 {
                return Some(std::mem::replace(&mut record.text, text.to_string()));
            }
        }

        if self.submitted.len() >= self.prune_at {
            self.submitted
                .retain(|_, record| record.consumer.strong_count() > 0);
            self.prune_at = (self.submitted.len() * 2).max(64);
        }
        self.submitted.insert(
            key,
            Submitted {
                consumer: Arc::downgrade(consumer),
                containers: consumer.containers(),
                text: text.to_string(),
            },
        );
        None
    }

    /// Forget the remembered submission of the consumer behind `id`, so its
    /// next submission is queued whole.
    pub fn forget_submitted(&mut self, id: HandleId) {
        if let Some(key) = self.entry(id).map(|e| e.key) {
            self.submitted.remove(&key);
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: HandleId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: HandleId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Flip liveness and drop the handle from the identity and container indices.
    fn kill(&mut self, id: HandleId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.alive = false;
        let key = entry.key;
        let containers = std::mem::take(&mut entry.containers);

        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        for container in containers {
            if let Some(members) = self.by_container.get_mut(&container) {
                members.remove(&id);
                if members.is_empty() {
                    self.by_container.remove(&container);
                }
            }
        }
    }
}

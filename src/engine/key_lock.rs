//! Per-(username, instrument) serialization
//! Orders on the same key run one at a time; different keys run in parallel.

use crate::store::HoldingKey;
use async_trait::async_trait;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof of exclusive access to one key. Released on drop.
pub struct KeyPermit {
    _held: Box<dyn Any + Send>,
}

impl KeyPermit {
    pub fn new<G: Any + Send>(guard: G) -> Self {
        Self {
            _held: Box::new(guard),
        }
    }
}

/// Capability to serialize work per holding key.
///
/// Implementations may be in-process, a database advisory lock, or a
/// distributed lock service; callers only rely on mutual exclusion.
#[async_trait]
pub trait KeyLock: Send + Sync {
    async fn acquire(&self, key: &HoldingKey) -> KeyPermit;
}

type Slots = DashMap<HoldingKey, Arc<Mutex<()>>>;

/// In-process lock table. A key's slot lives only while someone holds or
/// waits for it.
#[derive(Default)]
pub struct LocalKeyLock {
    slots: Arc<Slots>,
}

impl LocalKeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

struct SlotGuard {
    key: HoldingKey,
    slots: Arc<Slots>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Unlock first; afterwards only the table and any waiters hold the slot.
        self.guard.take();
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[async_trait]
impl KeyLock for LocalKeyLock {
    async fn acquire(&self, key: &HoldingKey) -> KeyPermit {
        // Clone the slot out before awaiting so no DashMap shard guard is held.
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        KeyPermit::new(SlotGuard {
            key: key.clone(),
            slots: self.slots.clone(),
            guard: Some(guard),
        })
    }
}

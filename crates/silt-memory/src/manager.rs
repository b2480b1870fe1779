//! Task memory manager.
//!
//! Tracks a shared execution-memory budget across registered consumers.
//! When an allocation does not fit, the manager asks consumers to spill,
//! other consumers first and the requester last, then retries. Spill
//! callbacks are always invoked without the manager's own lock held, so a
//! spilling consumer may free pages and arrays back through the manager.

use crate::array::LongArray;
use crate::consumer::{ConsumerId, MemoryConsumer};
use parking_lot::Mutex;
use silt_common::{MemoryConfig, Result, SealedPage, SortError, WritePage};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Maximum budget-acquire attempts before reporting memory exhaustion.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Central allocator and spill coordinator for one task.
pub struct TaskMemoryManager {
    budget: u64,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    /// Bytes currently charged to consumers.
    used: u64,
    /// Next page number to hand out.
    next_page_number: u32,
    /// Next consumer identity to hand out.
    next_consumer: u64,
    /// Registered spill participants.
    consumers: Vec<(ConsumerId, Weak<dyn MemoryConsumer>)>,
}

impl TaskMemoryManager {
    /// Creates a manager with the given budget.
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            budget: config.budget_bytes as u64,
            state: Mutex::new(ManagerState {
                used: 0,
                next_page_number: 0,
                next_consumer: 1,
                consumers: Vec::new(),
            }),
        })
    }

    /// Returns the total budget in bytes.
    pub fn budget_bytes(&self) -> u64 {
        self.budget
    }

    /// Returns the bytes currently charged to consumers.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Hands out a fresh consumer identity.
    pub fn next_consumer_id(&self) -> ConsumerId {
        let mut state = self.state.lock();
        let id = ConsumerId(state.next_consumer);
        state.next_consumer += 1;
        id
    }

    /// Registers a consumer for cooperative spilling.
    pub fn register_consumer(&self, id: ConsumerId, consumer: Weak<dyn MemoryConsumer>) {
        self.state.lock().consumers.push((id, consumer));
    }

    /// Removes a consumer from the spill registry.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        self.state.lock().consumers.retain(|(cid, _)| *cid != id);
    }

    /// Allocates a write page of `bytes` capacity.
    ///
    /// May invoke spill callbacks, including on the requester itself, to
    /// make room.
    pub fn allocate_page(&self, bytes: usize, requester: ConsumerId) -> Result<WritePage> {
        self.acquire(bytes as u64, requester)?;
        let number = {
            let mut state = self.state.lock();
            let n = state.next_page_number;
            state.next_page_number += 1;
            n
        };
        Ok(WritePage::new(number, bytes))
    }

    /// Allocates a `LongArray` of `words` u64 elements.
    ///
    /// Fails with `MemoryUnavailable` if the budget cannot be satisfied
    /// even after spilling.
    pub fn allocate_array(&self, words: usize, requester: ConsumerId) -> Result<LongArray> {
        self.acquire((words * 8) as u64, requester)?;
        Ok(LongArray::new(words))
    }

    /// Returns a sealed page's bytes to the budget.
    pub fn free_page(&self, page: SealedPage) {
        self.release_bytes(page.allocated() as u64);
    }

    /// Returns an unsealed page's bytes to the budget.
    pub fn free_write_page(&self, page: WritePage) {
        self.release_bytes(page.allocated() as u64);
    }

    /// Returns an array's bytes to the budget.
    pub fn free_array(&self, array: LongArray) {
        self.release_bytes(array.byte_size() as u64);
    }

    /// Returns raw bytes to the budget.
    pub fn release_bytes(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(bytes);
    }

    /// Reserves `bytes` against the budget, spilling consumers on shortfall.
    fn acquire(&self, bytes: u64, requester: ConsumerId) -> Result<()> {
        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            {
                let mut state = self.state.lock();
                if state.used + bytes <= self.budget {
                    state.used += bytes;
                    return Ok(());
                }
            }
            if attempt + 1 == MAX_ACQUIRE_ATTEMPTS {
                break;
            }
            let freed = self.spill_consumers(bytes, requester)?;
            if freed == 0 {
                break;
            }
        }

        let used = self.state.lock().used;
        Err(SortError::MemoryUnavailable {
            requested: bytes,
            used,
            budget: self.budget,
        })
    }

    /// Asks registered consumers to release memory.
    ///
    /// Other consumers are asked before the requester so that a consumer's
    /// own allocation only forces a self-spill as a last resort. Dead
    /// registrations are pruned along the way.
    fn spill_consumers(&self, needed: u64, requester: ConsumerId) -> Result<u64> {
        let live: Vec<(ConsumerId, Arc<dyn MemoryConsumer>)> = {
            let mut state = self.state.lock();
            state.consumers.retain(|(_, weak)| weak.strong_count() > 0);
            state
                .consumers
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|c| (*id, c)))
                .collect()
        };

        let (others, own): (Vec<_>, Vec<_>) =
            live.into_iter().partition(|(id, _)| *id != requester);

        let mut freed = 0u64;
        for (id, consumer) in others.into_iter().chain(own) {
            if freed >= needed {
                break;
            }
            let released = consumer.spill(needed - freed, requester)?;
            if released > 0 {
                debug!(consumer = id.0, released, "consumer released memory under pressure");
            }
            freed += released;
        }
        Ok(freed)
    }
}

impl std::fmt::Debug for TaskMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskMemoryManager")
            .field("budget", &self.budget)
            .field("used", &state.used)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

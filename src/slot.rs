// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-capacity slot pool for one sandbox class. Freed slots go to the
// tail of a FIFO queue so a just-unbound service identity is the last one
// rebound; the OS may keep a dead process briefly alive after unbind and
// immediate reuse would attach to stale state.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::binding::SandboxClass;
use crate::connection::ChildProcessConnection;

struct SlotPool {
    /// `slots[i]` holds the connection currently occupying slot `i`.
    slots: Vec<Option<Arc<ChildProcessConnection>>>,
    /// Free slot indices, reused head-first, reclaimed to the tail.
    free: VecDeque<u32>,
}

/// Bounds the number of simultaneous child processes of one sandbox class.
///
/// Capacity is fixed at construction: it reflects how many service
/// identities the embedder has declared, not a runtime measurement.
pub struct SlotAllocator {
    sandbox_class: SandboxClass,
    inner: Mutex<SlotPool>,
}

impl SlotAllocator {
    pub fn new(sandbox_class: SandboxClass, capacity: usize) -> Self {
        Self {
            sandbox_class,
            inner: Mutex::new(SlotPool {
                slots: (0..capacity).map(|_| None).collect(),
                free: (0..capacity as u32).collect(),
            }),
        }
    }

    pub fn sandbox_class(&self) -> SandboxClass {
        self.sandbox_class
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn allocated_count(&self) -> usize {
        let pool = self.inner.lock();
        pool.slots.len() - pool.free.len()
    }

    /// Pop the head of the free queue and build a connection on it via
    /// `make`. `None` means the pool is exhausted, an expected condition
    /// under load, reported to the caller as a value, not an error.
    pub fn allocate(
        &self,
        make: impl FnOnce(u32) -> Arc<ChildProcessConnection>,
    ) -> Option<Arc<ChildProcessConnection>> {
        let mut pool = self.inner.lock();
        let Some(index) = pool.free.pop_front() else {
            warn!(
                class = self.sandbox_class.as_str(),
                capacity = pool.slots.len(),
                "slot pool exhausted"
            );
            return None;
        };
        let conn = make(index);
        debug_assert_eq!(conn.slot_index(), index);
        pool.slots[index as usize] = Some(Arc::clone(&conn));
        Some(conn)
    }

    /// Return `conn`'s slot to the tail of the free queue.
    ///
    /// The slot must currently be occupied by this very connection; anything
    /// else is a double-free or bookkeeping bug and fails fast.
    pub fn free(&self, conn: &Arc<ChildProcessConnection>) {
        let index = conn.slot_index();
        let mut pool = self.inner.lock();
        let occupant = pool
            .slots
            .get_mut(index as usize)
            .unwrap_or_else(|| {
                panic!(
                    "slot {} out of range for {} pool",
                    index,
                    self.sandbox_class.as_str()
                )
            })
            .take();
        match occupant {
            Some(ref c) if Arc::ptr_eq(c, conn) => {}
            other => {
                panic!(
                    "freeing {} slot {} not owned by this connection (occupied: {})",
                    self.sandbox_class.as_str(),
                    index,
                    other.is_some()
                );
            }
        }
        pool.free.push_back(index);
    }
}

//! `SlotPool` — fixed-capacity arena of connection task records.
//!
//! An index-addressed pool sized once at construction (`1 +
//! max_connections`: one slot for the listening task). Allocation pops
//! a LIFO free stack for cache-friendly reuse of recently released
//! slots; release pushes the index back. O(1) both ways, no
//! reallocation, ever.
//!
//! Exhaustion is a signal, not a wait: `allocate` returns `None` and
//! the caller rejects the new connection.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use zrpc_core::task::{ConnTask, TaskKind};

/// Handle to a pool slot: index plus the generation it was allocated
/// under. A released slot advances its generation, so handles (and
/// multiplexer tokens derived from them) for a previous occupant no
/// longer resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId {
    slot: u32,
    generation: u32,
}

impl TaskId {
    #[inline]
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Pack into a multiplexer token.
    #[inline]
    pub fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    /// Unpack from a multiplexer token.
    #[inline]
    pub fn from_token(token: u64) -> Self {
        Self {
            slot: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// Fixed-capacity task arena.
///
/// # Safety
///
/// Slots live in `UnsafeCell`s. The framework's ownership discipline
/// (a task belongs to the dispatcher thread or to exactly one worker
/// thread at any instant, enforced by deregister-before-enqueue) is
/// what makes the handed-out `&mut ConnTask` references exclusive.
/// `allocate`/`release` themselves are thread-safe via the free-stack
/// lock.
pub struct SlotPool {
    slots: Box<[UnsafeCell<ConnTask>]>,
    free: Mutex<Vec<u32>>,
    live: AtomicU32,
}

unsafe impl Send for SlotPool {}
unsafe impl Sync for SlotPool {}

impl SlotPool {
    /// Create a pool with exactly `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let slots: Box<[UnsafeCell<ConnTask>]> = (0..capacity)
            .map(|_| UnsafeCell::new(ConnTask::vacant()))
            .collect();
        // Reverse order so the first allocations come out 0, 1, 2, ...
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            live: AtomicU32::new(0),
        }
    }

    /// Allocate a slot for `fd`, or `None` when the pool is exhausted.
    pub fn allocate(&self, fd: RawFd, kind: TaskKind) -> Option<TaskId> {
        let slot = self.lock_free().pop()?;
        // Safety: the slot was just popped from the free stack, so no
        // other thread holds a reference into it.
        let task = unsafe { &mut *self.slots[slot as usize].get() };
        task.reset(fd, kind);
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(TaskId {
            slot,
            generation: task.generation,
        })
    }

    /// Return a slot to the pool. The caller must own the task and
    /// must not touch it afterwards; its generation is advanced so any
    /// stale `TaskId` stops resolving.
    pub fn release(&self, id: TaskId) {
        // Safety: the releasing thread owns the task.
        let task = unsafe { &mut *self.slots[id.slot as usize].get() };
        debug_assert_eq!(task.generation, id.generation, "double release?");
        task.generation = task.generation.wrapping_add(1);
        task.fd = -1;
        task.kind = TaskKind::Unknown;
        self.lock_free().push(id.slot);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Resolve a handle to its task. Returns `None` when the handle's
    /// generation no longer matches (the slot was released, and
    /// possibly recycled, since the handle was made).
    ///
    /// # Safety
    ///
    /// The caller must be the task's current owner per the ownership
    /// discipline above; the returned reference aliases the slot.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self, id: TaskId) -> Option<&mut ConnTask> {
        if id.slot as usize >= self.slots.len() {
            return None;
        }
        let task = &mut *self.slots[id.slot as usize].get();
        if task.generation != id.generation {
            return None;
        }
        Some(task)
    }

    /// Number of currently allocated slots.
    #[inline]
    pub fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

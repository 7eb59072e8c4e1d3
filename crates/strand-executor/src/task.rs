//! Generation-tagged task pool and weak task handles.
//!
//! # Overview
//!
//! `TaskPool` is a fixed-capacity, ring-indexed slab. Allocation never
//! blocks and never searches: a shared cursor picks the candidate slot and
//! the slot's generation id decides whether the ring has lapped a task
//! that is still live. Handles are weak references validated by comparing
//! a captured generation against the slot's current one, so a handle can
//! outlive its task without ever dereferencing freed state.
//!
//! # Generation protocol
//!
//! ```text
//! slot id:  odd  = free   (initial sentinel 1)
//!           even = live   (generator starts at 0, steps by 2 -> 2, 4, ...)
//! ```
//!
//! The payload bytes are only well-typed while the slot id is even; the
//! descriptor's function pointers are only valid while the payload is.
//! Storing the live id into the slot is the publication point: a handle
//! that observes the id (acquire) also observes the payload and the
//! descriptor written before it (release).
//!
//! # Concurrency contract
//!
//! `try_alloc` is lock-free against other `try_alloc` calls and against
//! [`destroy_task`] on other slots. The pool does not serialize access to
//! a single slot; the scheduler guarantees a handle is never destroyed
//! while another caller is concurrently handing it out.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem::{self, MaybeUninit};
use std::ptr;

use crossbeam_utils::CachePadded;
use tracing::warn;

use crate::atomic::Atomic32;

/// Generation id marking a slot as free. Odd ids are free, even ids live.
pub const UNUSED_TASK_ID: i32 = 1;

pub type TaskEntryFn = unsafe fn(user_data: *mut c_void);
pub type TaskDestroyFn = unsafe fn(user_data: *mut c_void);

/// A work item storable in a [`TaskPool`].
///
/// The pool erases the concrete type behind the descriptor's function
/// pointers; `run` is what a worker invokes once the task is bound to a
/// fiber.
pub trait Task: Send {
    fn run(&mut self);

    #[cfg(feature = "instrumented")]
    fn debug_id() -> &'static str
    where
        Self: Sized,
    {
        "task"
    }

    #[cfg(feature = "instrumented")]
    fn debug_color() -> u32
    where
        Self: Sized,
    {
        0
    }
}

/// Type-erased description of a pooled task: entry and destroy function
/// pointers plus the user-data pointer they are invoked with.
#[derive(Clone, Copy, Debug)]
pub struct TaskDesc {
    pub entry: Option<TaskEntryFn>,
    pub destroy: Option<TaskDestroyFn>,
    pub user_data: *mut c_void,
    #[cfg(feature = "instrumented")]
    pub debug_id: &'static str,
    #[cfg(feature = "instrumented")]
    pub debug_color: u32,
}

impl TaskDesc {
    pub const fn empty() -> Self {
        Self {
            entry: None,
            destroy: None,
            user_data: ptr::null_mut(),
            #[cfg(feature = "instrumented")]
            debug_id: "",
            #[cfg(feature = "instrumented")]
            debug_color: 0,
        }
    }
}

unsafe fn task_entry_shim<T: Task>(user_data: *mut c_void) {
    let task = unsafe { &mut *(user_data as *mut T) };
    task.run();
}

unsafe fn task_destroy_shim<T>(user_data: *mut c_void) {
    unsafe { ptr::drop_in_place(user_data as *mut T) };
}

/// Leading fields shared by every slot regardless of payload type. Handles
/// point here, which keeps them type-erased.
#[repr(C)]
pub struct SlotHeader {
    id: Atomic32,
    desc: UnsafeCell<TaskDesc>,
}

impl SlotHeader {
    fn unused() -> Self {
        Self {
            id: Atomic32::new(UNUSED_TASK_ID),
            desc: UnsafeCell::new(TaskDesc::empty()),
        }
    }

    /// Current generation id of the slot.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id.load()
    }
}

#[repr(C)]
struct PoolSlot<T> {
    header: SlotHeader,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity ring-indexed task slab. `N` must be a power of two.
pub struct TaskPool<T, const N: usize> {
    slots: Box<[PoolSlot<T>]>,
    id_generator: CachePadded<Atomic32>,
    index: CachePadded<Atomic32>,
}

unsafe impl<T: Send, const N: usize> Send for TaskPool<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for TaskPool<T, N> {}

impl<T: Task, const N: usize> TaskPool<T, N> {
    const MASK: usize = N - 1;

    pub fn new() -> Self {
        const { assert!(N.is_power_of_two(), "task pool capacity must be a power of two") };

        let slots = (0..N)
            .map(|_| PoolSlot {
                header: SlotHeader::unused(),
                payload: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            id_generator: CachePadded::new(Atomic32::new(0)),
            index: CachePadded::new(Atomic32::new(0)),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Moves `task` into the slot under the allocation cursor and returns
    /// a handle to it.
    ///
    /// Returns the invalid handle when the ring has lapped a slot that is
    /// still live. The id is not re-checked between the parity test and
    /// the payload write; the scheduler never destroys a slot that is
    /// still being handed out.
    pub fn try_alloc(&self, task: T) -> TaskHandle {
        let cursor = self.index.inc_fetch().wrapping_sub(1);
        let slot = &self.slots[(cursor as u32 as usize) & Self::MASK];

        // Even id: the next ring position still holds a live task.
        if slot.header.id.load() & 1 == 0 {
            return TaskHandle::invalid();
        }

        let id = self.id_generator.add_fetch(2);
        let payload = slot.payload.get() as *mut T;
        unsafe {
            ptr::write(payload, task);
            *slot.header.desc.get() = TaskDesc {
                entry: Some(task_entry_shim::<T>),
                destroy: Some(task_destroy_shim::<T>),
                user_data: payload as *mut c_void,
                #[cfg(feature = "instrumented")]
                debug_id: T::debug_id(),
                #[cfg(feature = "instrumented")]
                debug_color: T::debug_color(),
            };
        }
        // Publication point: the slot is live once the even id lands.
        slot.header.id.store(id);

        TaskHandle::new(id, &slot.header)
    }

    /// Like [`TaskPool::try_alloc`], but a full pool is a programming
    /// error and aborts.
    pub fn alloc(&self, task: T) -> TaskHandle {
        let handle = self.try_alloc(task);
        assert!(handle.is_valid(), "task pool exhausted");
        handle
    }
}

impl<T: Task, const N: usize> Default for TaskPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for TaskPool<T, N> {
    fn drop(&mut self) {
        let mut live = 0usize;
        for slot in self.slots.iter() {
            let previous = slot.header.id.store(UNUSED_TASK_ID);
            if previous & 1 == 0 {
                live += 1;
                unsafe { ptr::drop_in_place(slot.payload.get() as *mut T) };
            }
        }
        if live != 0 {
            warn!(live, "task pool dropped while tasks were still live");
        }
    }
}

/// Weak, generation-checked reference to a pooled task.
///
/// Copies share the captured generation; [`TaskHandle::take`] transfers it
/// and leaves the source invalid, mirroring move semantics.
#[derive(Clone, Copy, Debug)]
pub struct TaskHandle {
    check_id: i32,
    slot: *const SlotHeader,
}

unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

impl TaskHandle {
    pub const fn invalid() -> Self {
        Self {
            check_id: UNUSED_TASK_ID,
            slot: ptr::null(),
        }
    }

    fn new(check_id: i32, slot: &SlotHeader) -> Self {
        Self {
            check_id,
            slot,
        }
    }

    /// True while the captured generation still matches the slot.
    pub fn is_valid(&self) -> bool {
        if self.slot.is_null() {
            return false;
        }
        let header = unsafe { &*self.slot };
        header.id.load() == self.check_id
    }

    /// The published descriptor. Calling this on an invalid handle is a
    /// programming error and aborts.
    pub fn desc(&self) -> TaskDesc {
        assert!(self.is_valid(), "task handle is invalid");
        unsafe { *(*self.slot).desc.get() }
    }

    /// Transfers the handle out, leaving `self` invalid.
    pub fn take(&mut self) -> TaskHandle {
        mem::replace(self, Self::invalid())
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Runs the slot's destroy function and returns the slot to the free
/// state. Returns `false` (doing nothing) for an invalid handle or an
/// incomplete descriptor.
pub fn destroy_task(handle: &TaskHandle) -> bool {
    if !handle.is_valid() {
        return false;
    }

    let header = unsafe { &*handle.slot };
    let desc = unsafe { *header.desc.get() };
    let Some(destroy) = desc.destroy else {
        return false;
    };
    if desc.user_data.is_null() {
        return false;
    }

    unsafe { destroy(desc.user_data) };
    header.id.store(UNUSED_TASK_ID);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct CountingTask {
        increment: usize,
    }

    impl Task for CountingTask {
        fn run(&mut self) {
            RUNS.fetch_add(self.increment, Ordering::SeqCst);
        }
    }

    impl Drop for CountingTask {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NopTask;

    impl Task for NopTask {
        fn run(&mut self) {}
    }

    #[test]
    fn generations_are_even_and_step_by_two() {
        let pool: TaskPool<NopTask, 8> = TaskPool::new();
        let first = pool.try_alloc(NopTask);
        let second = pool.try_alloc(NopTask);
        assert!(first.is_valid());
        assert!(second.is_valid());
        assert_eq!(first.check_id, 2);
        assert_eq!(second.check_id, 4);
        assert_eq!(first.check_id & 1, 0);
        assert_eq!(second.check_id & 1, 0);
    }

    #[test]
    fn lapping_a_live_slot_fails_allocation() {
        let pool: TaskPool<NopTask, 4> = TaskPool::new();
        let handles: Vec<_> = (0..4).map(|_| pool.try_alloc(NopTask)).collect();
        assert!(handles.iter().all(TaskHandle::is_valid));

        let overflow = pool.try_alloc(NopTask);
        assert!(!overflow.is_valid());
    }

    #[test]
    fn destroyed_slot_is_reused_and_stale_handles_stay_dead() {
        let pool: TaskPool<NopTask, 4> = TaskPool::new();
        let a = pool.alloc(NopTask);
        let b = pool.alloc(NopTask);
        let c = pool.alloc(NopTask);
        let d = pool.alloc(NopTask);
        assert_eq!(a.check_id, 2);
        assert_eq!(b.check_id, 4);
        assert_eq!(c.check_id, 6);
        assert_eq!(d.check_id, 8);

        assert!(destroy_task(&a));
        assert!(!a.is_valid());

        // Cursor has wrapped back onto the freed slot.
        let e = pool.alloc(NopTask);
        assert_eq!(e.check_id, 10);
        assert!(e.is_valid());
        assert!(!a.is_valid());
        assert!(b.is_valid() && c.is_valid() && d.is_valid());
    }

    #[test]
    fn descriptor_drives_entry_and_destroy() {
        RUNS.store(0, Ordering::SeqCst);
        DROPS.store(0, Ordering::SeqCst);

        let pool: TaskPool<CountingTask, 4> = TaskPool::new();
        let handle = pool.alloc(CountingTask { increment: 3 });

        let desc = handle.desc();
        let entry = desc.entry.expect("entry published");
        unsafe { entry(desc.user_data) };
        assert_eq!(RUNS.load(Ordering::SeqCst), 3);

        assert!(destroy_task(&handle));
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert!(!handle.is_valid());

        // Destroy on a stale handle is a no-op.
        assert!(!destroy_task(&handle));
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn take_transfers_validity() {
        let pool: TaskPool<NopTask, 4> = TaskPool::new();
        let mut handle = pool.alloc(NopTask);
        let moved = handle.take();
        assert!(moved.is_valid());
        assert!(!handle.is_valid());
        assert!(handle.slot.is_null());
        assert_eq!(handle.check_id, UNUSED_TASK_ID);
    }

    #[test]
    fn default_handle_is_invalid() {
        let handle = TaskHandle::default();
        assert!(!handle.is_valid());
        assert!(!destroy_task(&handle));
    }

    #[test]
    fn dropping_the_pool_destroys_live_payloads() {
        static POOL_DROPS: AtomicUsize = AtomicUsize::new(0);

        struct PoolDropTask;

        impl Task for PoolDropTask {
            fn run(&mut self) {}
        }

        impl Drop for PoolDropTask {
            fn drop(&mut self) {
                POOL_DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let pool: TaskPool<PoolDropTask, 4> = TaskPool::new();
            let _a = pool.alloc(PoolDropTask);
            let b = pool.alloc(PoolDropTask);
            assert!(destroy_task(&b));
            assert_eq!(POOL_DROPS.load(Ordering::SeqCst), 1);
        }
        // The still-live task was destroyed by the pool, the freed one only
        // once.
        assert_eq!(POOL_DROPS.load(Ordering::SeqCst), 2);
    }
}

//! Fiber contexts: capture, creation, and the switch primitive.
//!
//! A fiber is a saved register state plus a dedicated stack. Control moves
//! between fibers only through [`Fiber::switch_to`]; a switched-out fiber
//! can later be resumed by any worker thread, which is what lets the
//! scheduler multiplex a small worker pool over a large task population.
//!
//! The POSIX build uses ucontext; the windows build uses native fibers,
//! which also keeps the thread-information-block stack bounds coherent
//! when a fiber migrates across workers.
//!
//! # Claim protocol
//!
//! This module does not serialize access to a fiber. The scheduler must
//! guarantee that at most one worker considers a fiber runnable at a time;
//! two concurrent switches into the same fiber are undefined. Under that
//! guarantee `switch_to` only needs shared references, so a fiber entry
//! function may hold a pointer to its own fiber.

use std::cell::UnsafeCell;
use std::ffi::c_void;
#[cfg(unix)]
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{Ordering, fence};

use crate::stack::{self, StackDesc};
use crate::thread::{EntryPoint, Thread};

#[cfg(unix)]
use libc::{getcontext, makecontext, swapcontext, ucontext_t};

/// A unit of execution with its own stack and saved register context.
///
/// A fiber created with [`Fiber::create`] owns its stack and releases it on
/// drop. A fiber captured with [`Fiber::create_from_thread`] borrows the
/// thread's native stack and releases nothing; the distinction is derived
/// from whether an entry function was supplied.
pub struct Fiber {
    func: Option<EntryPoint>,
    func_data: *mut c_void,
    stack: StackDesc,
    #[cfg(unix)]
    context: UnsafeCell<ucontext_t>,
    #[cfg(windows)]
    context: UnsafeCell<*mut winapi::ctypes::c_void>,
    #[cfg(windows)]
    start_record: *mut WinStartRecord,
    initialized: bool,
}

// A fiber is claimed by at most one worker at a time (scheduler contract);
// the raw pointers inside never alias live Rust references.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

#[cfg(unix)]
impl Fiber {
    pub fn new() -> Self {
        Self {
            func: None,
            func_data: ptr::null_mut(),
            stack: StackDesc::empty(),
            context: UnsafeCell::new(unsafe { mem::zeroed() }),
            initialized: false,
        }
    }

    /// Captures the calling thread as a fiber, borrowing its native stack.
    ///
    /// `thread` must denote the caller; capturing an already-initialized
    /// fiber or a foreign thread is a programming error and aborts.
    pub fn create_from_thread(&mut self, thread: &Thread) {
        assert!(!self.initialized, "fiber is already initialized");
        assert!(
            thread.is_current_thread(),
            "a thread can only be captured as a fiber from itself"
        );

        let context = self.context.get_mut();
        let res = unsafe { getcontext(context) };
        assert_eq!(res, 0, "getcontext failed");
        context.uc_link = ptr::null_mut();
        context.uc_stack.ss_sp = thread.stack_bottom() as *mut c_void;
        context.uc_stack.ss_size = thread.stack_size();
        context.uc_stack.ss_flags = 0;

        self.func = None;
        self.func_data = ptr::null_mut();
        self.stack = StackDesc::from_bounds(thread.stack_bottom(), thread.stack_size());
        self.initialized = true;
    }

    /// Creates a fiber on a fresh guarded stack. The first switch into it
    /// calls `entry(user_data)` on that stack.
    ///
    /// `stack_size` below the platform minimum is a programming error and
    /// aborts; so is re-initialization.
    pub fn create(&mut self, stack_size: usize, entry: EntryPoint, user_data: *mut c_void) {
        assert!(!self.initialized, "fiber is already initialized");
        assert!(
            stack_size >= stack::min_stack_size(),
            "fiber stack size {stack_size} is below the platform minimum"
        );

        self.func = Some(entry);
        self.func_data = user_data;
        self.stack = match stack::alloc_stack(stack_size) {
            Ok(desc) => desc,
            Err(err) => panic!("fiber stack allocation failed: {err}"),
        };

        let context = self.context.get_mut();
        let res = unsafe { getcontext(context) };
        assert_eq!(res, 0, "getcontext failed");
        context.uc_link = ptr::null_mut();
        context.uc_stack.ss_sp = self.stack.stack_bottom() as *mut c_void;
        context.uc_stack.ss_size = self.stack.stack_size();
        context.uc_stack.ss_flags = 0;

        // makecontext arguments are ints, so the entry and user-data
        // pointers travel as 32-bit halves.
        let (entry_lo, entry_hi) = split_raw(entry as usize);
        let (data_lo, data_hi) = split_raw(user_data as usize);
        unsafe {
            makecontext(
                context,
                mem::transmute::<extern "C" fn(u32, u32, u32, u32), extern "C" fn()>(
                    fiber_trampoline,
                ),
                4,
                entry_lo,
                entry_hi,
                data_lo,
                data_hi,
            );
        }

        self.initialized = true;
    }

    /// Transfers the calling worker from `from` to `to`.
    ///
    /// The caller must currently be executing on `from`. All writes made
    /// before the switch are visible on the resuming side, on whichever
    /// worker that turns out to be. The call returns when some later
    /// `switch_to(_, from)` re-enters `from`.
    pub fn switch_to(from: &Fiber, to: &Fiber) {
        fence(Ordering::SeqCst);

        assert!(from.initialized, "switching from an uninitialized fiber");
        assert!(to.initialized, "switching to an uninitialized fiber");

        let res = unsafe { swapcontext(from.context.get(), to.context.get()) };
        assert_eq!(res, 0, "swapcontext failed");
    }
}

#[cfg(unix)]
extern "C" fn fiber_trampoline(entry_lo: u32, entry_hi: u32, data_lo: u32, data_hi: u32) {
    let entry: EntryPoint = unsafe { mem::transmute(join_raw(entry_lo, entry_hi)) };
    let user_data = join_raw(data_lo, data_hi) as *mut c_void;
    unsafe { entry(user_data) };

    // There is no continuation for a fiber that falls off its entry
    // function; the entry must switch away instead of returning.
    process::abort();
}

#[cfg(unix)]
fn split_raw(raw: usize) -> (u32, u32) {
    ((raw as u64 & 0xffff_ffff) as u32, ((raw as u64) >> 32) as u32)
}

#[cfg(unix)]
fn join_raw(lo: u32, hi: u32) -> usize {
    (((hi as u64) << 32) | lo as u64) as usize
}

#[cfg(windows)]
struct WinStartRecord {
    entry: EntryPoint,
    user_data: *mut c_void,
}

#[cfg(windows)]
impl Fiber {
    pub fn new() -> Self {
        Self {
            func: None,
            func_data: ptr::null_mut(),
            stack: StackDesc::empty(),
            context: UnsafeCell::new(ptr::null_mut()),
            start_record: ptr::null_mut(),
            initialized: false,
        }
    }

    pub fn create_from_thread(&mut self, thread: &Thread) {
        use winapi::um::winbase::ConvertThreadToFiber;

        assert!(!self.initialized, "fiber is already initialized");
        assert!(
            thread.is_current_thread(),
            "a thread can only be captured as a fiber from itself"
        );

        let fiber = unsafe { ConvertThreadToFiber(ptr::null_mut()) };
        assert!(!fiber.is_null(), "ConvertThreadToFiber failed");
        *self.context.get_mut() = fiber;

        self.func = None;
        self.func_data = ptr::null_mut();
        self.initialized = true;
    }

    pub fn create(&mut self, stack_size: usize, entry: EntryPoint, user_data: *mut c_void) {
        use winapi::um::winbase::CreateFiber;

        assert!(!self.initialized, "fiber is already initialized");
        assert!(
            stack_size >= stack::min_stack_size(),
            "fiber stack size {stack_size} is below the platform minimum"
        );

        self.func = Some(entry);
        self.func_data = user_data;
        self.start_record = Box::into_raw(Box::new(WinStartRecord { entry, user_data }));

        let fiber = unsafe {
            CreateFiber(
                stack_size,
                Some(fiber_trampoline),
                self.start_record as *mut winapi::ctypes::c_void,
            )
        };
        assert!(!fiber.is_null(), "CreateFiber failed");
        *self.context.get_mut() = fiber;

        self.initialized = true;
    }

    pub fn switch_to(from: &Fiber, to: &Fiber) {
        use winapi::um::winbase::SwitchToFiber;

        fence(Ordering::SeqCst);

        assert!(from.initialized, "switching from an uninitialized fiber");
        assert!(to.initialized, "switching to an uninitialized fiber");

        unsafe { SwitchToFiber(*to.context.get()) };
    }
}

#[cfg(windows)]
unsafe extern "system" fn fiber_trampoline(arg: *mut winapi::ctypes::c_void) {
    let record = unsafe { &*(arg as *const WinStartRecord) };
    unsafe { (record.entry)(record.user_data) };
    process::abort();
}

impl Fiber {
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Usable bounds of the fiber's stack (owned or borrowed).
    #[inline]
    pub fn stack_desc(&self) -> &StackDesc {
        &self.stack
    }

    /// The entry function, or `None` for a fiber captured from a thread.
    #[inline]
    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.func
    }

    /// The opaque pointer the entry function is invoked with.
    #[inline]
    pub fn user_data(&self) -> *mut c_void {
        self.func_data
    }
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        // An entry function means the fiber allocated its stack; a captured
        // thread fiber borrows and releases nothing.
        if self.func.is_some() {
            #[cfg(windows)]
            unsafe {
                winapi::um::winbase::DeleteFiber(*self.context.get_mut());
                drop(Box::from_raw(self.start_record));
            }
            #[cfg(unix)]
            stack::free_stack(self.stack);
        }
        self.initialized = false;
    }
}

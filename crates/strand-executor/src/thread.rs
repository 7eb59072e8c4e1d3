//! Worker-thread bootstrap with caller-owned stacks.
//!
//! Threads are started on stacks obtained from [`crate::stack`] so their
//! exact bounds are known afterward; [`crate::fiber::Fiber::create_from_thread`]
//! borrows those bounds when it captures a thread as a fiber. The windows
//! build leaves stack ownership with the OS because native fibers never
//! need the bounds.

use std::ffi::c_void;
#[cfg(unix)]
use std::mem;
use std::ptr;

use tracing::trace;

#[cfg(unix)]
use crate::stack::{self, StackDesc};

/// Entry-point signature shared by threads and fibers.
pub type EntryPoint = unsafe extern "C" fn(arg: *mut c_void);

struct StartRecord {
    entry: EntryPoint,
    arg: *mut c_void,
}

/// An OS thread with a queryable stack.
pub struct Thread {
    #[cfg(unix)]
    handle: libc::pthread_t,
    #[cfg(unix)]
    stack: Option<StackDesc>,
    #[cfg(windows)]
    handle: winapi::um::winnt::HANDLE,
    #[cfg(windows)]
    thread_id: u32,
    started: bool,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

#[cfg(unix)]
impl Thread {
    pub fn new() -> Self {
        Self {
            handle: unsafe { mem::zeroed() },
            stack: None,
            started: false,
        }
    }

    /// Spawns the thread on a freshly mapped guarded stack of `stack_size`
    /// usable bytes and runs `entry(arg)` on it.
    pub fn start(&mut self, stack_size: usize, entry: EntryPoint, arg: *mut c_void) {
        assert!(!self.started, "thread is already running");

        let desc = match stack::alloc_stack(stack_size) {
            Ok(desc) => desc,
            Err(err) => panic!("worker stack allocation failed: {err}"),
        };

        // Published before pthread_create: the entry function may query the
        // thread object as its first action. pthread_create stores the
        // handle before the new thread begins executing.
        self.stack = Some(desc);
        self.started = true;

        let record = Box::into_raw(Box::new(StartRecord { entry, arg }));
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            let res = libc::pthread_attr_init(&mut attr);
            assert_eq!(res, 0, "pthread_attr_init failed");
            let res = libc::pthread_attr_setstack(
                &mut attr,
                desc.stack_bottom() as *mut c_void,
                desc.stack_size(),
            );
            assert_eq!(res, 0, "pthread_attr_setstack failed");
            let res = libc::pthread_create(
                &mut self.handle,
                &attr,
                thread_trampoline,
                record as *mut c_void,
            );
            assert_eq!(res, 0, "pthread_create failed");
            libc::pthread_attr_destroy(&mut attr);
        }

        trace!(stack_size = desc.stack_size(), "worker thread started");
    }

    /// Joins the thread and releases its stack.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        unsafe {
            libc::pthread_join(self.handle, ptr::null_mut());
        }
        self.started = false;
        if let Some(desc) = self.stack.take() {
            stack::free_stack(desc);
        }
        trace!("worker thread joined");
    }

    pub fn is_current_thread(&self) -> bool {
        self.started && unsafe { libc::pthread_equal(libc::pthread_self(), self.handle) != 0 }
    }

    /// Lowest address of the thread's stack. The thread must be running.
    pub fn stack_bottom(&self) -> *mut u8 {
        self.stack
            .as_ref()
            .expect("thread is not running")
            .stack_bottom()
    }

    /// Usable size of the thread's stack. The thread must be running.
    pub fn stack_size(&self) -> usize {
        self.stack
            .as_ref()
            .expect("thread is not running")
            .stack_size()
    }
}

#[cfg(unix)]
extern "C" fn thread_trampoline(arg: *mut c_void) -> *mut c_void {
    let record = unsafe { Box::from_raw(arg as *mut StartRecord) };
    unsafe { (record.entry)(record.arg) };
    ptr::null_mut()
}

#[cfg(windows)]
impl Thread {
    pub fn new() -> Self {
        Self {
            handle: ptr::null_mut(),
            thread_id: 0,
            started: false,
        }
    }

    pub fn start(&mut self, stack_size: usize, entry: EntryPoint, arg: *mut c_void) {
        use winapi::um::processthreadsapi::{CreateThread, ResumeThread};
        use winapi::um::winbase::CREATE_SUSPENDED;

        assert!(!self.started, "thread is already running");

        // Created suspended so the thread object is fully published before
        // the entry function can query it.
        let record = Box::into_raw(Box::new(StartRecord { entry, arg }));
        let mut thread_id = 0;
        let handle = unsafe {
            CreateThread(
                ptr::null_mut(),
                stack_size,
                Some(thread_trampoline),
                record as *mut winapi::ctypes::c_void,
                CREATE_SUSPENDED,
                &mut thread_id,
            )
        };
        assert!(!handle.is_null(), "CreateThread failed");

        self.handle = handle;
        self.thread_id = thread_id;
        self.started = true;
        unsafe { ResumeThread(handle) };
        trace!(stack_size, "worker thread started");
    }

    pub fn stop(&mut self) {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::synchapi::WaitForSingleObject;
        use winapi::um::winbase::INFINITE;

        if !self.started {
            return;
        }
        unsafe {
            WaitForSingleObject(self.handle, INFINITE);
            CloseHandle(self.handle);
        }
        self.handle = ptr::null_mut();
        self.started = false;
        trace!("worker thread joined");
    }

    pub fn is_current_thread(&self) -> bool {
        use winapi::um::processthreadsapi::GetCurrentThreadId;

        self.started && unsafe { GetCurrentThreadId() } == self.thread_id
    }
}

#[cfg(windows)]
unsafe extern "system" fn thread_trampoline(arg: *mut winapi::ctypes::c_void) -> u32 {
    let record = unsafe { Box::from_raw(arg as *mut StartRecord) };
    unsafe { (record.entry)(record.arg) };
    0
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop();
    }
}

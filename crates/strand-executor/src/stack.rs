//! Guarded stack regions for fibers and worker threads.
//!
//! Regions are whole-page mappings with a `PROT_NONE` (`PAGE_NOACCESS`)
//! guard page at each end, so a runaway fiber faults instead of silently
//! corrupting a neighbouring allocation. The guards are an implementation
//! detail; [`StackDesc`] only exposes the usable bounds.

use std::io;

use tracing::trace;

#[cfg(unix)]
use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, mmap, mprotect,
    munmap,
};

#[cfg(windows)]
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
#[cfg(windows)]
use winapi::um::sysinfoapi::GetSystemInfo;
#[cfg(windows)]
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

/// Bounds of a usable stack region plus the raw mapping backing it.
///
/// A descriptor produced by [`alloc_stack`] owns a mapping and must be
/// returned through [`free_stack`]. Descriptors built from borrowed bounds
/// (a thread's native stack) carry no mapping and are ignored by
/// [`free_stack`].
#[derive(Clone, Copy, Debug)]
pub struct StackDesc {
    raw: *mut u8,
    raw_len: usize,
    bottom: *mut u8,
    top: *mut u8,
}

unsafe impl Send for StackDesc {}

impl StackDesc {
    pub const fn empty() -> Self {
        Self {
            raw: std::ptr::null_mut(),
            raw_len: 0,
            bottom: std::ptr::null_mut(),
            top: std::ptr::null_mut(),
        }
    }

    /// Wraps bounds owned by somebody else (typically an OS thread's own
    /// stack). The resulting descriptor never releases memory.
    pub fn from_bounds(bottom: *mut u8, size: usize) -> Self {
        Self {
            raw: std::ptr::null_mut(),
            raw_len: 0,
            bottom,
            top: unsafe { bottom.add(size) },
        }
    }

    /// Lowest usable address.
    #[inline]
    pub fn stack_bottom(&self) -> *mut u8 {
        self.bottom
    }

    /// One past the highest usable address.
    #[inline]
    pub fn stack_top(&self) -> *mut u8 {
        self.top
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.top as usize - self.bottom as usize
    }
}

/// Size of one virtual-memory page.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[cfg(windows)]
    {
        let mut info = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }
}

/// Smallest stack size [`alloc_stack`] accepts.
pub fn min_stack_size() -> usize {
    #[cfg(unix)]
    {
        (libc::PTHREAD_STACK_MIN).max(2 * page_size())
    }

    #[cfg(windows)]
    {
        64 * 1024
    }
}

/// Maps a guarded stack of at least `size` usable bytes, rounded up to
/// whole pages.
///
/// Sizes below [`min_stack_size`] are a programming error and abort.
pub fn alloc_stack(size: usize) -> io::Result<StackDesc> {
    assert!(
        size >= min_stack_size(),
        "stack size {size} is below the platform minimum {}",
        min_stack_size()
    );

    let page = page_size();
    let usable = (size + page - 1) & !(page - 1);
    let raw_len = usable + 2 * page;

    #[cfg(unix)]
    let raw = {
        #[allow(unused_mut)]
        let mut flags = MAP_PRIVATE | MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MAP_STACK;
        }
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                raw_len,
                PROT_READ | PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let raw = ptr as *mut u8;
        let res = unsafe { mprotect(raw as *mut _, page, PROT_NONE) };
        if res == 0 {
            let high_guard = unsafe { raw.add(page + usable) };
            let res = unsafe { mprotect(high_guard as *mut _, page, PROT_NONE) };
            if res != 0 {
                let err = io::Error::last_os_error();
                unsafe { munmap(raw as *mut _, raw_len) };
                return Err(err);
            }
        } else {
            let err = io::Error::last_os_error();
            unsafe { munmap(raw as *mut _, raw_len) };
            return Err(err);
        }
        raw
    };

    #[cfg(windows)]
    let raw = {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                raw_len,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        let raw = ptr as *mut u8;
        let mut old = 0;
        unsafe {
            VirtualProtect(raw as *mut _, page, PAGE_NOACCESS, &mut old);
            VirtualProtect(
                raw.add(page + usable) as *mut _,
                page,
                PAGE_NOACCESS,
                &mut old,
            );
        }
        raw
    };

    let bottom = unsafe { raw.add(page) };
    let top = unsafe { bottom.add(usable) };
    trace!(size = usable, "allocated guarded stack");
    Ok(StackDesc {
        raw,
        raw_len,
        bottom,
        top,
    })
}

/// Returns a stack obtained from [`alloc_stack`] to the OS. No-op for
/// borrowed or empty descriptors.
pub fn free_stack(desc: StackDesc) {
    if desc.raw.is_null() {
        return;
    }

    #[cfg(unix)]
    unsafe {
        munmap(desc.raw as *mut _, desc.raw_len);
    }

    #[cfg(windows)]
    unsafe {
        VirtualFree(desc.raw as *mut _, 0, MEM_RELEASE);
    }

    trace!(size = desc.stack_size(), "released guarded stack");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_and_is_writable() {
        let desc = alloc_stack(min_stack_size() + 1).expect("stack allocation");
        assert_eq!(desc.stack_size() % page_size(), 0);
        assert!(desc.stack_size() > min_stack_size());

        // Both ends of the usable region must be writable.
        unsafe {
            desc.stack_bottom().write(0xAB);
            desc.stack_top().sub(1).write(0xCD);
            assert_eq!(desc.stack_bottom().read(), 0xAB);
        }
        free_stack(desc);
    }

    #[test]
    fn borrowed_descriptor_reports_bounds() {
        let mut buffer = [0u8; 64];
        let desc = StackDesc::from_bounds(buffer.as_mut_ptr(), buffer.len());
        assert_eq!(desc.stack_size(), 64);
        assert_eq!(desc.stack_bottom(), buffer.as_mut_ptr());
        // Borrowed bounds own nothing; freeing is a no-op.
        free_stack(desc);
    }

    #[test]
    #[should_panic(expected = "below the platform minimum")]
    fn undersized_request_aborts() {
        let _ = alloc_stack(16);
    }
}

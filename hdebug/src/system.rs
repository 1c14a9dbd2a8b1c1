use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios"
    )))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and mprotect
    /// # Safety
    /// see valid mmap, munmap and mprotect usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    }

    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// # Safety
    /// ptr must be page aligned and belong to an mmap allocation of `len`
    #[inline]
    pub unsafe fn set_protection(ptr: *mut u8, len: usize, prot: i32) -> bool {
        // SAFETY: safe if contract holds
        unsafe { mprotect(ptr.cast(), len, prot) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Round `size` up to a whole number of OS pages, at least one.
pub fn page_round_up(size: usize) -> usize {
    let size = size.max(1);
    size.div_ceil(OS_PAGE_SIZE) * OS_PAGE_SIZE
}

/// Whether this platform can revoke access to mapped pages.
pub const fn page_protection_available() -> bool {
    cfg!(unix)
}

#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(_size: usize) -> Option<NonNull<u8>> {
    None
}

#[cfg(unix)]
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

#[cfg(not(unix))]
pub fn unmap_memory(_ptr: NonNull<u8>, _size: usize) {}

/// Revoke all access to a mapped region. Any later read or write faults.
#[cfg(unix)]
#[must_use]
pub fn protect_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must be from mmap allocation of `size`
    unsafe { unix::set_protection(ptr.as_ptr(), size, unix::PROT_NONE) }
}

#[cfg(not(unix))]
#[must_use]
pub fn protect_memory(_ptr: NonNull<u8>, _size: usize) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn page_round_up_never_returns_zero() {
        assert_eq!(page_round_up(0), OS_PAGE_SIZE);
        assert_eq!(page_round_up(1), OS_PAGE_SIZE);
        assert_eq!(page_round_up(OS_PAGE_SIZE), OS_PAGE_SIZE);
        assert_eq!(page_round_up(OS_PAGE_SIZE + 1), 2 * OS_PAGE_SIZE);
    }

    #[test]
    fn mapped_pages_can_be_protected_and_unmapped() {
        let size = page_round_up(10);
        let ptr = map_memory(size).expect("mmap");
        unsafe { ptr.as_ptr().write(7) };
        assert_eq!(unsafe { ptr.as_ptr().read() }, 7);
        assert!(protect_memory(ptr, size), "mprotect PROT_NONE failed");
        // protected pages are released without touching them
        unmap_memory(ptr, size);
    }
}

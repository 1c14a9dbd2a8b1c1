use std::ptr::{self, NonNull};

use crate::{
    Error, ProtectionStrategy, RawData,
    system::{map_memory, page_round_up, protect_memory, unmap_memory},
};

/// Poison written over quarantined storage.
pub const CANARY_BYTE: u8 = 0xDD;

enum Storage {
    /// Whole pages from mmap, so access can be revoked.
    Mapped { ptr: NonNull<u8>, mapped: usize },
    /// A leaked `Box<[u8]>` of the buffer's length. Native code may write
    /// through the pointer, so no shared borrow of it is ever kept.
    Heap { ptr: NonNull<u8> },
}

/// Storage whose address was handed to native code through a handle
/// (e.g. the UTF-8 bytes of a string). It outlives the handle's close by
/// the quarantine period.
pub struct GuardedBuffer {
    storage: Storage,
    len: usize,
    protected: bool,
}

// SAFETY: the storage is exclusively owned by the buffer
unsafe impl Send for GuardedBuffer {}

impl GuardedBuffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn is_page_protected(&self) -> bool {
        self.protected && matches!(self.storage, Storage::Mapped { .. })
    }

    fn as_ptr(&self) -> *mut u8 {
        match &self.storage {
            Storage::Mapped { ptr, .. } | Storage::Heap { ptr } => ptr.as_ptr(),
        }
    }

    pub fn raw_data(&self) -> RawData {
        RawData::new(self.as_ptr(), self.len)
    }

    fn poison(&mut self) {
        // SAFETY: writable for `len` bytes until protected
        unsafe { self.as_ptr().write_bytes(CANARY_BYTE, self.len) };
    }
}

impl Drop for GuardedBuffer {
    fn drop(&mut self) {
        match self.storage {
            Storage::Mapped { ptr, mapped } => {
                unmap_memory(ptr, mapped);
            }
            Storage::Heap { ptr } => {
                let slice =
                    ptr::slice_from_raw_parts_mut(ptr.as_ptr(), self.len);
                // SAFETY: leaked from a `Box<[u8]>` of this length
                drop(unsafe { Box::from_raw(slice) });
            }
        }
    }
}

/// Memory protection policy applied to closed handles.
#[derive(Debug)]
pub struct Guard {
    strategy: ProtectionStrategy,
}

impl Guard {
    pub fn new(strategy: ProtectionStrategy) -> Self {
        Self { strategy }
    }

    /// Copy `bytes` into storage the guard can later quarantine.
    pub fn allocate(&self, bytes: &[u8]) -> Result<GuardedBuffer, Error> {
        let storage = match self.strategy {
            ProtectionStrategy::PageProtect => {
                let mapped = page_round_up(bytes.len());
                let ptr = map_memory(mapped).ok_or(Error::Allocation {
                    what: "protected raw data pages",
                })?;
                // SAFETY: freshly mapped, `mapped >= bytes.len()`
                unsafe {
                    ptr.as_ptr()
                        .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len())
                };
                Storage::Mapped { ptr, mapped }
            }
            ProtectionStrategy::CanaryFill => {
                let boxed: Box<[u8]> = bytes.into();
                let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
                Storage::Heap { ptr }
            }
        };
        Ok(GuardedBuffer {
            storage,
            len: bytes.len(),
            protected: false,
        })
    }

    /// Make a closed record's storage unusable without freeing it.
    pub fn quarantine(&self, buffer: &mut GuardedBuffer) {
        if buffer.protected {
            return;
        }
        buffer.poison();
        if let Storage::Mapped { ptr, mapped } = buffer.storage {
            if !protect_memory(ptr, mapped) {
                log::warn!(
                    "mprotect failed for {mapped} bytes at {ptr:p}, \
                     relying on poison only"
                );
            }
        }
        buffer.protected = true;
    }

    /// Whether quarantined storage still holds only poison. Page-protected
    /// storage cannot be written without faulting, so it is always intact.
    pub fn is_intact(&self, buffer: &GuardedBuffer) -> bool {
        if !buffer.protected {
            return true;
        }
        match buffer.storage {
            Storage::Mapped { .. } => true,
            Storage::Heap { ptr } => {
                // SAFETY: live allocation of `len` bytes
                let bytes = unsafe {
                    std::slice::from_raw_parts(ptr.as_ptr(), buffer.len)
                };
                bytes.iter().all(|&b| b == CANARY_BYTE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_fill_poisons_quarantined_bytes() {
        let guard = Guard::new(ProtectionStrategy::CanaryFill);
        let mut buffer = guard.allocate(b"hello").expect("allocate");
        let data = buffer.raw_data();
        assert_eq!(unsafe { data.as_bytes() }, b"hello");

        guard.quarantine(&mut buffer);
        assert!(buffer.is_protected());
        assert!(!buffer.is_page_protected());
        assert_eq!(unsafe { data.as_bytes() }, &[CANARY_BYTE; 5]);
        assert!(guard.is_intact(&buffer));
    }

    #[test]
    fn native_writes_reach_the_owned_storage() {
        let guard = Guard::new(ProtectionStrategy::CanaryFill);
        let mut buffer = guard.allocate(b"abc").expect("allocate");
        let data = buffer.raw_data();
        unsafe { data.as_ptr().cast_mut().add(1).write(b'X') };
        assert_eq!(unsafe { buffer.raw_data().as_bytes() }, b"aXc");
        guard.quarantine(&mut buffer);
        assert_eq!(unsafe { data.as_bytes() }, &[CANARY_BYTE; 3]);
    }

    #[test]
    fn canary_damage_is_detected() {
        let guard = Guard::new(ProtectionStrategy::CanaryFill);
        let mut buffer = guard.allocate(b"abc").expect("allocate");
        guard.quarantine(&mut buffer);
        // a dangling writer scribbles over closed storage
        unsafe { buffer.raw_data().as_ptr().cast_mut().write(b'x') };
        assert!(!guard.is_intact(&buffer));
    }

    #[cfg(unix)]
    #[test]
    fn page_protect_maps_whole_pages() {
        let guard = Guard::new(ProtectionStrategy::PageProtect);
        let mut buffer = guard.allocate(b"page").expect("allocate");
        assert_eq!(unsafe { buffer.raw_data().as_bytes() }, b"page");
        guard.quarantine(&mut buffer);
        assert!(buffer.is_page_protected());
        assert!(guard.is_intact(&buffer));
        // dropping unmaps protected pages without touching them
        drop(buffer);
    }

    #[test]
    fn empty_buffers_are_supported() {
        let guard = Guard::new(ProtectionStrategy::CanaryFill);
        let mut buffer = guard.allocate(b"").expect("allocate");
        assert!(buffer.is_empty());
        guard.quarantine(&mut buffer);
        assert!(guard.is_intact(&buffer));
    }
}

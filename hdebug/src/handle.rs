use std::fmt;

use crate::{Generation, StackTrace, UHandle};

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Opaque handle handed to native code in debug mode.
///
/// Low half: arena index + 1, so that zero stays the null handle.
/// High half: serial of the arena slot at creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DHandle(u64);

impl DHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub(crate) fn new(index: u32, serial: u32) -> Self {
        Self(((serial as u64) << INDEX_BITS) | (index as u64 + 1))
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from a raw id received across the boundary.
    #[inline]
    pub fn from_id(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub(crate) fn index(self) -> Option<u32> {
        let low = self.0 & INDEX_MASK;
        if low == 0 {
            None
        } else {
            Some((low - 1) as u32)
        }
    }

    #[inline]
    pub(crate) fn serial(self) -> u32 {
        (self.0 >> INDEX_BITS) as u32
    }
}

impl fmt::Debug for DHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DHandle({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

/// Snapshot of one debug record, detached from the table.
///
/// This is what leak queries and error reports hand out; holding one does
/// not keep the record alive.
#[derive(Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: DHandle,
    pub object: UHandle,
    pub generation: Generation,
    pub state: HandleState,
    pub borrowed: bool,
    pub allocation: StackTrace,
    /// Host description of the referenced object, when it was available.
    pub description: Option<String>,
}

impl fmt::Display for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<DebugHandle {:#x} for ", self.handle.id())?;
        match &self.description {
            Some(description) => write!(f, "{description}")?,
            None => write!(f, "{:?}", self.object)?,
        }
        write!(f, ", generation {}", self.generation)?;
        if self.state == HandleState::Closed {
            write!(f, ", closed")?;
        }
        if !self.allocation.is_unknown() {
            write!(f, ", allocated at {}", self.allocation.allocation_site())?;
        }
        write!(f, ">")
    }
}

impl fmt::Debug for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_has_no_index() {
        assert!(DHandle::NULL.is_null());
        assert_eq!(DHandle::NULL.index(), None);
    }

    #[test]
    fn index_and_serial_survive_encoding() {
        let h = DHandle::new(41, 7);
        assert!(!h.is_null());
        assert_eq!(h.index(), Some(41));
        assert_eq!(h.serial(), 7);
        assert_eq!(DHandle::from_id(h.id()), h);
        assert_eq!(DHandle::new(0, 0).id(), 1);
    }

    #[test]
    fn repr_names_the_handle_and_its_object() {
        let info = HandleInfo {
            handle: DHandle::new(0, 0),
            object: UHandle::from_raw(9),
            generation: 3,
            state: HandleState::Open,
            borrowed: false,
            allocation: StackTrace::unknown(),
            description: Some("42".to_string()),
        };
        assert_eq!(
            info.to_string(),
            "<DebugHandle 0x1 for 42, generation 3>"
        );

        let closed = HandleInfo {
            state: HandleState::Closed,
            description: None,
            ..info
        };
        assert_eq!(
            format!("{closed:?}"),
            "<DebugHandle 0x1 for UHandle(9), generation 3, closed>"
        );
    }
}

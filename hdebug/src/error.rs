use std::fmt;

use crate::{ApiOp, DHandle, HandleInfo, HostError, LeakReport};

/// Why a handle was rejected as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Null,
    /// Never issued by this registry.
    Unknown,
    /// Closed a second time.
    DoubleClose,
    /// Argument handles belong to the caller of a native function.
    Borrowed,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null handle"),
            Self::Unknown => write!(f, "not a debug handle"),
            Self::DoubleClose => write!(f, "handle already closed"),
            Self::Borrowed => write!(f, "borrowed argument handle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Identifier space or record storage exhausted.
    Allocation { what: &'static str },
    InvalidHandle {
        handle: DHandle,
        reason: InvalidReason,
    },
    /// `closed` is the quarantined record, if it has not been reclaimed yet.
    UseAfterClose {
        handle: DHandle,
        closed: Option<Box<HandleInfo>>,
    },
    Leak(LeakReport),
    AlreadyStarted,
    NotStarted,
    Host(HostError),
    Signature { op: ApiOp, detail: String },
    MissingWrapper { op: ApiOp },
    DuplicateWrapper { op: ApiOp },
}

impl Error {
    /// Violations of handle discipline, as opposed to host failures.
    pub fn is_handle_violation(&self) -> bool {
        matches!(self, Self::InvalidHandle { .. } | Self::UseAfterClose { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { what } => {
                write!(f, "debug handle allocation failed: {what} exhausted")
            }
            Self::InvalidHandle { handle, reason } => {
                write!(f, "invalid handle {:#x}: {reason}", handle.id())
            }
            Self::UseAfterClose { handle, closed } => {
                write!(f, "use of closed handle {:#x}", handle.id())?;
                if let Some(info) = closed {
                    write!(f, " {info}")?;
                    if !info.allocation.is_unknown() {
                        write!(f, "\nallocated at:\n{}", info.allocation)?;
                    }
                }
                Ok(())
            }
            Self::Leak(report) => write!(f, "{report}"),
            Self::AlreadyStarted => write!(f, "LeakDetector already started"),
            Self::NotStarted => write!(f, "LeakDetector not started yet"),
            Self::Host(err) => write!(f, "{err}"),
            Self::Signature { op, detail } => {
                write!(f, "{}: {detail}", op.name())
            }
            Self::MissingWrapper { op } => {
                write!(f, "no debug wrapper for API operation {}", op.name())
            }
            Self::DuplicateWrapper { op } => {
                write!(f, "more than one debug wrapper for {}", op.name())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Host(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        Self::Host(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostErrorKind;

    #[test]
    fn protocol_errors_use_the_detector_wording() {
        assert_eq!(
            Error::AlreadyStarted.to_string(),
            "LeakDetector already started"
        );
        assert_eq!(
            Error::NotStarted.to_string(),
            "LeakDetector not started yet"
        );
    }

    #[test]
    fn invalid_handle_names_the_reason() {
        let err = Error::InvalidHandle {
            handle: DHandle::from_id(0x2a),
            reason: InvalidReason::DoubleClose,
        };
        assert_eq!(
            err.to_string(),
            "invalid handle 0x2a: handle already closed"
        );
        assert!(err.is_handle_violation());
    }

    #[test]
    fn host_errors_pass_through() {
        let err: Error =
            HostError::new(HostErrorKind::TypeError, "unsupported operand")
                .into();
        assert_eq!(err.to_string(), "TypeError: unsupported operand");
        assert!(!err.is_handle_violation());
        assert!(std::error::Error::source(&err).is_some());
    }
}

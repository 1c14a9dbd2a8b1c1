//! Debug-mode handle tracking for a handle-based extension API.
//!
//! [`DebugContext`] wraps a host [`Context`] and hands out debug handles that
//! remember where they were opened, stay quarantined after close, and show
//! up in [`LeakDetector`] reports when they are never closed.

mod api;
mod context;
mod dispatch;
mod error;
mod generation;
mod guard;
mod handle;
mod host;
mod leak;
mod queue;
mod registry;
mod settings;
mod stacktrace;
mod system;
mod table;

pub use api::*;
pub use context::*;
pub use dispatch::*;
pub use error::*;
pub use generation::*;
pub use guard::*;
pub use handle::*;
pub use host::*;
pub use leak::*;
pub use queue::*;
pub use registry::*;
pub use settings::*;
pub use stacktrace::*;
pub use system::{
    OS_PAGE_SIZE, map_memory, page_protection_available, page_round_up,
    protect_memory, unmap_memory,
};
pub use table::*;

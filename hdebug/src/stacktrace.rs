use std::{ffi::c_void, fmt, sync::Arc};

/// Frames belonging to the debug layer itself; never shown or counted.
const INTERNAL_FRAMES: &[&str] = &[
    "backtrace::",
    "hdebug::stacktrace::StackTrace",
    "hdebug::registry::Registry",
    "hdebug::dispatch::",
    "hdebug::context::DebugContext",
    "hdebug::api::Context",
    "hdebug::api::Ret",
    "hdebug::api::Arg",
];

/// Deepest stack walked while looking for user frames.
const MAX_DEPTH: usize = 256;

fn is_internal(name: &str) -> bool {
    // trait impls print as `<hdebug::context::DebugContext<H> as ..>`
    let bare = name.trim_start_matches('<');
    INTERNAL_FRAMES.iter().any(|p| bare.starts_with(p))
}

/// Outermost symbol of an instruction pointer. Inlined callees resolve
/// first, so the last name seen is the function the frame belongs to.
fn outermost_symbol(ip: usize) -> Option<String> {
    let mut name = None;
    backtrace::resolve(ip as *mut c_void, |symbol| {
        if let Some(n) = symbol.name() {
            name = Some(format!("{n:#}"));
        }
    });
    name
}

/// Call site snapshot taken when a handle is created.
///
/// Frames of the debug layer are skipped while capturing, so `limit` counts
/// user frames only. Symbols are resolved again when the trace is printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    ips: Arc<[usize]>,
    limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub name: String,
    pub location: Option<String>,
}

impl StackTrace {
    /// The trace of a record created with capture disabled.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Capture at most `limit` user frames. Never fails: a platform that
    /// cannot unwind yields an unknown trace.
    pub fn capture(limit: usize) -> Self {
        if limit == 0 {
            return Self::unknown();
        }
        let mut walked = Vec::new();
        backtrace::trace(|frame| {
            walked.push(frame.ip() as usize);
            walked.len() < MAX_DEPTH
        });
        let user = |&ip: &usize| match outermost_symbol(ip) {
            Some(name) => !is_internal(&name),
            None => true,
        };
        let ips: Vec<usize> =
            walked.into_iter().filter(user).take(limit).collect();
        Self {
            ips: ips.into(),
            limit,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.ips.is_empty()
    }

    /// Resolve symbols, dropping frames of the debug layer inlined into
    /// user code.
    pub fn frames(&self) -> Vec<ResolvedFrame> {
        let mut out = Vec::new();
        for &ip in self.ips.iter() {
            let mut resolved = false;
            backtrace::resolve(ip as *mut c_void, |symbol| {
                resolved = true;
                let name = symbol
                    .name()
                    .map(|n| format!("{n:#}"))
                    .unwrap_or_else(|| format!("{ip:#x}"));
                if is_internal(&name) {
                    return;
                }
                let location = match (symbol.filename(), symbol.lineno()) {
                    (Some(file), Some(line)) => {
                        Some(format!("{}:{line}", file.display()))
                    }
                    (Some(file), None) => Some(file.display().to_string()),
                    _ => None,
                };
                out.push(ResolvedFrame { name, location });
            });
            if !resolved {
                out.push(ResolvedFrame {
                    name: format!("{ip:#x}"),
                    location: None,
                });
            }
        }
        out.truncate(self.limit);
        out
    }

    /// One-line description of the innermost user frame.
    pub fn allocation_site(&self) -> String {
        match self.frames().into_iter().next() {
            Some(ResolvedFrame {
                name,
                location: Some(location),
            }) => format!("{name} ({location})"),
            Some(ResolvedFrame { name, .. }) => name,
            None => "<unknown>".to_string(),
        }
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackTrace({} frames)", self.ips.len())
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = self.frames();
        if frames.is_empty() {
            return write!(f, "  <unknown allocation site>");
        }
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match &frame.location {
                Some(location) => {
                    write!(f, "  #{i} {} at {location}", frame.name)?
                }
                None => write!(f, "  #{i} {}", frame.name)?,
            }
        }
        Ok(())
    }
}

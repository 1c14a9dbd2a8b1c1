use std::fmt;

use crate::{Error, Generation, HandleInfo, Registry};

/// Handles still open when a detector session stopped, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    leaks: Vec<HandleInfo>,
}

impl LeakReport {
    pub fn new(leaks: Vec<HandleInfo>) -> Self {
        Self { leaks }
    }

    pub fn leaks(&self) -> &[HandleInfo] {
        &self.leaks
    }

    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.leaks.len();
        let s = if n != 1 { "s" } else { "" };
        write!(f, "{n} unclosed handle{s}:")?;
        for leak in &self.leaks {
            write!(f, "\n    {leak}")?;
        }
        Ok(())
    }
}

/// Source of open-handle snapshots for a detector.
///
/// [`Registry`] answers from its table alone; a debug context also asks the
/// host to describe each leaked object.
pub trait LeakSource {
    fn new_generation(&self) -> Generation;
    fn get_open_handles(&self, since: Generation) -> Vec<HandleInfo>;
}

impl LeakSource for Registry {
    fn new_generation(&self) -> Generation {
        Registry::new_generation(self)
    }

    fn get_open_handles(&self, since: Generation) -> Vec<HandleInfo> {
        self.open_handles(since)
    }
}

/// Reports every handle opened between `start` and `stop` and not closed.
pub struct LeakDetector<'a> {
    source: &'a dyn LeakSource,
    generation: Option<Generation>,
}

impl<'a> LeakDetector<'a> {
    pub fn new(source: &'a dyn LeakSource) -> Self {
        Self {
            source,
            generation: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.generation.is_some()
    }

    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.generation.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.generation = Some(self.source.new_generation());
        Ok(())
    }

    /// End the session. The detector returns to idle whether or not leaks
    /// were found.
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some(generation) = self.generation.take() else {
            return Err(Error::NotStarted);
        };
        let leaks = self.source.get_open_handles(generation);
        if leaks.is_empty() {
            return Ok(());
        }
        let report = LeakReport::new(leaks);
        log::debug!("{report}");
        Err(Error::Leak(report))
    }

    /// Start a session that is stopped on every exit path.
    pub fn session(&mut self) -> Result<LeakSession<'_, 'a>, Error> {
        self.start()?;
        Ok(LeakSession {
            detector: self,
            finished: false,
        })
    }

    /// Run `body` inside a session.
    ///
    /// Leaks are reported when `body` succeeds. When `body` fails, its error
    /// is returned and any leaks are only logged, since handles are commonly
    /// left open by the failure itself.
    pub fn run<T>(
        &mut self,
        body: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let session = self.session()?;
        let result = body();
        let stopped = session.finish();
        match (result, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(leak)) => Err(leak),
            (Err(err), Err(leak)) => {
                log::warn!("{leak}\n(while handling: {err})");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }
}

/// Scope guard for a started detector.
///
/// Call [`LeakSession::finish`] to get the result. If the guard is dropped
/// instead, the session is still stopped. The early return or panic that
/// dropped it wins, and any leaks are only logged, as in
/// [`LeakDetector::run`].
pub struct LeakSession<'d, 'a> {
    detector: &'d mut LeakDetector<'a>,
    finished: bool,
}

impl LeakSession<'_, '_> {
    pub fn generation(&self) -> Option<Generation> {
        self.detector.generation()
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.finished = true;
        self.detector.stop()
    }
}

impl Drop for LeakSession<'_, '_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.detector.stop() {
            log::warn!("{err}\n(session dropped before finish)");
        }
    }
}

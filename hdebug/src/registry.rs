use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    Arg, DHandle, DebugCreateInfo, DebugSettings, Error, Generation,
    GenerationCounter, HandleInfo, HandleTable, ProtectionStrategy, RawData,
    StackTrace, UHandle,
};

pub type InvalidHandleHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Process-wide debug state: the handle table behind one mutex, plus the
/// generation counter.
///
/// The lock is held only for the bookkeeping step itself, never while
/// calling into the host or into native code.
pub struct Registry {
    generations: GenerationCounter,
    table: Mutex<HandleTable>,
    settings: DebugSettings,
    stack_trace_limit: AtomicUsize,
    on_invalid_handle: RwLock<Option<InvalidHandleHook>>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    pub fn new(info: &DebugCreateInfo) -> Self {
        let settings = DebugSettings::new(info);
        Self::with_table(settings, HandleTable::new(&settings))
    }

    pub fn with_table(settings: DebugSettings, table: HandleTable) -> Self {
        Self {
            generations: GenerationCounter::new(),
            table: Mutex::new(table),
            settings,
            stack_trace_limit: AtomicUsize::new(settings.stack_trace_limit),
            on_invalid_handle: RwLock::new(None),
        }
    }

    /// The shared registry, created with default settings on first use.
    pub fn global() -> Arc<Registry> {
        let init = || Arc::new(Registry::new(&DebugCreateInfo::default()));
        GLOBAL.get_or_init(init).clone()
    }

    pub fn protection(&self) -> ProtectionStrategy {
        self.settings.protection
    }

    pub fn new_generation(&self) -> Generation {
        let generation = self.generations.new_generation();
        log::debug!("new generation {generation}");
        generation
    }

    pub fn current_generation(&self) -> Generation {
        self.generations.current()
    }

    pub fn stack_trace_limit(&self) -> usize {
        self.stack_trace_limit.load(Ordering::Relaxed)
    }

    /// Frames captured per new handle; 0 disables capture.
    pub fn set_stack_trace_limit(&self, limit: usize) {
        self.stack_trace_limit.store(limit, Ordering::Relaxed);
    }

    pub fn quarantine_size(&self) -> usize {
        self.table.lock().quarantine_size()
    }

    pub fn set_quarantine_size(&self, size: usize) {
        let violations = {
            let mut table = self.table.lock();
            table.set_quarantine_size(size);
            table.take_violations()
        };
        self.report_all(violations);
    }

    pub fn set_on_invalid_handle(&self, hook: Option<InvalidHandleHook>) {
        *self.on_invalid_handle.write() = hook;
    }

    fn report(&self, err: &Error) {
        log::warn!("{err}");
        let hook = self.on_invalid_handle.read().clone();
        if let Some(hook) = hook {
            hook(err);
        }
    }

    fn report_all(&self, violations: Vec<Error>) {
        for err in &violations {
            self.report(err);
        }
    }

    /// Pass a handle violation to the hook on its way to the caller.
    fn checked<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if err.is_handle_violation() {
                self.report(err);
            }
        }
        result
    }

    fn register_with(
        &self,
        object: UHandle,
        borrowed: bool,
    ) -> Result<DHandle, Error> {
        // capture before locking, it is by far the slowest step
        let allocation = StackTrace::capture(self.stack_trace_limit());
        let generation = self.generations.current();
        let handle = self
            .table
            .lock()
            .register(object, generation, allocation, borrowed)?;
        log::trace!("open {handle:?} -> {object:?} (generation {generation})");
        Ok(handle)
    }

    /// Wrap a plain handle the caller owns into a fresh debug handle.
    pub fn register(&self, object: UHandle) -> Result<DHandle, Error> {
        self.register_with(object, false)
    }

    /// Wrap a plain handle lent to native code for the duration of a call.
    pub fn register_borrowed(&self, object: UHandle) -> Result<DHandle, Error> {
        self.register_with(object, true)
    }

    fn release_with(
        &self,
        handle: DHandle,
        lender: bool,
    ) -> Result<UHandle, Error> {
        let (result, violations) = {
            let mut table = self.table.lock();
            let result = table.release(handle, lender);
            (result, table.take_violations())
        };
        self.report_all(violations);
        if let Ok(object) = &result {
            log::trace!("close {handle:?} -> {object:?}");
        }
        self.checked(result)
    }

    /// Close a debug handle and return the plain handle it wrapped.
    pub fn release(&self, handle: DHandle) -> Result<UHandle, Error> {
        self.release_with(handle, false)
    }

    /// Close a borrowed handle on behalf of the code that lent it.
    pub fn release_borrowed(&self, handle: DHandle) -> Result<UHandle, Error> {
        self.release_with(handle, true)
    }

    pub fn resolve(&self, handle: DHandle) -> Result<UHandle, Error> {
        let result = self.table.lock().resolve(handle);
        self.checked(result)
    }

    /// Translate the debug handles of an argument list to plain handles,
    /// all checked under one lock.
    pub fn resolve_args(
        &self,
        args: &[Arg<DHandle>],
    ) -> Result<Vec<Arg<UHandle>>, Error> {
        let result = {
            let table = self.table.lock();
            args.iter()
                .map(|arg| arg.try_map(|h| table.resolve(h)))
                .collect()
        };
        self.checked(result)
    }

    pub fn attach_raw_data(
        &self,
        handle: DHandle,
        bytes: &[u8],
    ) -> Result<RawData, Error> {
        let result = self.table.lock().attach_raw_data(handle, bytes);
        self.checked(result)
    }

    pub fn info(&self, handle: DHandle) -> Option<HandleInfo> {
        self.table.lock().info(handle)
    }

    /// Open handles with `generation >= since`, in creation order.
    pub fn open_handles(&self, since: Generation) -> Vec<HandleInfo> {
        self.table.lock().open_handles(since)
    }

    pub fn closed_handles(&self) -> Vec<HandleInfo> {
        self.table.lock().closed_handles()
    }

    pub fn open_count(&self) -> usize {
        self.table.lock().open_count()
    }

    /// Check that no quarantined storage was written after close.
    pub fn verify_quarantine(&self) -> Result<(), Error> {
        let result = self.table.lock().verify_quarantine();
        self.checked(result)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&DebugCreateInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InvalidReason;
    use std::{sync::atomic::AtomicUsize, thread};

    fn registry() -> Registry {
        Registry::new(&DebugCreateInfo {
            stack_trace_limit: Some(0),
            ..Default::default()
        })
    }

    #[test]
    fn records_carry_the_current_generation() {
        let r = registry();
        let before = r.register(UHandle::from_raw(1)).expect("register");
        let g = r.new_generation();
        let after = r.register(UHandle::from_raw(2)).expect("register");

        let open = r.open_handles(g);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].handle, after);
        assert_eq!(open[0].generation, g);
        assert_eq!(r.open_handles(0).len(), 2);
        assert_eq!(r.info(before).map(|i| i.generation), Some(0));
    }

    #[test]
    fn violations_reach_the_hook() {
        let r = registry();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        r.set_on_invalid_handle(Some(Arc::new(move |err: &Error| {
            assert!(err.is_handle_violation());
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let h = r.register(UHandle::from_raw(1)).expect("register");
        r.release(h).expect("release");
        assert!(matches!(
            r.release(h),
            Err(Error::InvalidHandle {
                reason: InvalidReason::DoubleClose,
                ..
            })
        ));
        assert!(matches!(r.resolve(h), Err(Error::UseAfterClose { .. })));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn allocation_sites_are_captured_when_enabled() {
        let r = registry();
        let quiet = r.register(UHandle::from_raw(1)).expect("register");
        r.set_stack_trace_limit(1);
        let traced = r.register(UHandle::from_raw(2)).expect("register");

        assert!(r.info(quiet).expect("info").allocation.is_unknown());
        let site = r.info(traced).expect("info").allocation.allocation_site();
        assert!(
            site.contains("allocation_sites_are_captured_when_enabled"),
            "{site}"
        );
    }

    #[test]
    fn concurrent_register_and_release_keep_the_table_consistent() {
        let r = Arc::new(registry());
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let r = r.clone();
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200u64 {
                        let h = r
                            .register(UHandle::from_raw(t * 1000 + i))
                            .expect("register");
                        if i % 2 == 0 {
                            assert_eq!(
                                r.release(h),
                                Ok(UHandle::from_raw(t * 1000 + i))
                            );
                        } else {
                            kept.push(h);
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut kept = Vec::new();
        for worker in workers {
            kept.extend(worker.join().expect("worker panicked"));
        }
        assert_eq!(r.open_count(), kept.len());
        let open: Vec<_> = r.open_handles(0).iter().map(|i| i.handle).collect();
        for h in &kept {
            assert!(open.contains(h), "{h:?} missing from open handles");
        }
    }

    #[test]
    fn global_registry_is_shared() {
        let a = Registry::global();
        let b = Registry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

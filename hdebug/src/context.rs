use std::sync::Arc;

use crate::{
    ApiOp, Arg, Context, DHandle, DebugCreateInfo, DispatchTable, Error,
    Generation, HandleInfo, HostContext, HostError, HostErrorKind, LeakDetector,
    LeakSource, Registry, Ret, UHandle, debug_wrappers,
};

/// A [`Context`] over debug handles, layered on a host context.
///
/// Every call goes through the dispatch table, which translates debug handles
/// to plain ones on the way in and wraps returned plain handles on the way
/// out.
pub struct DebugContext<H> {
    host: H,
    registry: Arc<Registry>,
    dispatch: DispatchTable<H>,
}

impl<H: HostContext> DebugContext<H> {
    /// Fails when the dispatch table does not cover the whole API.
    pub fn new(host: H, registry: Arc<Registry>) -> Result<Self, Error> {
        let dispatch: DispatchTable<H> =
            DispatchTable::build(&debug_wrappers())?;
        log::debug!(
            "debug context ready: {} wrappers, {} protection",
            dispatch.len(),
            registry.protection()
        );
        Ok(Self {
            host,
            registry,
            dispatch,
        })
    }

    pub fn with_settings(
        host: H,
        info: &DebugCreateInfo,
    ) -> Result<Self, Error> {
        Self::new(host, Arc::new(Registry::new(info)))
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn new_generation(&self) -> Generation {
        self.registry.new_generation()
    }

    /// Open handles since `since`, described by the host.
    pub fn get_open_handles(&self, since: Generation) -> Vec<HandleInfo> {
        let mut infos = self.registry.open_handles(since);
        self.describe_all(&mut infos);
        infos
    }

    /// Quarantined handles, oldest first.
    pub fn get_closed_handles(&self) -> Vec<HandleInfo> {
        let mut infos = self.registry.closed_handles();
        self.describe_all(&mut infos);
        infos
    }

    // the registry lock is already released here; the host may call back
    fn describe_all(&self, infos: &mut [HandleInfo]) {
        for info in infos {
            info.description = self.host.describe(info.object);
        }
    }

    pub fn leak_detector(&self) -> LeakDetector<'_> {
        LeakDetector::new(self)
    }

    /// Take ownership of a plain handle. The plain handle is closed if no
    /// debug handle can be created for it.
    pub fn wrap(&self, object: UHandle) -> Result<DHandle, Error> {
        match self.registry.register(object) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Err(close_err) = self.host.close(object) {
                    log::error!(
                        "closing {object:?} after failed wrap: {close_err}"
                    );
                }
                Err(err)
            }
        }
    }

    /// Run a native method written against [`Context`] with debug handles.
    ///
    /// `this` and `args` are lent to the method as borrowed debug handles and
    /// closed again afterwards. The returned debug handle is closed while its
    /// plain handle passes to the caller. Returning one of the borrowed
    /// handles is an ownership violation.
    pub fn call_real_function(
        &self,
        method: NativeMethod<Self>,
        this: UHandle,
        args: &[UHandle],
    ) -> Result<UHandle, Error> {
        let mut lent = Vec::with_capacity(args.len() + 1);
        for &object in std::iter::once(&this).chain(args) {
            match self.registry.register_borrowed(object) {
                Ok(handle) => lent.push(handle),
                Err(err) => {
                    let _ = self.release_lent(&lent);
                    return Err(err);
                }
            }
        }

        let result = method
            .invoke(self, lent[0], &lent[1..])
            .and_then(|handle| self.registry.release(handle));
        let released = self.release_lent(&lent);

        match (result, released) {
            (Ok(object), Ok(())) => Ok(object),
            (Ok(object), Err(err)) => {
                if let Err(close_err) = self.host.close(object) {
                    log::error!("closing result {object:?}: {close_err}");
                }
                Err(err)
            }
            (Err(err), _) => Err(err),
        }
    }

    fn release_lent(&self, lent: &[DHandle]) -> Result<(), Error> {
        let mut first = Ok(());
        for &handle in lent {
            if let Err(err) = self.registry.release_borrowed(handle) {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }
}

impl<H: HostContext> Context for DebugContext<H> {
    type Handle = DHandle;

    fn call(
        &self,
        op: ApiOp,
        args: &[Arg<DHandle>],
    ) -> Result<Ret<DHandle>, Error> {
        self.dispatch.call(self, op, args)
    }
}

impl<H: HostContext> LeakSource for DebugContext<H> {
    fn new_generation(&self) -> Generation {
        DebugContext::new_generation(self)
    }

    fn get_open_handles(&self, since: Generation) -> Vec<HandleInfo> {
        DebugContext::get_open_handles(self, since)
    }
}

/// A native method, by calling convention.
pub enum NativeMethod<C: Context> {
    NoArgs(fn(&C, C::Handle) -> Result<C::Handle, Error>),
    O(fn(&C, C::Handle, C::Handle) -> Result<C::Handle, Error>),
    VarArgs(fn(&C, C::Handle, &[C::Handle]) -> Result<C::Handle, Error>),
}

impl<C: Context> Clone for NativeMethod<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Context> Copy for NativeMethod<C> {}

impl<C: Context> NativeMethod<C> {
    pub fn invoke(
        self,
        ctx: &C,
        this: C::Handle,
        args: &[C::Handle],
    ) -> Result<C::Handle, Error> {
        match (self, args) {
            (Self::NoArgs(f), []) => f(ctx, this),
            (Self::O(f), [arg]) => f(ctx, this, *arg),
            (Self::VarArgs(f), args) => f(ctx, this, args),
            (Self::NoArgs(_), _) => Err(arity_error(format!(
                "method takes no arguments ({} given)",
                args.len()
            ))),
            (Self::O(_), _) => Err(arity_error(format!(
                "method takes exactly one argument ({} given)",
                args.len()
            ))),
        }
    }
}

fn arity_error(message: String) -> Error {
    Error::Host(HostError::new(HostErrorKind::TypeError, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        HandleState, InvalidReason, ProtectionStrategy, SimpleHost,
        page_protection_available,
    };

    type DebugCtx = DebugContext<SimpleHost>;

    fn context() -> DebugCtx {
        context_with(ProtectionStrategy::CanaryFill)
    }

    fn context_with(protection: ProtectionStrategy) -> DebugCtx {
        configured(protection, 0)
    }

    fn configured(
        protection: ProtectionStrategy,
        stack_trace_limit: usize,
    ) -> DebugCtx {
        DebugContext::with_settings(
            SimpleHost::new(),
            &DebugCreateInfo {
                protection: Some(protection),
                quarantine_size: Some(8),
                stack_trace_limit: Some(stack_trace_limit),
            },
        )
        .expect("context")
    }

    // written once, runs on plain and debug handles alike
    fn sum_and_scale<C: Context>(
        ctx: &C,
        this: C::Handle,
        args: &[C::Handle],
    ) -> Result<C::Handle, Error> {
        let mut total = ctx.long_from_i64(0)?;
        for &arg in args {
            let next = ctx.add(total, arg)?;
            ctx.close(total)?;
            total = next;
        }
        let scaled = ctx.multiply(total, this);
        ctx.close(total)?;
        scaled
    }

    fn identity<C: Context>(
        _ctx: &C,
        _this: C::Handle,
        arg: C::Handle,
    ) -> Result<C::Handle, Error> {
        Ok(arg)
    }

    fn close_this<C: Context>(
        ctx: &C,
        this: C::Handle,
    ) -> Result<C::Handle, Error> {
        ctx.close(this)?;
        ctx.long_from_i64(0)
    }

    fn leaky<C: Context>(
        ctx: &C,
        _this: C::Handle,
    ) -> Result<C::Handle, Error> {
        let _forgotten = ctx.unicode_from_str("forgotten")?;
        ctx.long_from_i64(1)
    }

    #[test]
    fn native_code_runs_in_both_modes() {
        let plain = SimpleHost::new();
        let two = plain.long_from_i64(2).expect("long");
        let args = [
            plain.long_from_i64(3).expect("long"),
            plain.long_from_i64(4).expect("long"),
        ];
        let r = NativeMethod::VarArgs(sum_and_scale::<SimpleHost>)
            .invoke(&plain, two, &args)
            .expect("plain call");
        assert_eq!(plain.long_as_i64(r), Ok(14));

        let ctx = context();
        let host = ctx.host();
        let two = host.long_from_i64(2).expect("long");
        let args = [
            host.long_from_i64(3).expect("long"),
            host.long_from_i64(4).expect("long"),
        ];
        let r = ctx
            .call_real_function(
                NativeMethod::VarArgs(sum_and_scale::<DebugCtx>),
                two,
                &args,
            )
            .expect("debug call");
        assert_eq!(host.long_as_i64(r), Ok(14));
        assert_eq!(ctx.registry().open_count(), 0);
    }

    #[test]
    fn use_after_close_is_caught() {
        let ctx = context();
        let h = ctx.long_from_i64(7).expect("long");
        ctx.close(h).expect("close");
        match ctx.long_as_i64(h) {
            Err(Error::UseAfterClose {
                handle,
                closed: Some(info),
            }) => {
                assert_eq!(handle, h);
                assert_eq!(info.state, HandleState::Closed);
            }
            other => panic!("expected use-after-close, got {other:?}"),
        }
    }

    #[test]
    fn double_close_is_caught_and_host_is_untouched() {
        let ctx = context();
        let h = ctx.long_from_i64(7).expect("long");
        ctx.close(h).expect("close");
        assert_eq!(ctx.host().live_handles(), 0);
        assert!(matches!(
            ctx.close(h),
            Err(Error::InvalidHandle {
                reason: InvalidReason::DoubleClose,
                ..
            })
        ));
    }

    #[test]
    fn dup_yields_an_independent_handle() {
        let ctx = context();
        let a = ctx.unicode_from_str("abc").expect("str");
        let b = ctx.dup(a).expect("dup");
        assert_ne!(a, b);
        ctx.close(a).expect("close");
        assert_eq!(ctx.length(b), Ok(3));
        ctx.close(b).expect("close");
    }

    #[test]
    fn handle_arrays_are_translated() {
        let ctx = context();
        let one = ctx.long_from_i64(1).expect("long");
        let two = ctx.float_from_f64(2.0).expect("float");
        let tuple = ctx.tuple_from_array(&[one, two]).expect("tuple");
        assert_eq!(ctx.length(tuple), Ok(2));
        let repr = ctx.repr(tuple).expect("repr");
        let data = ctx.unicode_as_utf8(repr).expect("utf8");
        assert_eq!(unsafe { data.as_bytes() }, b"(1, 2.0)");
    }

    #[test]
    fn leaks_are_described_by_the_host() {
        let ctx = context();
        let mut detector = ctx.leak_detector();
        detector.start().expect("start");
        let closed = ctx.long_from_i64(1).expect("long");
        let _kept = ctx.unicode_from_str("still here").expect("str");
        ctx.close(closed).expect("close");

        match detector.stop() {
            Err(Error::Leak(report)) => {
                let text = report.to_string();
                let head = "1 unclosed handle:\n    <DebugHandle 0x";
                assert!(text.starts_with(head), "{text}");
                let body = "for 'still here', generation";
                assert!(text.contains(body), "{text}");
            }
            other => panic!("expected a leak, got {other:?}"),
        }
    }

    #[test]
    fn one_frame_is_enough_to_name_the_allocation_site() {
        let ctx = configured(ProtectionStrategy::CanaryFill, 1);
        let h = ctx.long_from_i64(7).expect("long");
        ctx.close(h).expect("close");
        let Err(Error::UseAfterClose {
            closed: Some(info), ..
        }) = ctx.long_as_i64(h)
        else {
            panic!("expected use-after-close");
        };
        let site = info.allocation.allocation_site();
        assert!(
            site.contains("one_frame_is_enough_to_name_the_allocation_site"),
            "{site}"
        );
    }

    #[test]
    fn bools_cross_the_debug_layer() {
        let ctx = context();
        let yes = ctx.bool_from_bool(true).expect("bool");
        assert_eq!(ctx.is_true(yes), Ok(true));
        assert_eq!(ctx.type_name(yes).as_deref(), Ok("bool"));
        ctx.close(yes).expect("close");
        assert_eq!(ctx.get_open_handles(0), vec![]);
    }

    #[test]
    fn closed_handles_are_listed_oldest_first() {
        let ctx = context();
        let a = ctx.long_from_i64(1).expect("long");
        let b = ctx.long_from_i64(2).expect("long");
        ctx.close(a).expect("close");
        ctx.close(b).expect("close");
        let closed: Vec<_> =
            ctx.get_closed_handles().iter().map(|i| i.handle).collect();
        assert_eq!(closed, vec![a, b]);
    }

    #[test]
    fn returned_handle_passes_to_the_caller() {
        let ctx = context();
        let this = ctx.host().long_from_i64(5).expect("long");
        let r = ctx
            .call_real_function(
                NativeMethod::NoArgs(leaky::<DebugCtx>),
                this,
                &[],
            )
            .expect("call");
        assert_eq!(ctx.host().long_as_i64(r), Ok(1));
        // the string the method forgot is still open, nothing else is
        let open = ctx.get_open_handles(0);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].description.as_deref(), Some("'forgotten'"));
    }

    #[test]
    fn closing_a_borrowed_handle_is_rejected() {
        let ctx = context();
        let this = ctx.host().long_from_i64(5).expect("long");
        let method = NativeMethod::NoArgs(close_this::<DebugCtx>);
        let result = ctx.call_real_function(method, this, &[]);
        assert!(matches!(
            result,
            Err(Error::InvalidHandle {
                reason: InvalidReason::Borrowed,
                ..
            })
        ));
        // the lender still owns `this`
        assert_eq!(ctx.host().long_as_i64(this), Ok(5));
        assert_eq!(ctx.registry().open_count(), 0);
    }

    #[test]
    fn returning_a_borrowed_handle_is_rejected() {
        let ctx = context();
        let host = ctx.host();
        let this = host.long_from_i64(1).expect("long");
        let arg = host.long_from_i64(2).expect("long");
        let method = NativeMethod::O(identity::<DebugCtx>);
        let result = ctx.call_real_function(method, this, &[arg]);
        assert!(matches!(
            result,
            Err(Error::InvalidHandle {
                reason: InvalidReason::Borrowed,
                ..
            })
        ));
        assert_eq!(ctx.registry().open_count(), 0);
    }

    #[test]
    fn arity_is_checked_per_convention() {
        let ctx = context();
        let this = ctx.host().long_from_i64(1).expect("long");
        let method = NativeMethod::O(identity::<DebugCtx>);
        let result = ctx.call_real_function(method, this, &[]);
        assert!(matches!(
            result,
            Err(Error::Host(HostError {
                kind: HostErrorKind::TypeError,
                ..
            }))
        ));
        assert_eq!(ctx.registry().open_count(), 0);
    }

    #[test]
    fn raw_data_is_poisoned_after_close() {
        let ctx = context();
        let s = ctx.unicode_from_str("secret").expect("str");
        let data = ctx.unicode_as_utf8(s).expect("utf8");
        assert_eq!(unsafe { data.as_bytes() }, b"secret");
        ctx.close(s).expect("close");
        // canary-filled storage stays mapped while quarantined
        let poisoned = unsafe { data.as_bytes() };
        assert!(poisoned.iter().all(|&b| b == crate::CANARY_BYTE));
        assert_eq!(ctx.registry().verify_quarantine(), Ok(()));
    }

    #[test]
    fn page_protection_is_selected_when_available() {
        let ctx = context_with(ProtectionStrategy::PageProtect);
        let expected = if page_protection_available() {
            ProtectionStrategy::PageProtect
        } else {
            ProtectionStrategy::CanaryFill
        };
        assert_eq!(ctx.registry().protection(), expected);

        let s = ctx.unicode_from_str("guarded").expect("str");
        let data = ctx.unicode_as_utf8(s).expect("utf8");
        assert_eq!(unsafe { data.as_bytes() }, b"guarded");
        ctx.close(s).expect("close");
    }

    #[test]
    fn host_errors_pass_through_unchanged() {
        let ctx = context();
        let s = ctx.unicode_from_str("x").expect("str");
        assert!(matches!(
            ctx.long_as_i64(s),
            Err(Error::Host(HostError {
                kind: HostErrorKind::TypeError,
                ..
            }))
        ));
        ctx.close(s).expect("close");
        assert_eq!(ctx.get_open_handles(0), vec![]);
    }
}

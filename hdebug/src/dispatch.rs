use crate::{
    API, ApiOp, Arg, DHandle, DebugContext, Error, HostContext, Ret, check_args,
    check_ret,
};

pub type WrapperFn<H> = fn(
    &DebugContext<H>,
    ApiOp,
    &[Arg<DHandle>],
) -> Result<Ret<DHandle>, Error>;

pub struct WrapperDesc<H> {
    pub op: ApiOp,
    pub func: WrapperFn<H>,
}

impl<H> WrapperDesc<H> {
    pub const fn new(op: ApiOp, func: WrapperFn<H>) -> Self {
        Self { op, func }
    }
}

impl<H> Clone for WrapperDesc<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for WrapperDesc<H> {}

/// Debug wrappers for the whole API.
pub fn debug_wrappers<H: HostContext>() -> Vec<WrapperDesc<H>> {
    vec![
        WrapperDesc::new(ApiOp::Dup, forward::<H>),
        WrapperDesc::new(ApiOp::Close, close::<H>),
        WrapperDesc::new(ApiOp::LongFromI64, forward::<H>),
        WrapperDesc::new(ApiOp::LongAsI64, forward::<H>),
        WrapperDesc::new(ApiOp::FloatFromF64, forward::<H>),
        WrapperDesc::new(ApiOp::FloatAsF64, forward::<H>),
        WrapperDesc::new(ApiOp::BoolFromBool, forward::<H>),
        WrapperDesc::new(ApiOp::UnicodeFromStr, forward::<H>),
        WrapperDesc::new(ApiOp::UnicodeAsUtf8, unicode_as_utf8::<H>),
        WrapperDesc::new(ApiOp::Add, forward::<H>),
        WrapperDesc::new(ApiOp::Subtract, forward::<H>),
        WrapperDesc::new(ApiOp::Multiply, forward::<H>),
        WrapperDesc::new(ApiOp::Repr, forward::<H>),
        WrapperDesc::new(ApiOp::Str, forward::<H>),
        WrapperDesc::new(ApiOp::Length, forward::<H>),
        WrapperDesc::new(ApiOp::IsTrue, forward::<H>),
        WrapperDesc::new(ApiOp::GetItem, forward::<H>),
        WrapperDesc::new(ApiOp::SetItem, forward::<H>),
        WrapperDesc::new(ApiOp::GetAttr, forward::<H>),
        WrapperDesc::new(ApiOp::SetAttr, forward::<H>),
        WrapperDesc::new(ApiOp::ListNew, forward::<H>),
        WrapperDesc::new(ApiOp::ListAppend, forward::<H>),
        WrapperDesc::new(ApiOp::TupleFromArray, forward::<H>),
        WrapperDesc::new(ApiOp::NamespaceNew, forward::<H>),
        WrapperDesc::new(ApiOp::TypeName, forward::<H>),
    ]
}

/// One wrapper per API operation, indexed by `ApiOp as usize`.
pub struct DispatchTable<H> {
    wrappers: Vec<WrapperFn<H>>,
}

impl<H> DispatchTable<H> {
    /// Fails unless every declared operation has exactly one wrapper.
    pub fn build(entries: &[WrapperDesc<H>]) -> Result<Self, Error> {
        let mut slots: Vec<Option<WrapperFn<H>>> = vec![None; ApiOp::COUNT];
        for desc in entries {
            let slot = &mut slots[desc.op.index()];
            if slot.is_some() {
                return Err(Error::DuplicateWrapper { op: desc.op });
            }
            *slot = Some(desc.func);
        }
        let wrappers = API
            .iter()
            .zip(slots)
            .map(|(sig, slot)| slot.ok_or(Error::MissingWrapper { op: sig.op }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { wrappers })
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub fn get(&self, op: ApiOp) -> WrapperFn<H> {
        self.wrappers[op.index()]
    }
}

impl<H: HostContext> DispatchTable<H> {
    #[inline]
    pub fn call(
        &self,
        ctx: &DebugContext<H>,
        op: ApiOp,
        args: &[Arg<DHandle>],
    ) -> Result<Ret<DHandle>, Error> {
        (self.get(op))(ctx, op, args)
    }
}

/// Translate the handles, call the host, wrap a returned handle.
fn forward<H: HostContext>(
    ctx: &DebugContext<H>,
    op: ApiOp,
    args: &[Arg<DHandle>],
) -> Result<Ret<DHandle>, Error> {
    check_args(op, args)?;
    let plain = ctx.registry().resolve_args(args)?;
    let ret = ctx.host().call(op, &plain)?;
    check_ret(op, &ret)?;
    ret.try_map(|object| ctx.wrap(object))
}

fn handle_arg(op: ApiOp, args: &[Arg<DHandle>]) -> Result<DHandle, Error> {
    check_args(op, args)?;
    match args {
        [Arg::Handle(h)] => Ok(*h),
        _ => Err(Error::Signature {
            op,
            detail: "expected a single handle".to_string(),
        }),
    }
}

fn close<H: HostContext>(
    ctx: &DebugContext<H>,
    op: ApiOp,
    args: &[Arg<DHandle>],
) -> Result<Ret<DHandle>, Error> {
    let handle = handle_arg(op, args)?;
    let object = ctx.registry().release(handle)?;
    ctx.host().close(object)?;
    Ok(Ret::Unit)
}

/// Hands out a copy of the host's bytes owned by the debug handle, so the
/// storage can be poisoned or protected once the handle closes.
fn unicode_as_utf8<H: HostContext>(
    ctx: &DebugContext<H>,
    op: ApiOp,
    args: &[Arg<DHandle>],
) -> Result<Ret<DHandle>, Error> {
    let handle = handle_arg(op, args)?;
    let object = ctx.registry().resolve(handle)?;
    let ret = ctx.host().call(op, &[Arg::Handle(object)])?;
    check_ret(op, &ret)?;
    let Ret::RawData(data) = ret else {
        return Err(Error::Signature {
            op,
            detail: "expected raw data".to_string(),
        });
    };
    // SAFETY: `object` is open in the host for the duration of this call
    let bytes = unsafe { data.as_bytes() };
    let copy = ctx.registry().attach_raw_data(handle, bytes)?;
    Ok(Ret::RawData(copy))
}

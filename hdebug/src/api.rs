//! The declared API surface shared by the plain host and the debug layer.
//!
//! Every operation is described by an [`OpSignature`] in [`API`]. Native code
//! is written against [`Context`], so the same function runs unchanged on
//! plain handles and on debug handles.

use std::fmt;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ApiOp {
    Dup,
    Close,
    LongFromI64,
    LongAsI64,
    FloatFromF64,
    FloatAsF64,
    BoolFromBool,
    UnicodeFromStr,
    UnicodeAsUtf8,
    Add,
    Subtract,
    Multiply,
    Repr,
    Str,
    Length,
    IsTrue,
    GetItem,
    SetItem,
    GetAttr,
    SetAttr,
    ListNew,
    ListAppend,
    TupleFromArray,
    NamespaceNew,
    TypeName,
}

impl ApiOp {
    pub const COUNT: usize = API.len();

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn signature(self) -> &'static OpSignature {
        &API[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.signature().name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Handle,
    HandleArray,
    Long,
    Float,
    Bool,
    Str,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Handle,
    Long,
    Float,
    Bool,
    Size,
    Str,
    RawData,
    Unit,
}

#[derive(Debug)]
pub struct OpSignature {
    pub op: ApiOp,
    pub name: &'static str,
    pub params: &'static [ParamKind],
    pub ret: RetKind,
}

macro_rules! signatures {
    ($($op:ident $name:literal ($($param:ident),*) -> $ret:ident;)*) => {
        /// Declared signatures, indexed by `ApiOp as usize`.
        pub const API: &[OpSignature] = &[
            $(OpSignature {
                op: ApiOp::$op,
                name: $name,
                params: &[$(ParamKind::$param),*],
                ret: RetKind::$ret,
            },)*
        ];
    };
}

signatures! {
    Dup "Dup" (Handle) -> Handle;
    Close "Close" (Handle) -> Unit;
    LongFromI64 "Long_FromI64" (Long) -> Handle;
    LongAsI64 "Long_AsI64" (Handle) -> Long;
    FloatFromF64 "Float_FromF64" (Float) -> Handle;
    FloatAsF64 "Float_AsF64" (Handle) -> Float;
    BoolFromBool "Bool_FromBool" (Bool) -> Handle;
    UnicodeFromStr "Unicode_FromStr" (Str) -> Handle;
    UnicodeAsUtf8 "Unicode_AsUTF8" (Handle) -> RawData;
    Add "Add" (Handle, Handle) -> Handle;
    Subtract "Subtract" (Handle, Handle) -> Handle;
    Multiply "Multiply" (Handle, Handle) -> Handle;
    Repr "Repr" (Handle) -> Handle;
    Str "Str" (Handle) -> Handle;
    Length "Length" (Handle) -> Size;
    IsTrue "IsTrue" (Handle) -> Bool;
    GetItem "GetItem" (Handle, Handle) -> Handle;
    SetItem "SetItem" (Handle, Handle, Handle) -> Unit;
    GetAttr "GetAttr_s" (Handle, Str) -> Handle;
    SetAttr "SetAttr_s" (Handle, Str, Handle) -> Unit;
    ListNew "List_New" (Size) -> Handle;
    ListAppend "List_Append" (Handle, Handle) -> Unit;
    TupleFromArray "Tuple_FromArray" (HandleArray) -> Handle;
    NamespaceNew "Namespace_New" () -> Handle;
    TypeName "TypeName" (Handle) -> Str;
}

/// Pointer into storage owned by a handle; valid while the handle is open.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawData {
    ptr: *const u8,
    len: usize,
}

impl RawData {
    pub fn new(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The handle the data came from must still be open, or quarantined
    /// under the canary-fill strategy.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: guaranteed by the caller
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl fmt::Debug for RawData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawData({:p}, {})", self.ptr, self.len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg<H> {
    Handle(H),
    Handles(Vec<H>),
    Long(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Size(usize),
}

impl<H: Copy> Arg<H> {
    /// Translate every handle in the argument, keeping other values.
    pub fn try_map<U, E>(
        &self,
        mut f: impl FnMut(H) -> Result<U, E>,
    ) -> Result<Arg<U>, E> {
        Ok(match self {
            Self::Handle(h) => Arg::Handle(f(*h)?),
            Self::Handles(hs) => Arg::Handles(
                hs.iter().map(|&h| f(h)).collect::<Result<_, _>>()?,
            ),
            Self::Long(n) => Arg::Long(*n),
            Self::Float(x) => Arg::Float(*x),
            Self::Bool(b) => Arg::Bool(*b),
            Self::Str(s) => Arg::Str(s.clone()),
            Self::Size(n) => Arg::Size(*n),
        })
    }
}

impl<H> Arg<H> {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Handle(_) => ParamKind::Handle,
            Self::Handles(_) => ParamKind::HandleArray,
            Self::Long(_) => ParamKind::Long,
            Self::Float(_) => ParamKind::Float,
            Self::Bool(_) => ParamKind::Bool,
            Self::Str(_) => ParamKind::Str,
            Self::Size(_) => ParamKind::Size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ret<H> {
    Handle(H),
    Long(i64),
    Float(f64),
    Bool(bool),
    Size(usize),
    Str(String),
    RawData(RawData),
    Unit,
}

impl<H> Ret<H> {
    pub fn try_map<U, E>(
        self,
        f: impl FnOnce(H) -> Result<U, E>,
    ) -> Result<Ret<U>, E> {
        Ok(match self {
            Self::Handle(h) => Ret::Handle(f(h)?),
            Self::Long(n) => Ret::Long(n),
            Self::Float(x) => Ret::Float(x),
            Self::Bool(b) => Ret::Bool(b),
            Self::Size(n) => Ret::Size(n),
            Self::Str(s) => Ret::Str(s),
            Self::RawData(data) => Ret::RawData(data),
            Self::Unit => Ret::Unit,
        })
    }

    pub fn kind(&self) -> RetKind {
        match self {
            Self::Handle(_) => RetKind::Handle,
            Self::Long(_) => RetKind::Long,
            Self::Float(_) => RetKind::Float,
            Self::Bool(_) => RetKind::Bool,
            Self::Size(_) => RetKind::Size,
            Self::Str(_) => RetKind::Str,
            Self::RawData(_) => RetKind::RawData,
            Self::Unit => RetKind::Unit,
        }
    }
}

/// Check `args` against the declared parameters of `op`.
pub fn check_args<H>(op: ApiOp, args: &[Arg<H>]) -> Result<(), Error> {
    let params = op.signature().params;
    if params.len() != args.len() {
        return Err(Error::Signature {
            op,
            detail: format!(
                "expected {} argument(s), got {}",
                params.len(),
                args.len()
            ),
        });
    }
    for (i, (param, arg)) in params.iter().zip(args).enumerate() {
        if *param != arg.kind() {
            return Err(Error::Signature {
                op,
                detail: format!(
                    "argument {i}: expected {param:?}, got {:?}",
                    arg.kind()
                ),
            });
        }
    }
    Ok(())
}

/// Check a result against the declared return kind of `op`.
pub fn check_ret<H>(op: ApiOp, ret: &Ret<H>) -> Result<(), Error> {
    let expected = op.signature().ret;
    if expected != ret.kind() {
        return Err(Error::Signature {
            op,
            detail: format!(
                "expected {expected:?} result, got {:?}",
                ret.kind()
            ),
        });
    }
    Ok(())
}

fn mismatch<H>(op: ApiOp, ret: &Ret<H>) -> Error {
    Error::Signature {
        op,
        detail: format!("unexpected {:?} result", ret.kind()),
    }
}

/// The handle-based API native code programs against.
///
/// Implementors provide [`Context::call`]; the typed helpers are shared.
pub trait Context {
    type Handle: Copy + PartialEq + fmt::Debug;

    fn call(
        &self,
        op: ApiOp,
        args: &[Arg<Self::Handle>],
    ) -> Result<Ret<Self::Handle>, Error>;

    fn call_handle(
        &self,
        op: ApiOp,
        args: &[Arg<Self::Handle>],
    ) -> Result<Self::Handle, Error> {
        match self.call(op, args)? {
            Ret::Handle(h) => Ok(h),
            other => Err(mismatch(op, &other)),
        }
    }

    fn call_unit(
        &self,
        op: ApiOp,
        args: &[Arg<Self::Handle>],
    ) -> Result<(), Error> {
        match self.call(op, args)? {
            Ret::Unit => Ok(()),
            other => Err(mismatch(op, &other)),
        }
    }

    fn dup(&self, h: Self::Handle) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Dup, &[Arg::Handle(h)])
    }

    fn close(&self, h: Self::Handle) -> Result<(), Error> {
        self.call_unit(ApiOp::Close, &[Arg::Handle(h)])
    }

    fn long_from_i64(&self, value: i64) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::LongFromI64, &[Arg::Long(value)])
    }

    fn long_as_i64(&self, h: Self::Handle) -> Result<i64, Error> {
        match self.call(ApiOp::LongAsI64, &[Arg::Handle(h)])? {
            Ret::Long(value) => Ok(value),
            other => Err(mismatch(ApiOp::LongAsI64, &other)),
        }
    }

    fn float_from_f64(&self, value: f64) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::FloatFromF64, &[Arg::Float(value)])
    }

    fn float_as_f64(&self, h: Self::Handle) -> Result<f64, Error> {
        match self.call(ApiOp::FloatAsF64, &[Arg::Handle(h)])? {
            Ret::Float(value) => Ok(value),
            other => Err(mismatch(ApiOp::FloatAsF64, &other)),
        }
    }

    fn bool_from_bool(&self, value: bool) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::BoolFromBool, &[Arg::Bool(value)])
    }

    fn unicode_from_str(&self, value: &str) -> Result<Self::Handle, Error> {
        self.call_handle(
            ApiOp::UnicodeFromStr,
            &[Arg::Str(value.to_string())],
        )
    }

    fn unicode_as_utf8(&self, h: Self::Handle) -> Result<RawData, Error> {
        match self.call(ApiOp::UnicodeAsUtf8, &[Arg::Handle(h)])? {
            Ret::RawData(data) => Ok(data),
            other => Err(mismatch(ApiOp::UnicodeAsUtf8, &other)),
        }
    }

    fn add(
        &self,
        a: Self::Handle,
        b: Self::Handle,
    ) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Add, &[Arg::Handle(a), Arg::Handle(b)])
    }

    fn subtract(
        &self,
        a: Self::Handle,
        b: Self::Handle,
    ) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Subtract, &[Arg::Handle(a), Arg::Handle(b)])
    }

    fn multiply(
        &self,
        a: Self::Handle,
        b: Self::Handle,
    ) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Multiply, &[Arg::Handle(a), Arg::Handle(b)])
    }

    fn repr(&self, h: Self::Handle) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Repr, &[Arg::Handle(h)])
    }

    fn str(&self, h: Self::Handle) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::Str, &[Arg::Handle(h)])
    }

    fn length(&self, h: Self::Handle) -> Result<usize, Error> {
        match self.call(ApiOp::Length, &[Arg::Handle(h)])? {
            Ret::Size(n) => Ok(n),
            other => Err(mismatch(ApiOp::Length, &other)),
        }
    }

    fn is_true(&self, h: Self::Handle) -> Result<bool, Error> {
        match self.call(ApiOp::IsTrue, &[Arg::Handle(h)])? {
            Ret::Bool(b) => Ok(b),
            other => Err(mismatch(ApiOp::IsTrue, &other)),
        }
    }

    fn get_item(
        &self,
        container: Self::Handle,
        key: Self::Handle,
    ) -> Result<Self::Handle, Error> {
        self.call_handle(
            ApiOp::GetItem,
            &[Arg::Handle(container), Arg::Handle(key)],
        )
    }

    fn set_item(
        &self,
        container: Self::Handle,
        key: Self::Handle,
        value: Self::Handle,
    ) -> Result<(), Error> {
        self.call_unit(
            ApiOp::SetItem,
            &[Arg::Handle(container), Arg::Handle(key), Arg::Handle(value)],
        )
    }

    fn get_attr(
        &self,
        h: Self::Handle,
        name: &str,
    ) -> Result<Self::Handle, Error> {
        self.call_handle(
            ApiOp::GetAttr,
            &[Arg::Handle(h), Arg::Str(name.to_string())],
        )
    }

    fn set_attr(
        &self,
        h: Self::Handle,
        name: &str,
        value: Self::Handle,
    ) -> Result<(), Error> {
        self.call_unit(
            ApiOp::SetAttr,
            &[Arg::Handle(h), Arg::Str(name.to_string()), Arg::Handle(value)],
        )
    }

    fn list_new(&self, capacity: usize) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::ListNew, &[Arg::Size(capacity)])
    }

    fn list_append(
        &self,
        list: Self::Handle,
        item: Self::Handle,
    ) -> Result<(), Error> {
        self.call_unit(
            ApiOp::ListAppend,
            &[Arg::Handle(list), Arg::Handle(item)],
        )
    }

    fn tuple_from_array(
        &self,
        items: &[Self::Handle],
    ) -> Result<Self::Handle, Error> {
        self.call_handle(
            ApiOp::TupleFromArray,
            &[Arg::Handles(items.to_vec())],
        )
    }

    fn namespace_new(&self) -> Result<Self::Handle, Error> {
        self.call_handle(ApiOp::NamespaceNew, &[])
    }

    fn type_name(&self, h: Self::Handle) -> Result<String, Error> {
        match self.call(ApiOp::TypeName, &[Arg::Handle(h)])? {
            Ret::Str(name) => Ok(name),
            other => Err(mismatch(ApiOp::TypeName, &other)),
        }
    }
}

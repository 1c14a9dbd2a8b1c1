//! The plain host runtime beneath the debug layer.
//!
//! [`HostContext`] is the boundary the debug layer consumes: a [`Context`]
//! over plain handles that forwards every call to the real runtime.
//! [`SimpleHost`] is a small in-process object space implementing it.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{ApiOp, Arg, Context, Error, RawData, Ret, check_args};

/// Plain handle of the host runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct UHandle(u64);

impl UHandle {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for UHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UHandle({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    TypeError,
    ValueError,
    IndexError,
    AttributeError,
    OverflowError,
    ZeroDivisionError,
    SystemError,
}

/// An error raised by the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HostError {}

fn raise<T>(
    kind: HostErrorKind,
    message: impl Into<String>,
) -> Result<T, Error> {
    Err(Error::Host(HostError::new(kind, message)))
}

/// The call-forwarding layer the debug context sits on.
pub trait HostContext: Context<Handle = UHandle> + Send + Sync {
    /// Printable form of the object behind `h`, for reports. Must not fail
    /// loudly: `None` when the handle is not valid.
    fn describe(&self, h: UHandle) -> Option<String>;
}

type ObjectRef = Arc<Object>;

enum Object {
    None,
    Bool(bool),
    Long(i64),
    Float(f64),
    Str(String),
    List(Mutex<Vec<ObjectRef>>),
    Tuple(Box<[ObjectRef]>),
    Namespace(Mutex<BTreeMap<String, ObjectRef>>),
}

const REPR_DEPTH_LIMIT: usize = 32;

impl Object {
    fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Long(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Namespace(_) => "namespace",
        }
    }

    fn repr(&self, depth: usize) -> String {
        if depth > REPR_DEPTH_LIMIT {
            return "...".to_string();
        }
        let join = |items: &[ObjectRef]| {
            items
                .iter()
                .map(|o| o.repr(depth + 1))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Long(n) => n.to_string(),
            Self::Float(x) => format!("{x:?}"),
            Self::Str(s) => {
                format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            Self::List(items) => {
                // snapshot, so nested reprs never hold the lock
                let items = items.lock().clone();
                format!("[{}]", join(&items))
            }
            Self::Tuple(items) if items.len() == 1 => {
                format!("({},)", items[0].repr(depth + 1))
            }
            Self::Tuple(items) => format!("({})", join(items)),
            Self::Namespace(attrs) => {
                let attrs = attrs.lock().clone();
                let body = attrs
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.repr(depth + 1)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("namespace({body})")
            }
        }
    }

    fn str(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.repr(0),
        }
    }

    fn is_true(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Long(n) => *n != 0,
            Self::Float(x) => *x != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.lock().is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Namespace(_) => true,
        }
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 {
        index.checked_add(len as i64)?
    } else {
        index
    };
    (0..len as i64).contains(&index).then_some(index as usize)
}

/// In-process object space addressed through plain handles.
///
/// Every handle is a separate entry, so `Dup` yields a distinct handle to
/// the same object and `Close` drops only that entry.
pub struct SimpleHost {
    handles: Mutex<HashMap<u64, ObjectRef>>,
    next: AtomicU64,
}

impl Default for SimpleHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleHost {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Number of plain handles currently open.
    pub fn live_handles(&self) -> usize {
        self.handles.lock().len()
    }

    fn open(&self, object: ObjectRef) -> UHandle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(raw, object);
        UHandle(raw)
    }

    fn get(&self, h: UHandle) -> Result<ObjectRef, Error> {
        match self.handles.lock().get(&h.0) {
            Some(object) => Ok(object.clone()),
            None => raise(
                HostErrorKind::SystemError,
                format!("invalid plain handle {}", h.0),
            ),
        }
    }

    fn handle_arg(
        &self,
        args: &[Arg<UHandle>],
        i: usize,
    ) -> Result<ObjectRef, Error> {
        match &args[i] {
            Arg::Handle(h) => self.get(*h),
            _ => raise(HostErrorKind::SystemError, "expected a handle"),
        }
    }

    fn str_arg(args: &[Arg<UHandle>], i: usize) -> Result<&str, Error> {
        match &args[i] {
            Arg::Str(s) => Ok(s),
            _ => raise(HostErrorKind::SystemError, "expected a str argument"),
        }
    }

    fn arithmetic(
        &self,
        op: ApiOp,
        a: &Object,
        b: &Object,
    ) -> Result<Object, Error> {
        use Object::{Float, List, Long, Str};
        let overflow = || {
            Error::Host(HostError::new(
                HostErrorKind::OverflowError,
                "integer overflow",
            ))
        };
        let value = match (op, a, b) {
            (ApiOp::Add, Long(x), Long(y)) => {
                Long(x.checked_add(*y).ok_or_else(overflow)?)
            }
            (ApiOp::Subtract, Long(x), Long(y)) => {
                Long(x.checked_sub(*y).ok_or_else(overflow)?)
            }
            (ApiOp::Multiply, Long(x), Long(y)) => {
                Long(x.checked_mul(*y).ok_or_else(overflow)?)
            }
            (ApiOp::Add, Str(x), Str(y)) => Str(format!("{x}{y}")),
            (ApiOp::Multiply, Str(s), Long(n)) => {
                Str(s.repeat((*n).max(0) as usize))
            }
            (ApiOp::Add, List(x), List(y)) => {
                let mut items = x.lock().clone();
                items.extend(y.lock().iter().cloned());
                List(Mutex::new(items))
            }
            (_, Long(_) | Float(_), Long(_) | Float(_)) => {
                let as_float = |o: &Object| match o {
                    Long(n) => *n as f64,
                    Float(x) => *x,
                    _ => 0.0,
                };
                let (x, y) = (as_float(a), as_float(b));
                Float(match op {
                    ApiOp::Add => x + y,
                    ApiOp::Subtract => x - y,
                    _ => x * y,
                })
            }
            _ => {
                return raise(
                    HostErrorKind::TypeError,
                    format!(
                        "unsupported operand type(s) for {}: '{}' and '{}'",
                        op.name(),
                        a.type_name(),
                        b.type_name()
                    ),
                );
            }
        };
        Ok(value)
    }

    fn item_of(
        &self,
        container: &Object,
        key: &Object,
    ) -> Result<ObjectRef, Error> {
        let Object::Long(index) = key else {
            return raise(
                HostErrorKind::TypeError,
                format!("indices must be integers, not {}", key.type_name()),
            );
        };
        let found = match container {
            Object::List(items) => {
                let items = items.lock();
                normalize_index(*index, items.len()).map(|i| items[i].clone())
            }
            Object::Tuple(items) => {
                normalize_index(*index, items.len()).map(|i| items[i].clone())
            }
            Object::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                normalize_index(*index, chars.len())
                    .map(|i| Arc::new(Object::Str(chars[i].to_string())))
            }
            other => {
                return raise(
                    HostErrorKind::TypeError,
                    format!(
                        "'{}' object is not subscriptable",
                        other.type_name()
                    ),
                );
            }
        };
        match found {
            Some(item) => Ok(item),
            None => raise(
                HostErrorKind::IndexError,
                format!("{} index out of range", container.type_name()),
            ),
        }
    }
}

impl Context for SimpleHost {
    type Handle = UHandle;

    fn call(
        &self,
        op: ApiOp,
        args: &[Arg<UHandle>],
    ) -> Result<Ret<UHandle>, Error> {
        check_args(op, args)?;
        let ret = match op {
            ApiOp::Dup => Ret::Handle(self.open(self.handle_arg(args, 0)?)),
            ApiOp::Close => {
                let Arg::Handle(h) = &args[0] else {
                    return raise(HostErrorKind::SystemError, "bad close");
                };
                if self.handles.lock().remove(&h.0).is_none() {
                    return raise(
                        HostErrorKind::SystemError,
                        format!("closing invalid plain handle {}", h.0),
                    );
                }
                Ret::Unit
            }
            ApiOp::LongFromI64 => {
                let Arg::Long(n) = args[0] else {
                    return raise(HostErrorKind::SystemError, "bad long");
                };
                Ret::Handle(self.open(Arc::new(Object::Long(n))))
            }
            ApiOp::LongAsI64 => match &*self.handle_arg(args, 0)? {
                Object::Long(n) => Ret::Long(*n),
                Object::Bool(b) => Ret::Long(*b as i64),
                other => {
                    return raise(
                        HostErrorKind::TypeError,
                        format!("expected int, got {}", other.type_name()),
                    );
                }
            },
            ApiOp::FloatFromF64 => {
                let Arg::Float(x) = args[0] else {
                    return raise(HostErrorKind::SystemError, "bad float");
                };
                Ret::Handle(self.open(Arc::new(Object::Float(x))))
            }
            ApiOp::BoolFromBool => {
                let Arg::Bool(b) = args[0] else {
                    return raise(HostErrorKind::SystemError, "bad bool");
                };
                Ret::Handle(self.open(Arc::new(Object::Bool(b))))
            }
            ApiOp::FloatAsF64 => match &*self.handle_arg(args, 0)? {
                Object::Float(x) => Ret::Float(*x),
                Object::Long(n) => Ret::Float(*n as f64),
                other => {
                    return raise(
                        HostErrorKind::TypeError,
                        format!("expected float, got {}", other.type_name()),
                    );
                }
            },
            ApiOp::UnicodeFromStr => {
                let s = Self::str_arg(args, 0)?;
                Ret::Handle(self.open(Arc::new(Object::Str(s.to_string()))))
            }
            ApiOp::UnicodeAsUtf8 => {
                let object = self.handle_arg(args, 0)?;
                let Object::Str(s) = &*object else {
                    return raise(
                        HostErrorKind::TypeError,
                        format!("expected str, got {}", object.type_name()),
                    );
                };
                // the handle keeps the Arc, hence the bytes, alive
                Ret::RawData(RawData::new(s.as_ptr(), s.len()))
            }
            ApiOp::Add | ApiOp::Subtract | ApiOp::Multiply => {
                let a = self.handle_arg(args, 0)?;
                let b = self.handle_arg(args, 1)?;
                let value = self.arithmetic(op, &a, &b)?;
                Ret::Handle(self.open(Arc::new(value)))
            }
            ApiOp::Repr => {
                let repr = self.handle_arg(args, 0)?.repr(0);
                Ret::Handle(self.open(Arc::new(Object::Str(repr))))
            }
            ApiOp::Str => {
                let s = self.handle_arg(args, 0)?.str();
                Ret::Handle(self.open(Arc::new(Object::Str(s))))
            }
            ApiOp::Length => match &*self.handle_arg(args, 0)? {
                Object::Str(s) => Ret::Size(s.chars().count()),
                Object::List(items) => Ret::Size(items.lock().len()),
                Object::Tuple(items) => Ret::Size(items.len()),
                Object::Namespace(attrs) => Ret::Size(attrs.lock().len()),
                other => {
                    return raise(
                        HostErrorKind::TypeError,
                        format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        ),
                    );
                }
            },
            ApiOp::IsTrue => Ret::Bool(self.handle_arg(args, 0)?.is_true()),
            ApiOp::GetItem => {
                let container = self.handle_arg(args, 0)?;
                let key = self.handle_arg(args, 1)?;
                Ret::Handle(self.open(self.item_of(&container, &key)?))
            }
            ApiOp::SetItem => {
                let container = self.handle_arg(args, 0)?;
                let key = self.handle_arg(args, 1)?;
                let value = self.handle_arg(args, 2)?;
                let (Object::List(items), Object::Long(index)) =
                    (&*container, &*key)
                else {
                    return raise(
                        HostErrorKind::TypeError,
                        format!(
                            "'{}' object does not support item assignment",
                            container.type_name()
                        ),
                    );
                };
                let mut items = items.lock();
                let Some(i) = normalize_index(*index, items.len()) else {
                    return raise(
                        HostErrorKind::IndexError,
                        "list assignment index out of range",
                    );
                };
                items[i] = value;
                Ret::Unit
            }
            ApiOp::GetAttr => {
                let object = self.handle_arg(args, 0)?;
                let name = Self::str_arg(args, 1)?;
                let found = match &*object {
                    Object::Namespace(attrs) => attrs.lock().get(name).cloned(),
                    _ => None,
                };
                match found {
                    Some(value) => Ret::Handle(self.open(value)),
                    None => {
                        return raise(
                            HostErrorKind::AttributeError,
                            format!(
                                "'{}' object has no attribute '{name}'",
                                object.type_name()
                            ),
                        );
                    }
                }
            }
            ApiOp::SetAttr => {
                let object = self.handle_arg(args, 0)?;
                let name = Self::str_arg(args, 1)?;
                let value = self.handle_arg(args, 2)?;
                let Object::Namespace(attrs) = &*object else {
                    return raise(
                        HostErrorKind::AttributeError,
                        format!(
                            "'{}' object attributes are read-only",
                            object.type_name()
                        ),
                    );
                };
                attrs.lock().insert(name.to_string(), value);
                Ret::Unit
            }
            ApiOp::ListNew => {
                let Arg::Size(len) = args[0] else {
                    return raise(HostErrorKind::SystemError, "bad size");
                };
                let none = Arc::new(Object::None);
                let list = Object::List(Mutex::new(vec![none; len]));
                Ret::Handle(self.open(Arc::new(list)))
            }
            ApiOp::ListAppend => {
                let list = self.handle_arg(args, 0)?;
                let item = self.handle_arg(args, 1)?;
                let Object::List(items) = &*list else {
                    return raise(
                        HostErrorKind::TypeError,
                        format!("expected list, got {}", list.type_name()),
                    );
                };
                items.lock().push(item);
                Ret::Unit
            }
            ApiOp::TupleFromArray => {
                let Arg::Handles(hs) = &args[0] else {
                    return raise(HostErrorKind::SystemError, "bad array");
                };
                let items = hs
                    .iter()
                    .map(|h| self.get(*h))
                    .collect::<Result<Vec<_>, _>>()?;
                let tuple = Object::Tuple(items.into_boxed_slice());
                Ret::Handle(self.open(Arc::new(tuple)))
            }
            ApiOp::NamespaceNew => {
                let ns = Object::Namespace(Mutex::new(BTreeMap::new()));
                Ret::Handle(self.open(Arc::new(ns)))
            }
            ApiOp::TypeName => {
                Ret::Str(self.handle_arg(args, 0)?.type_name().to_string())
            }
        };
        Ok(ret)
    }
}

impl HostContext for SimpleHost {
    fn describe(&self, h: UHandle) -> Option<String> {
        self.get(h).ok().map(|object| object.repr(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_and_close_manage_distinct_handles() {
        let host = SimpleHost::new();
        let a = host.long_from_i64(5).expect("long");
        let b = host.dup(a).expect("dup");
        assert_ne!(a, b);
        assert_eq!(host.live_handles(), 2);
        host.close(a).expect("close");
        assert_eq!(host.long_as_i64(b), Ok(5));
        host.close(b).expect("close");
        assert_eq!(host.live_handles(), 0);
        assert!(host.close(b).is_err());
    }

    #[test]
    fn arithmetic_follows_operand_types() {
        let host = SimpleHost::new();
        let two = host.long_from_i64(2).expect("long");
        let half = host.float_from_f64(0.5).expect("float");
        let sum = host.add(two, half).expect("add");
        assert_eq!(host.float_as_f64(sum), Ok(2.5));
        let product = host.multiply(two, two).expect("mul");
        assert_eq!(host.long_as_i64(product), Ok(4));

        let text = host.unicode_from_str("ab").expect("str");
        match host.subtract(text, two) {
            Err(Error::Host(HostError {
                kind: HostErrorKind::TypeError,
                ..
            })) => {}
            other => panic!("expected TypeError, got {other:?}"),
        }
    }

    #[test]
    fn containers_support_items_and_repr() {
        let host = SimpleHost::new();
        let list = host.list_new(0).expect("list");
        let one = host.long_from_i64(1).expect("long");
        let s = host.unicode_from_str("x").expect("str");
        host.list_append(list, one).expect("append");
        host.list_append(list, s).expect("append");
        assert_eq!(host.length(list), Ok(2));
        assert_eq!(host.describe(list).as_deref(), Some("[1, 'x']"));

        let minus_one = host.long_from_i64(-1).expect("long");
        let last = host.get_item(list, minus_one).expect("item");
        assert_eq!(host.type_name(last).as_deref(), Ok("str"));

        let tuple = host.tuple_from_array(&[one]).expect("tuple");
        assert_eq!(host.describe(tuple).as_deref(), Some("(1,)"));
    }

    #[test]
    fn bools_are_host_objects() {
        let host = SimpleHost::new();
        let yes = host.bool_from_bool(true).expect("bool");
        let no = host.bool_from_bool(false).expect("bool");
        assert_eq!(host.type_name(yes).as_deref(), Ok("bool"));
        assert_eq!(host.describe(no).as_deref(), Some("False"));
        assert_eq!(host.is_true(yes), Ok(true));
        assert_eq!(host.is_true(no), Ok(false));
        assert_eq!(host.long_as_i64(yes), Ok(1));
    }

    #[test]
    fn namespaces_hold_attributes() {
        let host = SimpleHost::new();
        let ns = host.namespace_new().expect("ns");
        let v = host.long_from_i64(3).expect("long");
        host.set_attr(ns, "x", v).expect("setattr");
        let x = host.get_attr(ns, "x").expect("getattr");
        assert_eq!(host.long_as_i64(x), Ok(3));
        assert!(matches!(
            host.get_attr(ns, "y"),
            Err(Error::Host(HostError {
                kind: HostErrorKind::AttributeError,
                ..
            }))
        ));
        assert_eq!(host.describe(ns).as_deref(), Some("namespace(x=3)"));
    }

    #[test]
    fn utf8_data_points_into_the_string() {
        let host = SimpleHost::new();
        let s = host.unicode_from_str("héllo").expect("str");
        let data = host.unicode_as_utf8(s).expect("utf8");
        assert_eq!(unsafe { data.as_bytes() }, "héllo".as_bytes());
    }
}

//! The tagged runtime value and its heap-allocated payloads.
//!
//! Lifetime management is reference counting through `Rc`: cloning a `Value`
//! retains its payload, dropping releases it. There is no manual
//! retain/release surface, so an unbalanced release is unrepresentable.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::module::ClassDef;
use crate::value::closure::FuncPtr;
use crate::value::pool::PoolInner;
use crate::vm::fiber::FiberHandle;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Num(f64),
    Bool(bool),
    Str(Rc<str>),
    Obj(Rc<HeapObject>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn obj(o: HeapObject) -> Self {
        Value::Obj(Rc::new(o))
    }

    /// A fresh shared cell holding `v`.
    pub fn cell(v: Value) -> Self {
        Value::obj(HeapObject::Cell(RefCell::new(v)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Num(_) => "num",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Obj(o) => o.type_name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null and `false` are falsy; zero is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&Rc<HeapObject>> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// The fiber handle inside, when this value wraps a fiber.
    pub fn as_fiber(&self) -> Option<&FiberHandle> {
        match self {
            Value::Obj(o) => match o.as_ref() {
                HeapObject::Fiber(h) => Some(h),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&FuncPtr> {
        match self {
            Value::Obj(o) => match o.as_ref() {
                HeapObject::Closure(p) => Some(p),
                _ => None,
            },
            _ => None,
        }
    }

    /// Read through this value, which must be a cell.
    pub fn cell_get(&self) -> Option<Value> {
        match self {
            Value::Obj(o) => match o.as_ref() {
                HeapObject::Cell(c) => Some(c.borrow().clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Write through this value, which must be a cell.
    pub fn cell_set(&self, v: Value) -> bool {
        match self {
            Value::Obj(o) => match o.as_ref() {
                HeapObject::Cell(c) => {
                    *c.borrow_mut() = v;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // Heap payloads compare by identity.
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Obj(o) => write!(f, "{}", o),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Num(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

/// List backing storage. When the list was allocated from a pool, dropping
/// the last reference hands the buffer back instead of freeing it.
#[derive(Debug, Default)]
pub struct ListStorage {
    pub items: Vec<Value>,
    pub(crate) pool: Option<Weak<RefCell<PoolInner<Vec<Value>>>>>,
}

impl ListStorage {
    pub fn new(items: Vec<Value>) -> Self {
        ListStorage { items, pool: None }
    }
}

impl Drop for ListStorage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|w| w.upgrade()) {
            let mut buf = std::mem::take(&mut self.items);
            buf.clear();
            pool.borrow_mut().put_back(buf);
        }
    }
}

#[derive(Debug)]
pub enum HeapObject {
    /// Class instance: field slots indexed by compile-time layout.
    Instance {
        class: Rc<ClassDef>,
        fields: RefCell<Vec<Value>>,
    },
    List(RefCell<ListStorage>),
    Closure(FuncPtr),
    /// Shared mutable storage for by-reference captures and `ref` arguments.
    Cell(RefCell<Value>),
    Fiber(FiberHandle),
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::Instance { .. } => "instance",
            HeapObject::List(_) => "list",
            HeapObject::Closure(_) => "closure",
            HeapObject::Cell(_) => "cell",
            HeapObject::Fiber(_) => "fiber",
        }
    }
}

impl fmt::Display for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapObject::Instance { class, .. } => write!(f, "<instance:{}>", class.name),
            HeapObject::List(l) => write!(f, "<list:{}>", l.borrow().items.len()),
            HeapObject::Closure(p) => write!(f, "<closure:{}>", p.name()),
            HeapObject::Cell(c) => write!(f, "<cell:{}>", c.borrow()),
            HeapObject::Fiber(h) => write!(f, "<fiber:{}>", h.status().as_str()),
        }
    }
}

// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The symbolic Python object model.
//!
//! The interpreter never materializes live Python values; it builds a graph
//! of `PyObj` nodes instead.  Calls and mutations that cannot be evaluated
//! symbolically (REDUCE, NEWOBJ, BUILD and friends) are recorded as `What`
//! chains: a list of `PyOper` records starting with a fake "initial object"
//! operation, followed by the operations applied to it in stream order.
//!
//! Sharing is modelled with `Rc`: every stack slot, container element, memo
//! slot and operator argument holds one strong reference.  Pickles can build
//! self-referential containers (EMPTY_LIST DUP APPEND makes `[[...]]`), so
//! plain `Rc` dropping would leak cycles.  `release_deep` takes every
//! reachable payload out of its cell before the references drop, which frees
//! such graphs without double-frees.  The memo must *not* be released deeply:
//! an object referenced by the memo is always also referenced by one of the
//! stacks, so dropping the memo's references shallowly cannot leak, while a
//! deep release would gut objects the renderer still needs.

use std::cell::{Cell, RefCell};
use std::fmt::Write;
use std::rc::Rc;

use num_bigint::BigInt;

pub type ObjRef = Rc<PyObj>;

/// One node of the recovered object graph.
pub struct PyObj {
    /// Variant payload; mutated by container opcodes and split insertion.
    pub kind: RefCell<PyKind>,
    /// Byte offset of the opcode that produced this object.
    pub offset: u64,
    /// Memo slot this object was first bound to, if any.
    pub memo_id: Cell<Option<u64>>,
    /// Variable name assigned during rendering.
    pub varname: RefCell<Option<String>>,
    /// Epoch mark for cycle-safe traversals.
    pub recurse: Cell<u64>,
}

pub enum PyKind {
    None,
    Bool(bool),
    Int(i64),
    Long(BigInt),
    Float(f64),
    /// Raw payload bytes of any string-like opcode (str, bytes, bytearray).
    Str(Vec<u8>),
    Tuple(Vec<ObjRef>),
    List(Vec<ObjRef>),
    Set(Vec<ObjRef>),
    FrozenSet(Vec<ObjRef>),
    /// Alternating key/value sequence, insertion order preserved.
    Dict(Vec<ObjRef>),
    /// A symbolic `module.name` callable.
    Func { module: ObjRef, name: ObjRef },
    /// An unresolved object: operations to apply at construction time.
    What(Vec<Rc<PyOper>>),
    /// Watermark inside a reduce argument container, see `Machine`.
    Split(Rc<PyOper>),
    /// Payload was taken by `release_deep`.
    Released,
}

impl PyObj {
    pub fn new(offset: u64, kind: PyKind) -> ObjRef {
        Rc::new(PyObj {
            kind: RefCell::new(kind),
            offset,
            memo_id: Cell::new(None),
            varname: RefCell::new(None),
            recurse: Cell::new(0),
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.borrow().type_name()
    }

    /// True for objects that render as a single inline expression and never
    /// need statements of their own.
    pub fn is_leaf(&self) -> bool {
        matches!(&*self.kind.borrow(),
                 PyKind::None | PyKind::Bool(_) | PyKind::Int(_) | PyKind::Long(_) |
                 PyKind::Float(_) | PyKind::Str(_) | PyKind::Func { .. })
    }
}

impl PyKind {
    pub fn type_name(&self) -> &'static str {
        match *self {
            PyKind::None => "none",
            PyKind::Bool(_) => "bool",
            PyKind::Int(_) | PyKind::Long(_) => "int",
            PyKind::Float(_) => "float",
            PyKind::Str(_) => "str",
            PyKind::Tuple(_) => "tuple",
            PyKind::List(_) => "list",
            PyKind::Set(_) => "set",
            PyKind::FrozenSet(_) => "frozenset",
            PyKind::Dict(_) => "dict",
            PyKind::Func { .. } => "func",
            PyKind::What(_) => "what",
            PyKind::Split(_) => "split",
            PyKind::Released => "released",
        }
    }
}

/// The operation kinds a `What` chain can record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PyOp {
    /// Wraps the object a chain started from; always first, always arity 1.
    FakeInit,
    Reduce,
    NewObj,
    Build,
    Append,
    Appends,
    SetItem,
    SetItems,
    AddItems,
    Inst,
    Obj,
}

impl PyOp {
    pub fn name(self) -> &'static str {
        match self {
            PyOp::FakeInit => "init",
            PyOp::Reduce => "reduce",
            PyOp::NewObj => "newobj",
            PyOp::Build => "build",
            PyOp::Append => "append",
            PyOp::Appends => "appends",
            PyOp::SetItem => "setitem",
            PyOp::SetItems => "setitems",
            PyOp::AddItems => "additems",
            PyOp::Inst => "inst",
            PyOp::Obj => "obj",
        }
    }
}

/// One recorded operation with the arguments it consumed.
pub struct PyOper {
    pub op: PyOp,
    pub offset: u64,
    pub stack: RefCell<Vec<ObjRef>>,
}

impl PyOper {
    pub fn new(op: PyOp, offset: u64, args: Vec<ObjRef>) -> Rc<PyOper> {
        Rc::new(PyOper { op, offset, stack: RefCell::new(args) })
    }
}

/// Releases a set of roots including any cycles among them.
///
/// Every reachable payload is replaced by `PyKind::Released` before the
/// collected references drop, so a container that (transitively) contains
/// itself cannot keep itself alive, and nothing is visited twice.
pub fn release_deep<I: IntoIterator<Item = ObjRef>>(roots: I) {
    let mut work: Vec<ObjRef> = roots.into_iter().collect();
    while let Some(obj) = work.pop() {
        match obj.kind.replace(PyKind::Released) {
            PyKind::Tuple(items) | PyKind::List(items) | PyKind::Set(items) |
            PyKind::FrozenSet(items) | PyKind::Dict(items) => work.extend(items),
            PyKind::Func { module, name } => {
                work.push(module);
                work.push(name);
            }
            PyKind::What(chain) => {
                for oper in chain {
                    work.extend(oper.stack.take());
                }
            }
            PyKind::Split(oper) => work.extend(oper.stack.take()),
            _ => {}
        }
    }
}

/// Escapes raw payload bytes as a double-quoted literal.
pub fn quoted(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => { let _ = write!(out, "\\x{:02x}", b); }
        }
    }
    out.push('"');
    out
}

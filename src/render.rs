// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pseudocode rendering of the final machine state.
//!
//! Every object on the final stack becomes one or more Python-like
//! statements; the top of the stack additionally renders as `return <name>`.
//! Objects that are shared, unresolved (`What`), or involved in cycles are
//! hoisted: their defining statements are flushed ahead of the statement
//! currently being built, and only their variable name appears in place.
//! The `varname` cache on each object guarantees a single declaration.
//!
//! Cycles cannot be rendered as literals.  A container element that is
//! currently being rendered higher up the walk, that is the result of the
//! reduce a `Split` watermark belongs to, or that sits after such a watermark
//! (i.e. postdates the construction) is cut from the literal and re-applied
//! afterwards as `v.append(x)` / `v.add(x)` / `v[k] = x`.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::rc::Rc;

use log::error;

use crate::machine::Machine;
use crate::obj::{quoted, ObjRef, PyKind, PyObj, PyOp, PyOper};

/// Renders the machine state as pseudocode.
pub fn pseudocode(machine: &Machine, truncated: bool, verbose: bool) -> String {
    Dumper::new(machine, truncated, verbose).dump()
}

enum Pending {
    ListAdd { container: String, item: ObjRef },
    SetAdd { container: String, item: ObjRef },
    DictSet { container: String, key: ObjRef, value: ObjRef },
}

#[derive(Clone, Copy, PartialEq)]
enum Seq {
    List,
    Set,
    FrozenSet,
}

/// Statement-oriented dumper with one output buffer per statement being
/// built, plus a stack of suspended buffers for hoisted declarations.
pub struct Dumper<'a> {
    machine: &'a Machine,
    truncated: bool,
    verbose: bool,
    sink: String,
    out: String,
    saved: Vec<String>,
    pending: Vec<Pending>,
    /// Objects with more than one owning reference in the graph.
    shared: HashSet<*const PyObj>,
    /// Memo slots that may still claim their `var_<id>` name.
    reserved: HashSet<u64>,
    claimed: HashSet<u64>,
    next_var: u64,
    epoch: u64,
}

impl<'a> Dumper<'a> {
    pub fn new(machine: &'a Machine, truncated: bool, verbose: bool) -> Dumper<'a> {
        let epoch = machine.recurse.get() + 1;
        machine.recurse.set(epoch);
        Dumper {
            machine,
            truncated,
            verbose,
            sink: String::new(),
            out: String::new(),
            saved: Vec::new(),
            pending: Vec::new(),
            shared: shared_objects(machine),
            reserved: machine.memo.keys().cloned().collect(),
            claimed: HashSet::new(),
            next_var: 0,
            epoch,
        }
    }

    pub fn dump(mut self) -> String {
        let m = self.machine;
        if self.verbose {
            self.sink.push_str(&format!("## stack len {}\n", m.stack.len()));
        }
        if m.stack.is_empty() && !self.truncated {
            self.sink.push_str("# empty stack\n");
        }
        for (i, obj) in m.stack.iter().enumerate() {
            let top = i + 1 == m.stack.len();
            if self.verbose {
                self.sink.push_str(&format!("## [{}]{}\n", m.stack.len() - 1 - i,
                                            if top { " TOP" } else { "" }));
            }
            self.root(obj, top && !self.truncated);
        }
        if self.truncated {
            for (i, frame) in m.metastack.iter().enumerate() {
                self.sink.push_str(&format!("# unclosed MARK frame {}\n", i));
                for obj in frame {
                    self.root(obj, false);
                }
            }
            if !m.popstack.is_empty() {
                self.sink.push_str("# discarded objects\n");
                for obj in &m.popstack {
                    self.root(obj, false);
                }
            }
        }
        self.flush_pending();
        self.sink
    }

    fn root(&mut self, obj: &ObjRef, ret: bool) {
        let named = obj.varname.borrow().clone();
        if let Some(vn) = named {
            if ret {
                self.sink.push_str(&format!("return {}\n", vn));
            } else if self.verbose {
                self.sink.push_str(&format!("# {} previously declared\n", vn));
            }
            return;
        }
        if ret && obj.is_leaf() {
            self.out.push_str("return ");
            self.expr(obj);
            self.out.push('\n');
            self.flush_out();
            return;
        }
        self.declare(obj);
        self.flush_out();
        self.flush_pending();
        if ret {
            let vn = self.varname(obj);
            self.sink.push_str(&format!("return {}\n", vn));
        }
    }

    /// Emits the statement(s) defining `obj` into the current buffer and
    /// assigns its variable name.
    fn declare(&mut self, obj: &ObjRef) {
        let vn = self.varname(obj);
        let prev = obj.recurse.replace(self.epoch);
        let chain: Option<Vec<Rc<PyOper>>> = match &*obj.kind.borrow() {
            PyKind::What(chain) => Some(chain.clone()),
            _ => None,
        };
        if let Some(chain) = chain {
            for oper in &chain {
                self.oper_stmt(oper, &vn);
            }
        } else {
            self.out.push_str(&vn);
            self.out.push_str(" = ");
            self.payload(obj);
            self.out.push('\n');
        }
        obj.recurse.set(prev);
    }

    /// Expression-position rendering: a bare name for anything already (or
    /// about to be) declared, a literal otherwise.
    fn expr(&mut self, obj: &ObjRef) {
        let named = obj.varname.borrow().clone();
        if let Some(vn) = named {
            self.out.push_str(&vn);
            return;
        }
        if obj.recurse.get() == self.epoch {
            // unnamed back-edge; containers cut these, so this only guards
            // degenerate graphs
            self.out.push_str("...");
            return;
        }
        if self.needs_hoist(obj) {
            self.hoist(obj);
            let vn = self.varname(obj);
            self.out.push_str(&vn);
            return;
        }
        let prev = obj.recurse.replace(self.epoch);
        self.payload(obj);
        obj.recurse.set(prev);
    }

    /// Flushes the declaration of `obj` ahead of the statement being built.
    fn hoist(&mut self, obj: &ObjRef) {
        self.saved.push(mem::take(&mut self.out));
        self.declare(obj);
        self.flush_out();
        if let Some(prev) = self.saved.pop() {
            self.out = prev;
        }
    }

    fn flush_out(&mut self) {
        self.sink.push_str(&self.out);
        self.out.clear();
    }

    fn flush_pending(&mut self) {
        // queued statements can queue more (containers declared on the fly)
        while !self.pending.is_empty() {
            for p in mem::take(&mut self.pending) {
                match p {
                    Pending::ListAdd { container, item } => {
                        self.out.push_str(&container);
                        self.out.push_str(".append(");
                        self.expr(&item);
                        self.out.push_str(")\n");
                    }
                    Pending::SetAdd { container, item } => {
                        self.out.push_str(&container);
                        self.out.push_str(".add(");
                        self.expr(&item);
                        self.out.push_str(")\n");
                    }
                    Pending::DictSet { container, key, value } => {
                        self.out.push_str(&container);
                        self.out.push('[');
                        self.expr(&key);
                        self.out.push_str("] = ");
                        self.expr(&value);
                        self.out.push('\n');
                    }
                }
                self.flush_out();
            }
        }
    }

    /// An object rendered inline must become a variable if it is shared, is
    /// an operator chain, or is a mutable container that will cut one of its
    /// elements (tuples never cut, so they never hoist on their own).
    fn needs_hoist(&self, obj: &ObjRef) -> bool {
        if self.shared.contains(&Rc::as_ptr(obj)) {
            return true;
        }
        let kind = obj.kind.borrow();
        match &*kind {
            PyKind::What(_) => true,
            PyKind::List(items) | PyKind::Set(items) | PyKind::FrozenSet(items) |
            PyKind::Dict(items) => {
                let splits = collect_splits(items);
                items.iter().any(|e| {
                    matches!(&*e.kind.borrow(), PyKind::Split(_)) ||
                        self.cut_worthy(e, &splits)
                })
            }
            _ => false,
        }
    }

    /// A container element is cut out of the literal when it is (or leads
    /// back to) an object currently being rendered, or when it is the result
    /// of the reduce one of the container's splits belongs to.
    fn cut_worthy(&self, e: &ObjRef, splits: &[Rc<PyOper>]) -> bool {
        e.recurse.get() == self.epoch || owns_split(e, splits) ||
            contains_marked(e, self.epoch)
    }

    fn varname(&mut self, obj: &ObjRef) -> String {
        if let Some(vn) = obj.varname.borrow().clone() {
            return vn;
        }
        let id = match obj.memo_id.get() {
            // first claim on a memo id wins; rebound slots fall through
            Some(id) if self.claimed.insert(id) => id,
            _ => {
                while self.reserved.contains(&self.next_var) ||
                      self.claimed.contains(&self.next_var) {
                    self.next_var += 1;
                }
                let id = self.next_var;
                self.claimed.insert(id);
                self.next_var += 1;
                id
            }
        };
        let vn = format!("var_{}", id);
        *obj.varname.borrow_mut() = Some(vn.clone());
        vn
    }

    fn payload(&mut self, obj: &ObjRef) {
        let kind = obj.kind.borrow();
        match &*kind {
            PyKind::None => self.out.push_str("None"),
            PyKind::Bool(b) => self.out.push_str(if *b { "True" } else { "False" }),
            PyKind::Int(i) => self.out.push_str(&i.to_string()),
            PyKind::Long(i) => self.out.push_str(&i.to_string()),
            PyKind::Float(f) => self.out.push_str(&format!("{:?}", f)),
            PyKind::Str(s) => self.out.push_str(&quoted(s)),
            PyKind::Func { module, name } => {
                let module = match &*module.kind.borrow() {
                    PyKind::Str(s) => quoted(s),
                    _ => "\"?\"".into(),
                };
                let name = match &*name.kind.borrow() {
                    PyKind::Str(s) => String::from_utf8_lossy(s).into_owned(),
                    _ => "?".into(),
                };
                self.out.push_str(&format!("__import__({}).{}", module, name));
            }
            PyKind::Tuple(items) => {
                let items = items.clone();
                drop(kind);
                self.tuple_expr(&items);
            }
            PyKind::List(items) => {
                let items = items.clone();
                drop(kind);
                self.seq_expr(obj, &items, Seq::List);
            }
            PyKind::Set(items) => {
                let items = items.clone();
                drop(kind);
                self.seq_expr(obj, &items, Seq::Set);
            }
            PyKind::FrozenSet(items) => {
                let items = items.clone();
                drop(kind);
                self.seq_expr(obj, &items, Seq::FrozenSet);
            }
            PyKind::Dict(items) => {
                let items = items.clone();
                drop(kind);
                self.dict_expr(obj, &items);
            }
            // named and declared elsewhere; nothing sensible to inline
            PyKind::What(_) | PyKind::Split(_) | PyKind::Released => {
                self.out.push_str("...");
            }
        }
    }

    fn tuple_expr(&mut self, items: &[ObjRef]) {
        self.out.push('(');
        for (i, e) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(e);
        }
        if items.len() == 1 {
            self.out.push(',');
        }
        self.out.push(')');
    }

    fn seq_expr(&mut self, obj: &ObjRef, items: &[ObjRef], seq: Seq) {
        let splits = collect_splits(items);
        let mut visible: Vec<ObjRef> = Vec::new();
        let mut cut: Vec<ObjRef> = Vec::new();
        let mut after_split = false;
        for e in items {
            if matches!(&*e.kind.borrow(), PyKind::Split(_)) {
                after_split = true;
                continue;
            }
            if after_split || self.cut_worthy(e, &splits) {
                cut.push(e.clone());
            } else {
                visible.push(e.clone());
            }
        }
        match seq {
            Seq::List => {
                self.out.push('[');
                self.csv(&visible);
                self.out.push(']');
            }
            Seq::Set => {
                if visible.is_empty() {
                    self.out.push_str("set()");
                } else {
                    self.out.push('{');
                    self.csv(&visible);
                    self.out.push('}');
                }
            }
            Seq::FrozenSet => {
                if visible.is_empty() {
                    self.out.push_str("frozenset()");
                } else {
                    self.out.push_str("frozenset({");
                    self.csv(&visible);
                    self.out.push_str("})");
                }
            }
        }
        if !cut.is_empty() {
            let container = self.varname(obj);
            for item in cut {
                self.pending.push(if seq == Seq::List {
                    Pending::ListAdd { container: container.clone(), item }
                } else {
                    Pending::SetAdd { container: container.clone(), item }
                });
            }
        }
    }

    fn dict_expr(&mut self, obj: &ObjRef, items: &[ObjRef]) {
        let splits = collect_splits(items);
        let mut visible: Vec<(ObjRef, ObjRef)> = Vec::new();
        let mut cut: Vec<(ObjRef, ObjRef)> = Vec::new();
        let mut after_split = false;
        let mut pending_key: Option<ObjRef> = None;
        for e in items {
            if matches!(&*e.kind.borrow(), PyKind::Split(_)) {
                after_split = true;
                continue;
            }
            match pending_key.take() {
                None => pending_key = Some(e.clone()),
                Some(k) => {
                    let v = e.clone();
                    let deferred = after_split ||
                        self.cut_worthy(&k, &splits) || self.cut_worthy(&v, &splits);
                    if deferred {
                        cut.push((k, v));
                    } else {
                        visible.push((k, v));
                    }
                }
            }
        }
        if pending_key.is_some() {
            error!("dict with dangling key at {:#x}", obj.offset);
        }
        self.out.push('{');
        for (i, (k, v)) in visible.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(k);
            self.out.push_str(": ");
            self.expr(v);
        }
        self.out.push('}');
        if !cut.is_empty() {
            let container = self.varname(obj);
            for (key, value) in cut {
                self.pending.push(Pending::DictSet { container: container.clone(), key, value });
            }
        }
    }

    fn csv(&mut self, items: &[ObjRef]) {
        for (i, e) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(e);
        }
    }

    fn oper_stmt(&mut self, oper: &PyOper, vn: &str) {
        let args: Vec<ObjRef> = oper.stack.borrow().clone();
        match oper.op {
            PyOp::FakeInit => {
                self.out.push_str(&format!("{} = ", vn));
                match args.first() {
                    Some(obj) => self.expr(obj),
                    None => self.out.push_str("..."),
                }
                self.out.push('\n');
            }
            PyOp::Reduce | PyOp::Inst | PyOp::Obj => {
                self.out.push_str(&format!("{} = {}(", vn, vn));
                if let Some(obj) = args.last() {
                    self.expr(obj);
                }
                self.out.push_str(")\n");
            }
            PyOp::NewObj => {
                self.out.push_str(&format!("{} = {}.__new__({}, *", vn, vn, vn));
                if let Some(obj) = args.last() {
                    self.expr(obj);
                }
                self.out.push_str(")\n");
            }
            PyOp::Build => {
                self.out.push_str(&format!("{}.__setstate__(", vn));
                if let Some(obj) = args.last() {
                    self.expr(obj);
                }
                self.out.push_str(")\n");
            }
            PyOp::Append => {
                self.out.push_str(&format!("{}.append(", vn));
                if let Some(obj) = args.last() {
                    self.expr(obj);
                }
                self.out.push_str(")\n");
            }
            PyOp::SetItem => {
                self.out.push_str(&format!("{}[", vn));
                match args.first() {
                    Some(k) => self.expr(k),
                    None => self.out.push_str("..."),
                }
                self.out.push_str("] = ");
                match args.get(1) {
                    Some(v) => self.expr(v),
                    None => self.out.push_str("..."),
                }
                self.out.push('\n');
            }
            PyOp::Appends => {
                self.out.push_str(&format!("{}.extend([", vn));
                self.csv(&args);
                self.out.push_str("])\n");
            }
            PyOp::AddItems => {
                if args.is_empty() {
                    self.out.push_str(&format!("{}.update(set())\n", vn));
                } else {
                    self.out.push_str(&format!("{}.update({{", vn));
                    self.csv(&args);
                    self.out.push_str("})\n");
                }
            }
            PyOp::SetItems => {
                self.out.push_str(&format!("{}.update({{", vn));
                let mut pairs = args.chunks_exact(2);
                let mut first = true;
                for pair in &mut pairs {
                    if !first {
                        self.out.push_str(", ");
                    }
                    first = false;
                    self.expr(&pair[0]);
                    self.out.push_str(": ");
                    self.expr(&pair[1]);
                }
                if !pairs.remainder().is_empty() {
                    error!("setitems with dangling key at {:#x}", oper.offset);
                }
                self.out.push_str("})\n");
            }
        }
    }
}

/// Objects with two or more owning references: stack/metastack/popstack
/// slots, memo values, container elements, func parts and operator
/// arguments.  Counted up front so the dumper's own transient clones don't
/// disturb the sharing test.
fn shared_objects(m: &Machine) -> HashSet<*const PyObj> {
    let mut counts: HashMap<*const PyObj, u32> = HashMap::new();
    let mut visited: HashSet<*const PyObj> = HashSet::new();
    let mut work: Vec<ObjRef> = Vec::new();
    {
        let mut edge = |obj: &ObjRef, work: &mut Vec<ObjRef>| {
            *counts.entry(Rc::as_ptr(obj)).or_insert(0) += 1;
            work.push(obj.clone());
        };
        for obj in &m.stack {
            edge(obj, &mut work);
        }
        for frame in &m.metastack {
            for obj in frame {
                edge(obj, &mut work);
            }
        }
        for obj in &m.popstack {
            edge(obj, &mut work);
        }
        for obj in m.memo.values() {
            edge(obj, &mut work);
        }
        while let Some(obj) = work.pop() {
            if !visited.insert(Rc::as_ptr(&obj)) {
                continue;
            }
            match &*obj.kind.borrow() {
                PyKind::Tuple(items) | PyKind::List(items) | PyKind::Set(items) |
                PyKind::FrozenSet(items) | PyKind::Dict(items) => {
                    for c in items {
                        edge(c, &mut work);
                    }
                }
                PyKind::Func { module, name } => {
                    edge(module, &mut work);
                    edge(name, &mut work);
                }
                PyKind::What(chain) => {
                    for oper in chain {
                        for c in oper.stack.borrow().iter() {
                            edge(c, &mut work);
                        }
                    }
                }
                // a split's operation is shared with a What chain whose
                // arguments are counted there
                _ => {}
            }
        }
    }
    counts.into_iter().filter(|&(_, n)| n >= 2).map(|(ptr, _)| ptr).collect()
}

fn collect_splits(items: &[ObjRef]) -> Vec<Rc<PyOper>> {
    items.iter()
         .filter_map(|e| match &*e.kind.borrow() {
             PyKind::Split(oper) => Some(oper.clone()),
             _ => None,
         })
         .collect()
}

/// Is `obj` the What whose chain contains one of the given reduce splits,
/// i.e. the reduce's own result referenced from its argument subtree?
fn owns_split(obj: &ObjRef, splits: &[Rc<PyOper>]) -> bool {
    if splits.is_empty() {
        return false;
    }
    match &*obj.kind.borrow() {
        PyKind::What(chain) =>
            chain.iter().any(|o| splits.iter().any(|s| Rc::ptr_eq(o, s))),
        _ => false,
    }
}

/// Does the subtree below `obj` reach an object currently being rendered?
fn contains_marked(obj: &ObjRef, epoch: u64) -> bool {
    fn walk(obj: &ObjRef, epoch: u64, seen: &mut HashSet<*const PyObj>) -> bool {
        if !seen.insert(Rc::as_ptr(obj)) {
            return false;
        }
        let kind = obj.kind.borrow();
        match &*kind {
            PyKind::Tuple(items) | PyKind::List(items) | PyKind::Set(items) |
            PyKind::FrozenSet(items) | PyKind::Dict(items) => {
                for c in items {
                    if c.recurse.get() == epoch || walk(c, epoch, seen) {
                        return true;
                    }
                }
            }
            PyKind::What(chain) => {
                for oper in chain {
                    for c in oper.stack.borrow().iter() {
                        if c.recurse.get() == epoch || walk(c, epoch, seen) {
                            return true;
                        }
                    }
                }
            }
            _ => {}
        }
        false
    }
    let mut seen = HashSet::new();
    walk(obj, epoch, &mut seen)
}

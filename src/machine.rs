// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The symbolic pickle machine.
//!
//! Pickles are programs for a stack-based VM.  This machine executes them
//! without constructing live values: scalars and containers become `PyObj`
//! graph nodes, while class lookups and calls (GLOBAL, REDUCE, NEWOBJ, BUILD,
//! INST, OBJ) are recorded symbolically as `What` operator chains.
//!
//! MARK handling uses a stack of stacks: MARK saves the current stack on the
//! metastack and starts an empty one, and the closing opcode (TUPLE, LIST,
//! DICT, FROZENSET, APPENDS, ...) drains the current stack and restores the
//! saved one.  This keeps every MARK scope O(1) without sentinel objects on
//! the value stack.
//!
//! Discarded objects go to a popstack instead of being dropped, so partial
//! state stays available for best-effort rendering after a failed run.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use log::{debug, info};

use crate::consts::*;
use crate::dis::{Disassembler, Insn};
use crate::error::{Error, ErrorCode, Result};
use crate::obj::{release_deep, ObjRef, PyKind, PyObj, PyOp, PyOper};

/// Options for a decompilation run.
#[derive(Clone, Debug)]
pub struct DecOptions {
    pub(crate) offset: u64,
    pub(crate) end: Option<u64>,
    pub(crate) break_on_stop: bool,
    pub(crate) verbose: bool,
}

impl Default for DecOptions {
    fn default() -> DecOptions {
        DecOptions { offset: 0, end: None, break_on_stop: true, verbose: false }
    }
}

impl DecOptions {
    pub fn new() -> DecOptions {
        DecOptions::default()
    }

    /// Start interpreting at the given byte offset into the input.
    pub fn offset(mut self, offset: u64) -> DecOptions {
        self.offset = offset;
        self
    }

    /// Stop interpreting before the given byte offset.
    pub fn end(mut self, end: u64) -> DecOptions {
        self.end = Some(end);
        self
    }

    /// Keep interpreting past STOP opcodes (for inputs holding several
    /// pickles back to back).
    pub fn run_past_stop(mut self) -> DecOptions {
        self.break_on_stop = false;
        self
    }

    /// Add debug commentary to the rendered output.
    pub fn verbose(mut self) -> DecOptions {
        self.verbose = true;
        self
    }
}

/// VM state: value stack, metastack, popstack and memo.
pub struct Machine {
    pub(crate) stack: Vec<ObjRef>,
    pub(crate) metastack: Vec<Vec<ObjRef>>,
    pub(crate) popstack: Vec<ObjRef>,
    pub(crate) memo: BTreeMap<u64, ObjRef>,
    /// Epoch counter for cycle-safe traversals; bumped before each one.
    pub(crate) recurse: Cell<u64>,
    start: u64,
    offset: u64,
    end: Option<u64>,
    break_on_stop: bool,
    proto: Option<u8>,
}

impl Machine {
    pub fn new(opts: &DecOptions) -> Machine {
        Machine {
            stack: Vec::with_capacity(128),
            metastack: Vec::with_capacity(16),
            popstack: Vec::new(),
            memo: BTreeMap::new(),
            recurse: Cell::new(0),
            start: opts.offset,
            offset: opts.offset,
            end: opts.end,
            break_on_stop: opts.break_on_stop,
            proto: None,
        }
    }

    /// Runs the machine over `data` until STOP, EOF, the configured end
    /// offset, or the first error.  On error the accumulated state is left in
    /// place for best-effort rendering.
    pub fn run(&mut self, data: &[u8]) -> Result<()> {
        let dis = Disassembler::new(data);
        loop {
            let pos = self.offset as usize;
            if pos >= data.len() {
                break;
            }
            if let Some(end) = self.end {
                if self.offset >= end {
                    break;
                }
            }
            if self.break_on_stop && data[pos] == STOP {
                debug!("[{:#x}] stop", self.offset);
                break;
            }
            let insn = dis.disassemble(self.offset)?;
            debug!("[{:#x}] {}", insn.offset, insn.mnemonic());
            let size = insn.size as u64;
            self.exec(insn)?;
            self.offset += size;
        }
        Ok(())
    }

    pub fn stack(&self) -> &[ObjRef] {
        &self.stack
    }

    pub fn popstack(&self) -> &[ObjRef] {
        &self.popstack
    }

    pub fn metastack(&self) -> &[Vec<ObjRef>] {
        &self.metastack
    }

    pub fn memo(&self) -> &BTreeMap<u64, ObjRef> {
        &self.memo
    }

    /// Protocol version recorded from a PROTO opcode at the start offset.
    pub fn protocol(&self) -> Option<u8> {
        self.proto
    }

    /// Offset of the next opcode (after a run: where it stopped).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn exec(&mut self, insn: Insn) -> Result<()> {
        let Insn { code, arg, .. } = insn;
        match code {
            PROTO => {
                let ver = arg.uint(self.offset)?;
                if self.start != self.offset {
                    info!("op proto at {:#x} not at start of pickle", self.offset);
                } else {
                    self.proto = Some(ver as u8);
                }
            }
            // FRAME only prefetches data in a real unpickler; STOP is
            // handled by the driver loop.
            FRAME | STOP => {}

            MARK => {
                let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                self.metastack.push(stack);
            }
            POP => {
                let obj = self.pop()?;
                self.popstack.push(obj);
            }
            POP_MARK => {
                let prev = match self.metastack.pop() {
                    Some(prev) => prev,
                    None => return Err(self.err(ErrorCode::NoMark)),
                };
                let old = mem::replace(&mut self.stack, prev);
                self.popstack.extend(old);
            }
            DUP => {
                let top = self.top_cloned()?;
                self.stack.push(top);
            }

            NONE => self.push_new(PyKind::None),
            NEWTRUE => self.push_new(PyKind::Bool(true)),
            NEWFALSE => self.push_new(PyKind::Bool(false)),
            BININT | BININT1 | BININT2 => {
                let v = arg.int(self.offset)?;
                self.push_new(PyKind::Int(v));
            }
            LONG1 | LONG4 => {
                let v = arg.big(self.offset)?;
                self.push_new(PyKind::Long(v));
            }
            FLOAT | BINFLOAT => {
                let v = arg.float(self.offset)?;
                self.push_new(PyKind::Float(v));
            }
            STRING | UNICODE | BINSTRING | SHORT_BINSTRING | BINUNICODE |
            SHORT_BINUNICODE | BINUNICODE8 | BINBYTES | SHORT_BINBYTES |
            BINBYTES8 | BYTEARRAY8 => {
                let payload = arg.bytes(self.offset)?;
                self.push_new(PyKind::Str(payload));
            }

            GLOBAL => {
                let (module, name) = arg.pair(self.offset)?;
                self.op_global(module, name);
            }
            STACK_GLOBAL => self.op_stack_global()?,
            REDUCE => self.what_addop(1, PyOp::Reduce)?,
            NEWOBJ => self.what_addop(1, PyOp::NewObj)?,
            BUILD => self.what_addop(1, PyOp::Build)?,
            INST => {
                let (module, name) = arg.pair(self.offset)?;
                self.op_inst(module, name)?;
            }
            OBJ => self.op_obj()?,

            EMPTY_TUPLE => self.push_new(PyKind::Tuple(vec![])),
            TUPLE1 => self.op_tuple_n(1)?,
            TUPLE2 => self.op_tuple_n(2)?,
            TUPLE3 => self.op_tuple_n(3)?,
            EMPTY_LIST => self.push_new(PyKind::List(vec![])),
            EMPTY_DICT => self.push_new(PyKind::Dict(vec![])),
            EMPTY_SET => self.push_new(PyKind::Set(vec![])),
            TUPLE | LIST | DICT | FROZENSET => self.op_collect_mark(code)?,

            APPEND => self.op_append()?,
            APPENDS => self.op_appends(PyOp::Appends, false)?,
            ADDITEMS => self.op_appends(PyOp::AddItems, true)?,
            SETITEM => self.op_setitem()?,
            SETITEMS => self.op_setitems()?,

            MEMOIZE => {
                let loc = self.memo.len() as u64;
                self.memo_put(loc)?;
            }
            BINPUT | LONG_BINPUT => {
                let loc = arg.uint(self.offset)?;
                self.memo_put(loc)?;
            }
            BINGET | LONG_BINGET => {
                let loc = arg.uint(self.offset)?;
                self.memo_get(loc)?;
            }

            // INT, LONG, GET, PUT, PERSID, BINPERSID, EXT*, NEWOBJ_EX and the
            // out-of-band buffer opcodes halt the run; the driver renders
            // whatever state has accumulated.
            _ => return Err(self.err(ErrorCode::Unsupported(code))),
        }
        Ok(())
    }

    fn err(&self, code: ErrorCode) -> Error {
        Error::Eval(code, self.offset)
    }

    fn new_obj(&self, kind: PyKind) -> ObjRef {
        PyObj::new(self.offset, kind)
    }

    fn push_new(&mut self, kind: PyKind) {
        let obj = self.new_obj(kind);
        self.stack.push(obj);
    }

    fn pop(&mut self) -> Result<ObjRef> {
        match self.stack.pop() {
            Some(obj) => Ok(obj),
            None => Err(self.err(ErrorCode::StackUnderflow)),
        }
    }

    fn top_cloned(&self) -> Result<ObjRef> {
        match self.stack.last() {
            Some(obj) => Ok(obj.clone()),
            None => Err(self.err(ErrorCode::StackUnderflow)),
        }
    }

    /// Pops the metastack, making the saved stack current again, and returns
    /// the drained items of the scope that just closed.
    fn drain_mark(&mut self) -> Result<Vec<ObjRef>> {
        match self.metastack.pop() {
            Some(prev) => Ok(mem::replace(&mut self.stack, prev)),
            None => Err(self.err(ErrorCode::NoMark)),
        }
    }

    fn op_collect_mark(&mut self, code: u8) -> Result<()> {
        if code == DICT && self.stack.len() % 2 != 0 {
            return Err(self.err(ErrorCode::OddDictItems));
        }
        let items = self.drain_mark()?;
        let kind = match code {
            TUPLE => PyKind::Tuple(items),
            LIST => PyKind::List(items),
            DICT => PyKind::Dict(items),
            _ => PyKind::FrozenSet(items),
        };
        self.push_new(kind);
        Ok(())
    }

    fn op_tuple_n(&mut self, n: usize) -> Result<()> {
        if self.stack.len() < n {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let items = self.stack.split_off(self.stack.len() - n);
        self.push_new(PyKind::Tuple(items));
        Ok(())
    }

    fn op_append(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let fast = matches!(&*self.stack[self.stack.len() - 2].kind.borrow(), PyKind::List(_));
        if !fast {
            return self.what_addop(1, PyOp::Append);
        }
        let item = self.pop()?;
        let recv = self.top_cloned()?;
        if let PyKind::List(items) = &mut *recv.kind.borrow_mut() {
            items.push(item);
        }
        Ok(())
    }

    fn op_appends(&mut self, op: PyOp, set: bool) -> Result<()> {
        let fast = {
            let parent = match self.metastack.last() {
                Some(parent) => parent,
                None => return Err(self.err(ErrorCode::NoMark)),
            };
            let recv = match parent.last() {
                Some(recv) => recv,
                None => return Err(self.err(ErrorCode::StackUnderflow)),
            };
            let kind = recv.kind.borrow();
            if set { matches!(&*kind, PyKind::Set(_)) } else { matches!(&*kind, PyKind::List(_)) }
        };
        if !fast {
            return self.what_addop_stack(op);
        }
        let items = self.drain_mark()?;
        let recv = self.top_cloned()?;
        match &mut *recv.kind.borrow_mut() {
            PyKind::List(v) | PyKind::Set(v) => v.extend(items),
            _ => {}
        }
        Ok(())
    }

    fn op_setitem(&mut self) -> Result<()> {
        if self.stack.len() < 3 {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let fast = matches!(&*self.stack[self.stack.len() - 3].kind.borrow(), PyKind::Dict(_));
        if !fast {
            return self.what_addop(2, PyOp::SetItem);
        }
        let value = self.pop()?;
        let key = self.pop()?;
        let recv = self.top_cloned()?;
        if let PyKind::Dict(items) = &mut *recv.kind.borrow_mut() {
            items.push(key);
            items.push(value);
        }
        Ok(())
    }

    fn op_setitems(&mut self) -> Result<()> {
        let fast = {
            let parent = match self.metastack.last() {
                Some(parent) => parent,
                None => return Err(self.err(ErrorCode::NoMark)),
            };
            match parent.last() {
                Some(recv) => matches!(&*recv.kind.borrow(), PyKind::Dict(_)),
                None => return Err(self.err(ErrorCode::StackUnderflow)),
            }
        };
        if !fast {
            return self.what_addop_stack(PyOp::SetItems);
        }
        if self.stack.len() % 2 != 0 {
            return Err(self.err(ErrorCode::OddDictItems));
        }
        let items = self.drain_mark()?;
        let recv = self.top_cloned()?;
        if let PyKind::Dict(v) = &mut *recv.kind.borrow_mut() {
            v.extend(items);
        }
        Ok(())
    }

    fn op_global(&mut self, module: Vec<u8>, name: Vec<u8>) {
        let module = self.new_obj(PyKind::Str(module));
        let name = self.new_obj(PyKind::Str(name));
        self.push_new(PyKind::Func { module, name });
    }

    fn op_stack_global(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let name = self.pop()?;
        let module = self.pop()?;
        for obj in [&module, &name] {
            if !matches!(&*obj.kind.borrow(), PyKind::Str(_)) {
                return Err(self.err(ErrorCode::InvalidStackTop("str", obj.type_name().into())));
            }
        }
        self.push_new(PyKind::Func { module, name });
        Ok(())
    }

    fn collect_mark_list(&mut self) -> Result<ObjRef> {
        let items = self.drain_mark()?;
        Ok(self.new_obj(PyKind::List(items)))
    }

    // Like GLOBAL + LIST + REDUCE, but the stack is not set up the usual way.
    fn op_inst(&mut self, module: Vec<u8>, name: Vec<u8>) -> Result<()> {
        let args = self.collect_mark_list()?;
        self.op_global(module, name);
        self.stack.push(args);
        self.what_addop(1, PyOp::Inst)
    }

    // The class is the first object pushed after MARK, the rest become the
    // argument list.
    fn op_obj(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let cls = self.stack.remove(0);
        let args = self.collect_mark_list()?;
        self.stack.push(cls);
        self.stack.push(args);
        self.what_addop(1, PyOp::Obj)
    }

    /// Pops `argc` arguments, promotes the new stack top to a `What` and
    /// appends the recorded operation to its chain.
    fn what_addop(&mut self, argc: usize, op: PyOp) -> Result<()> {
        if self.stack.len() < argc + 1 {
            return Err(self.err(ErrorCode::StackUnderflow));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let what = match stack_top_to_what(&mut self.stack, self.offset) {
            Some(what) => what,
            None => return Err(self.err(ErrorCode::StackUnderflow)),
        };
        let oper = PyOper::new(op, self.offset, args);
        if let PyKind::What(chain) = &mut *what.kind.borrow_mut() {
            chain.push(oper.clone());
        }
        if op == PyOp::Reduce {
            self.split_reduce(&oper);
        }
        Ok(())
    }

    /// APPENDS/SETITEMS/ADDITEMS on an unresolvable receiver: the whole
    /// since-MARK stack becomes the operation's argument list, attached to
    /// the top of the parent stack.
    fn what_addop_stack(&mut self, op: PyOp) -> Result<()> {
        let offset = self.offset;
        let mut parent = match self.metastack.pop() {
            Some(parent) => parent,
            None => return Err(Error::Eval(ErrorCode::NoMark, offset)),
        };
        let what = match stack_top_to_what(&mut parent, offset) {
            Some(what) => what,
            None => {
                self.metastack.push(parent);
                return Err(Error::Eval(ErrorCode::StackUnderflow, offset));
            }
        };
        let args = mem::replace(&mut self.stack, parent);
        let oper = PyOper::new(op, offset, args);
        if let PyKind::What(chain) = &mut *what.kind.borrow_mut() {
            chain.push(oper);
        }
        Ok(())
    }

    /// After REDUCE, mark every mutable container in the argument subtree
    /// with a split owning the reduce operation.  Elements that end up after
    /// the split postdate the construction; the renderer cuts them out of the
    /// container literal and re-applies them as statements.
    fn split_reduce(&mut self, oper: &Rc<PyOper>) {
        let arg = oper.stack.borrow().last().cloned();
        if let Some(arg) = arg {
            let split = self.new_obj(PyKind::Split(oper.clone()));
            self.recurse.set(self.recurse.get() + 1);
            add_splits(&arg, &split, self.recurse.get());
        }
    }

    fn memo_put(&mut self, loc: u64) -> Result<()> {
        let obj = self.top_cloned()?;
        if obj.memo_id.get().is_none() {
            obj.memo_id.set(Some(loc));
        }
        debug!("memo[{}] = {} from {:#x}", loc, obj.type_name(), obj.offset);
        self.memo.insert(loc, obj);
        Ok(())
    }

    fn memo_get(&mut self, loc: u64) -> Result<()> {
        match self.memo.get(&loc) {
            Some(obj) => {
                let obj = obj.clone();
                self.stack.push(obj);
                Ok(())
            }
            None => Err(self.err(ErrorCode::MissingMemo(loc))),
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        // memo references are shared with the stacks, dropping them shallowly
        // cannot leak
        self.memo.clear();
        release_deep(self.stack.drain(..));
        for frame in self.metastack.drain(..) {
            release_deep(frame);
        }
        release_deep(self.popstack.drain(..));
    }
}

/// Turns the top of `stack` into a `What` chain in place, if it isn't one
/// already, and returns it.
fn stack_top_to_what(stack: &mut Vec<ObjRef>, offset: u64) -> Option<ObjRef> {
    let top = stack.last_mut()?;
    if matches!(&*top.kind.borrow(), PyKind::What(_)) {
        return Some(top.clone());
    }
    let init = PyOper::new(PyOp::FakeInit, offset, vec![top.clone()]);
    let what = PyObj::new(offset, PyKind::What(vec![init]));
    *top = what.clone();
    Some(what)
}

fn add_splits(obj: &ObjRef, split: &ObjRef, epoch: u64) {
    // skip previously seen (python allows `a.append(a)`)
    if obj.recurse.get() == epoch {
        return;
    }
    obj.recurse.set(epoch);
    match &mut *obj.kind.borrow_mut() {
        PyKind::List(items) | PyKind::Set(items) | PyKind::FrozenSet(items) |
        PyKind::Dict(items) => {
            for child in items.iter() {
                add_splits(child, split, epoch);
            }
            // no reason to put two splits next to each other
            let tail_split = match items.last() {
                Some(last) => !Rc::ptr_eq(last, obj) &&
                    matches!(&*last.kind.borrow(), PyKind::Split(_)),
                None => false,
            };
            if tail_split {
                items.pop();
            }
            items.push(split.clone());
        }
        // attempting to modify a tuple ends up as a What, so only recurse
        PyKind::Tuple(items) => {
            for child in items.iter() {
                add_splits(child, split, epoch);
            }
        }
        PyKind::What(chain) => {
            for oper in chain.iter() {
                for child in oper.stack.borrow().iter() {
                    add_splits(child, split, epoch);
                }
            }
        }
        _ => {}
    }
}

//! JSON dump of the machine state.
//!
//! The shape is `{"stack": [...], "popstack": [...], "memo": [{"index": n,
//! "value": ...}], "truncated": bool}` with stacks listed top first, plus a
//! `"metastack"` key when MARK scopes were left open (truncated runs).  Every
//! object dumps as `{"offset": n, "type": "...", "value": ...}`; a cycle
//! back-edge dumps as type `"recursion"` and shared objects are duplicated
//! wherever they appear.

use num_traits::ToPrimitive;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::machine::Machine;
use crate::obj::{ObjRef, PyKind, PyOper};

/// Dumps the machine state as a JSON value.
pub fn machine_to_json(machine: &Machine, truncated: bool) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(MachineView::new(machine, truncated))
}

/// Dumps the machine state as a compact JSON string.
pub fn machine_to_string(machine: &Machine, truncated: bool) -> serde_json::Result<String> {
    serde_json::to_string(&MachineView::new(machine, truncated))
}

struct MachineView<'a> {
    machine: &'a Machine,
    truncated: bool,
    epoch: u64,
}

impl<'a> MachineView<'a> {
    fn new(machine: &'a Machine, truncated: bool) -> MachineView<'a> {
        let epoch = machine.recurse.get() + 1;
        machine.recurse.set(epoch);
        MachineView { machine, truncated, epoch }
    }
}

impl Serialize for MachineView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let m = self.machine;
        let mut map = s.serialize_map(None)?;
        map.serialize_entry("stack", &StackView { objs: &m.stack, epoch: self.epoch })?;
        map.serialize_entry("popstack", &StackView { objs: &m.popstack, epoch: self.epoch })?;
        map.serialize_entry("memo", &MemoView { machine: m, epoch: self.epoch })?;
        if !m.metastack.is_empty() {
            map.serialize_entry("metastack", &FramesView { machine: m, epoch: self.epoch })?;
        }
        map.serialize_entry("truncated", &self.truncated)?;
        map.end()
    }
}

/// A stack, dumped top of stack first.
struct StackView<'a> {
    objs: &'a [ObjRef],
    epoch: u64,
}

impl Serialize for StackView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(self.objs.len()))?;
        for obj in self.objs.iter().rev() {
            seq.serialize_element(&ObjView { obj, epoch: self.epoch })?;
        }
        seq.end()
    }
}

/// Container elements, dumped in insertion order.
struct ElemsView<'a> {
    objs: &'a [ObjRef],
    epoch: u64,
}

impl Serialize for ElemsView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(self.objs.len()))?;
        for obj in self.objs {
            seq.serialize_element(&ObjView { obj, epoch: self.epoch })?;
        }
        seq.end()
    }
}

struct FramesView<'a> {
    machine: &'a Machine,
    epoch: u64,
}

impl Serialize for FramesView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let frames = &self.machine.metastack;
        let mut seq = s.serialize_seq(Some(frames.len()))?;
        for frame in frames {
            seq.serialize_element(&StackView { objs: frame, epoch: self.epoch })?;
        }
        seq.end()
    }
}

struct MemoView<'a> {
    machine: &'a Machine,
    epoch: u64,
}

impl Serialize for MemoView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let memo = &self.machine.memo;
        let mut seq = s.serialize_seq(Some(memo.len()))?;
        for (&index, obj) in memo {
            seq.serialize_element(&MemoEntry { index, obj, epoch: self.epoch })?;
        }
        seq.end()
    }
}

struct MemoEntry<'a> {
    index: u64,
    obj: &'a ObjRef,
    epoch: u64,
}

impl Serialize for MemoEntry<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("index", &self.index)?;
        map.serialize_entry("value", &ObjView { obj: self.obj, epoch: self.epoch })?;
        map.end()
    }
}

/// Restores an object's previous epoch mark when the visit ends.
struct Mark<'a> {
    obj: &'a ObjRef,
    prev: u64,
}

impl<'a> Mark<'a> {
    fn set(obj: &'a ObjRef, epoch: u64) -> Mark<'a> {
        let prev = obj.recurse.replace(epoch);
        Mark { obj, prev }
    }
}

impl Drop for Mark<'_> {
    fn drop(&mut self) {
        self.obj.recurse.set(self.prev);
    }
}

struct ObjView<'a> {
    obj: &'a ObjRef,
    epoch: u64,
}

impl Serialize for ObjView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let obj = self.obj;
        if obj.recurse.get() == self.epoch {
            let mut map = s.serialize_map(Some(2))?;
            map.serialize_entry("offset", &obj.offset)?;
            map.serialize_entry("type", "recursion")?;
            return map.end();
        }
        let _mark = Mark::set(obj, self.epoch);
        let kind = obj.kind.borrow();
        let mut map = s.serialize_map(Some(3))?;
        map.serialize_entry("offset", &obj.offset)?;
        map.serialize_entry("type", kind.type_name())?;
        match &*kind {
            PyKind::None | PyKind::Released => map.serialize_entry("value", &())?,
            PyKind::Bool(b) => map.serialize_entry("value", b)?,
            PyKind::Int(i) => map.serialize_entry("value", i)?,
            PyKind::Long(i) => match i.to_i64() {
                Some(v) => map.serialize_entry("value", &v)?,
                None => map.serialize_entry("value", &i.to_string())?,
            },
            PyKind::Float(f) => {
                if f.is_finite() {
                    map.serialize_entry("value", f)?;
                } else {
                    map.serialize_entry("value", &f.to_string())?;
                }
            }
            PyKind::Str(bytes) => map.serialize_entry("value", &String::from_utf8_lossy(bytes))?,
            PyKind::Tuple(items) | PyKind::List(items) | PyKind::Set(items) |
            PyKind::FrozenSet(items) =>
                map.serialize_entry("value", &ElemsView { objs: items, epoch: self.epoch })?,
            PyKind::Dict(items) =>
                map.serialize_entry("value", &PairsView { items, epoch: self.epoch })?,
            PyKind::Func { module, name } =>
                map.serialize_entry("value", &FuncView { module, name })?,
            PyKind::What(chain) =>
                map.serialize_entry("value", &ChainView { chain, epoch: self.epoch })?,
            PyKind::Split(oper) =>
                map.serialize_entry("value", &OperHead { oper: oper.as_ref() })?,
        }
        map.end()
    }
}

/// Dict elements, paired up; split watermarks are not part of any pair.
struct PairsView<'a> {
    items: &'a [ObjRef],
    epoch: u64,
}

impl Serialize for PairsView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(None)?;
        let mut key: Option<&ObjRef> = None;
        for e in self.items {
            if matches!(&*e.kind.borrow(), PyKind::Split(_)) {
                continue;
            }
            match key.take() {
                None => key = Some(e),
                Some(k) => seq.serialize_element(&(
                    ObjView { obj: k, epoch: self.epoch },
                    ObjView { obj: e, epoch: self.epoch },
                ))?,
            }
        }
        seq.end()
    }
}

struct FuncView<'a> {
    module: &'a ObjRef,
    name: &'a ObjRef,
}

impl Serialize for FuncView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let part = |obj: &ObjRef| match &*obj.kind.borrow() {
            PyKind::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => format!("<{}>", other.type_name()),
        };
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("module", &part(self.module))?;
        map.serialize_entry("name", &part(self.name))?;
        map.end()
    }
}

struct ChainView<'a> {
    chain: &'a [std::rc::Rc<PyOper>],
    epoch: u64,
}

impl Serialize for ChainView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(self.chain.len()))?;
        for oper in self.chain {
            seq.serialize_element(&OperView { oper: oper.as_ref(), epoch: self.epoch })?;
        }
        seq.end()
    }
}

struct OperView<'a> {
    oper: &'a PyOper,
    epoch: u64,
}

impl Serialize for OperView<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let args = self.oper.stack.borrow();
        let mut map = s.serialize_map(Some(3))?;
        map.serialize_entry("op", self.oper.op.name())?;
        map.serialize_entry("offset", &self.oper.offset)?;
        map.serialize_entry("args", &ElemsView { objs: &args, epoch: self.epoch })?;
        map.end()
    }
}

/// A split only points back at the reduce operation it belongs to.
struct OperHead<'a> {
    oper: &'a PyOper,
}

impl Serialize for OperHead<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(2))?;
        map.serialize_entry("op", self.oper.op.name())?;
        map.serialize_entry("offset", &self.oper.offset)?;
        map.end()
    }
}

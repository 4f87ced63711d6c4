//! Purpose: In-memory model for values produced by the unpickler.
//! Exports: `PyValue`, `PyObject`, `Shared`, helpers for container access.
//! Role: Loosely typed object graph handed from `core::unpickler` to normalization.
//! Invariants: Mutable containers are shared handles so memo references observe later
//! appends, item sets and `BUILD` state exactly as the stream intends.
//! Invariants: Scalars are plain values; only containers and objects carry identity.
//! Invariants: Dropping a graph never recurses, so arbitrarily deep nesting is safe to free.
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use num_bigint::BigInt;

pub type Shared<T> = Rc<RefCell<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

#[derive(Clone, Debug)]
pub enum PyValue {
    None,
    Bool(bool),
    Int(i64),
    /// Integers outside `i64`, any width.
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    /// Protocol 0-2 `str` payloads whose text encoding is unknown until used.
    LegacyStr(Vec<u8>),
    Tuple(Rc<Vec<PyValue>>),
    List(Shared<Vec<PyValue>>),
    Dict(Shared<Vec<(PyValue, PyValue)>>),
    Set(Shared<Vec<PyValue>>),
    FrozenSet(Rc<Vec<PyValue>>),
    Global(Rc<Global>),
    Object(Shared<PyObject>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Global {
    pub module: String,
    pub name: String,
}

impl Global {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }

    /// Match a name under any of the given modules.
    pub fn is_any(&self, modules: &[&str], name: &str) -> bool {
        self.name == name && modules.iter().any(|module| self.module == *module)
    }
}

/// Result of calling a class or reconstructor: `REDUCE`, `NEWOBJ`, `OBJ`, `INST`.
#[derive(Clone, Debug)]
pub struct PyObject {
    pub callable: PyValue,
    pub args: Vec<PyValue>,
    pub kwargs: Vec<(PyValue, PyValue)>,
    pub state: Option<PyValue>,
    /// Items delivered with `APPEND`/`APPENDS` (list-like reductions).
    pub list_items: Vec<PyValue>,
    /// Items delivered with `SETITEM`/`SETITEMS` (dict-like reductions).
    pub dict_items: Vec<(PyValue, PyValue)>,
}

impl PyObject {
    pub fn new(callable: PyValue, args: Vec<PyValue>) -> Self {
        Self {
            callable,
            args,
            kwargs: Vec::new(),
            state: None,
            list_items: Vec::new(),
            dict_items: Vec::new(),
        }
    }

    pub fn class(&self) -> Option<&Global> {
        match &self.callable {
            PyValue::Global(global) => Some(&**global),
            _ => None,
        }
    }
}

impl PyValue {
    pub fn tuple(items: Vec<PyValue>) -> Self {
        PyValue::Tuple(Rc::new(items))
    }

    pub fn list(items: Vec<PyValue>) -> Self {
        PyValue::List(shared(items))
    }

    pub fn dict(items: Vec<(PyValue, PyValue)>) -> Self {
        PyValue::Dict(shared(items))
    }

    /// Python type name used in diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            PyValue::None => "NoneType".to_string(),
            PyValue::Bool(_) => "bool".to_string(),
            PyValue::Int(_) | PyValue::BigInt(_) => "int".to_string(),
            PyValue::Float(_) => "float".to_string(),
            PyValue::Str(_) | PyValue::LegacyStr(_) => "str".to_string(),
            PyValue::Bytes(_) => "bytes".to_string(),
            PyValue::ByteArray(_) => "bytearray".to_string(),
            PyValue::Tuple(_) => "tuple".to_string(),
            PyValue::List(_) => "list".to_string(),
            PyValue::Dict(_) => "dict".to_string(),
            PyValue::Set(_) => "set".to_string(),
            PyValue::FrozenSet(_) => "frozenset".to_string(),
            PyValue::Global(_) => "type".to_string(),
            PyValue::Object(obj) => match obj.borrow().class() {
                Some(global) => global.name.clone(),
                None => "object".to_string(),
            },
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PyValue::Int(value) => Some(*value),
            PyValue::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PyValue::Bool(value) => Some(*value),
            PyValue::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    /// Text view of `str` values; legacy strings must be ASCII.
    pub fn as_text(&self) -> Option<String> {
        match self {
            PyValue::Str(text) => Some(text.clone()),
            PyValue::LegacyStr(raw) if raw.is_ascii() => {
                Some(String::from_utf8_lossy(raw).into_owned())
            }
            _ => None,
        }
    }

    /// Raw bytes of any bytes-like value.
    pub fn as_byte_buffer(&self) -> Option<Vec<u8>> {
        match self {
            PyValue::Bytes(raw) | PyValue::ByteArray(raw) | PyValue::LegacyStr(raw) => {
                Some(raw.clone())
            }
            _ => None,
        }
    }

    /// Elements of a tuple or list, cloned out of their container.
    pub fn sequence_items(&self) -> Option<Vec<PyValue>> {
        match self {
            PyValue::Tuple(items) => Some(items.as_ref().clone()),
            PyValue::List(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    /// Identity of a container, used for cycle detection.
    pub fn identity(&self) -> Option<usize> {
        match self {
            PyValue::List(items) => Some(Rc::as_ptr(items) as *const () as usize),
            PyValue::Dict(items) => Some(Rc::as_ptr(items) as *const () as usize),
            PyValue::Set(items) => Some(Rc::as_ptr(items) as *const () as usize),
            PyValue::Tuple(items) => Some(Rc::as_ptr(items) as *const () as usize),
            PyValue::Object(obj) => Some(Rc::as_ptr(obj) as *const () as usize),
            _ => None,
        }
    }
}

impl PyValue {
    /// Move the children of a uniquely owned container into `out`, leaving it empty.
    fn take_children(&mut self, out: &mut Vec<PyValue>) {
        match self {
            PyValue::Tuple(items) | PyValue::FrozenSet(items) => {
                if let Some(items) = Rc::get_mut(items) {
                    out.append(items);
                }
            }
            PyValue::List(items) | PyValue::Set(items) => {
                if Rc::strong_count(items) == 1 {
                    out.append(&mut items.borrow_mut());
                }
            }
            PyValue::Dict(items) => {
                if Rc::strong_count(items) == 1 {
                    push_pairs(out, mem::take(&mut *items.borrow_mut()));
                }
            }
            PyValue::Object(obj) => {
                if Rc::strong_count(obj) == 1 {
                    let mut obj = obj.borrow_mut();
                    out.push(mem::replace(&mut obj.callable, PyValue::None));
                    out.append(&mut obj.args);
                    push_pairs(out, mem::take(&mut obj.kwargs));
                    out.extend(obj.state.take());
                    out.append(&mut obj.list_items);
                    push_pairs(out, mem::take(&mut obj.dict_items));
                }
            }
            _ => {}
        }
    }
}

fn push_pairs(out: &mut Vec<PyValue>, pairs: Vec<(PyValue, PyValue)>) {
    out.reserve(pairs.len() * 2);
    for (key, value) in pairs {
        out.push(key);
        out.push(value);
    }
}

impl Drop for PyValue {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_children(&mut pending);
        while let Some(mut value) = pending.pop() {
            value.take_children(&mut pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Global, PyObject, PyValue};

    #[test]
    fn shared_list_mutation_is_visible_through_clones() {
        let list = PyValue::list(Vec::new());
        let alias = list.clone();
        if let PyValue::List(items) = &list {
            items.borrow_mut().push(PyValue::Int(7));
        }
        let items = alias.sequence_items().expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_i64(), Some(7));
        assert_eq!(list.identity(), alias.identity());
    }

    #[test]
    fn object_type_name_comes_from_class() {
        let obj = PyObject::new(
            PyValue::Global(Global::new("numpy", "ndarray").into()),
            Vec::new(),
        );
        let value = PyValue::Object(super::shared(obj));
        assert_eq!(value.type_name(), "ndarray");
    }

    #[test]
    fn legacy_strings_are_text_only_when_ascii() {
        assert_eq!(
            PyValue::LegacyStr(b"abc".to_vec()).as_text().as_deref(),
            Some("abc")
        );
        assert!(PyValue::LegacyStr(vec![0xe9]).as_text().is_none());
    }

    #[test]
    fn deeply_nested_graph_drops_without_recursion() {
        let mut value = PyValue::list(Vec::new());
        for depth in 0..1_000_000 {
            value = if depth % 3 == 0 {
                PyValue::tuple(vec![value])
            } else if depth % 3 == 1 {
                PyValue::dict(vec![(PyValue::None, value)])
            } else {
                PyValue::list(vec![value])
            };
        }
        drop(value);
    }

    #[test]
    fn shared_children_survive_parent_drop() {
        let inner = PyValue::list(vec![PyValue::Int(1)]);
        let outer = PyValue::list(vec![inner.clone()]);
        drop(outer);
        assert_eq!(inner.sequence_items().map(|items| items.len()), Some(1));
    }
}

//! Purpose: Map an unpickled `PyValue` graph onto a `serde_json::Value`.
//! Exports: `NormalizeOptions`, `NonFinite`, `normalize`, `normalize_array`.
//! Role: JSON compatibility layer; mirrors what Python's `json.dump` accepts.
//! Invariants: A top-level ndarray is always flattened; nested arrays only with `deep`.
//! Invariants: Values without a JSON form fail with `ErrorKind::NotSerializable`.
//! Invariants: Mapping order is preserved; dict keys are stringified like `json.dump`.
//! Keys that collide after stringification (`1` and `"1"`) collapse into one entry holding
//! the later value, where `json.dump` would write both.
//! Invariants: Integers of any width keep their exact digits.
use std::collections::HashSet;

use num_bigint::BigInt;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::ndarray::{DType, DTypeKind, Element, NdArray};
use crate::core::value::{PyObject, PyValue};

const MAX_DEPTH: usize = 512;
/// `dict` subclasses that `json.dump` writes as plain objects.
const MAPPING_CLASSES: &[&str] = &["OrderedDict", "Counter", "defaultdict"];

/// How to render NaN and infinities, which JSON cannot express.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum NonFinite {
    #[default]
    Null,
    Error,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct NormalizeOptions {
    /// Convert arrays and NumPy scalars at any depth, not only at the top level.
    pub deep: bool,
    pub non_finite: NonFinite,
}

/// Normalize `value`; a top-level ndarray becomes nested lists.
pub fn normalize(value: &PyValue, options: &NormalizeOptions) -> Result<Value, Error> {
    if let Some(array) = NdArray::from_value(value) {
        return normalize_array(&array?, options);
    }
    Normalizer::new(*options).value(value, 0)
}

/// Flatten an already decoded array, as `normalize` does for a top-level one.
pub fn normalize_array(array: &NdArray, options: &NormalizeOptions) -> Result<Value, Error> {
    debug!(shape = ?array.shape, dtype = ?array.dtype.kind, "flattening top-level array");
    Normalizer::new(*options).array(array, 0)
}

struct Normalizer {
    options: NormalizeOptions,
    ancestors: HashSet<usize>,
}

impl Normalizer {
    fn new(options: NormalizeOptions) -> Self {
        Self {
            options,
            ancestors: HashSet::new(),
        }
    }

    fn value(&mut self, value: &PyValue, depth: usize) -> Result<Value, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::new(ErrorKind::NotSerializable)
                .with_message("maximum recursion depth exceeded"));
        }
        match value {
            PyValue::None => Ok(Value::Null),
            PyValue::Bool(value) => Ok(Value::Bool(*value)),
            PyValue::Int(value) => Ok(Value::from(*value)),
            PyValue::BigInt(value) => big_int(value),
            PyValue::Float(value) => self.float(*value),
            PyValue::Str(text) => Ok(Value::String(text.clone())),
            PyValue::LegacyStr(raw) => legacy_text(raw).map(Value::String),
            PyValue::Tuple(items) => self.guarded(value, |this| this.items(items, depth)),
            PyValue::List(items) => {
                self.guarded(value, |this| this.items(&items.borrow(), depth))
            }
            PyValue::Dict(items) => {
                self.guarded(value, |this| this.mapping(&items.borrow(), depth))
            }
            PyValue::Object(obj) => {
                self.guarded(value, |this| this.object(value, &obj.borrow(), depth))
            }
            other => Err(Error::not_serializable(&other.type_name())),
        }
    }

    /// Run `f` with `value` marked as an ancestor, rejecting reference cycles.
    fn guarded<F>(&mut self, value: &PyValue, f: F) -> Result<Value, Error>
    where
        F: FnOnce(&mut Self) -> Result<Value, Error>,
    {
        let Some(id) = value.identity() else {
            return f(self);
        };
        if !self.ancestors.insert(id) {
            return Err(Error::new(ErrorKind::NotSerializable)
                .with_message("Circular reference detected"));
        }
        let result = f(self);
        self.ancestors.remove(&id);
        result
    }

    fn items(&mut self, items: &[PyValue], depth: usize) -> Result<Value, Error> {
        items
            .iter()
            .map(|item| self.value(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    fn mapping(&mut self, items: &[(PyValue, PyValue)], depth: usize) -> Result<Value, Error> {
        let mut map = Map::with_capacity(items.len());
        for (key, value) in items {
            let key = dict_key(key)?;
            let value = self.value(value, depth + 1)?;
            map.insert(key, value);
        }
        Ok(Value::Object(map))
    }

    fn object(&mut self, value: &PyValue, obj: &PyObject, depth: usize) -> Result<Value, Error> {
        if let Some(array) = NdArray::from_value(value) {
            let array = array?;
            if !self.options.deep {
                return Err(Error::not_serializable("ndarray"));
            }
            return self.array(&array, depth);
        }
        if let Some(scalar) = NdArray::scalar_from_value(value) {
            let scalar = scalar?;
            // float64 scalars subclass Python's float and always serialize.
            let is_float64 = scalar.dtype.kind == DTypeKind::Float && scalar.dtype.item_size == 8;
            if !self.options.deep && !is_float64 {
                return Err(Error::not_serializable(&scalar_type_name(&scalar.dtype)));
            }
            return self.array(&scalar, depth);
        }
        let Some(class) = obj.class() else {
            return Err(Error::not_serializable(&value.type_name()));
        };
        if class.module == "collections" && MAPPING_CLASSES.contains(&class.name.as_str()) {
            // defaultdict's first argument is its factory, not initial content.
            let mut items = match obj.args.first() {
                Some(initial) if class.name != "defaultdict" => initial_items(initial)?,
                _ => Vec::new(),
            };
            items.extend(obj.dict_items.iter().cloned());
            return self.mapping(&items, depth);
        }
        Err(Error::not_serializable(&class.name))
    }

    fn array(&mut self, array: &NdArray, depth: usize) -> Result<Value, Error> {
        array.to_json(|element| match element {
            Element::Bool(value) => Ok(Value::Bool(value)),
            Element::Int(value) => Ok(Value::from(value)),
            Element::UInt(value) => Ok(Value::from(value)),
            Element::Float(value) => self.float(value),
            Element::Text(text) => Ok(Value::String(text)),
            Element::Object(item) => self.value(item, depth + 1),
        })
    }

    fn float(&self, value: f64) -> Result<Value, Error> {
        match Number::from_f64(value) {
            Some(number) => Ok(Value::Number(number)),
            None => match self.options.non_finite {
                NonFinite::Null => Ok(Value::Null),
                NonFinite::Error => Err(Error::new(ErrorKind::NotSerializable).with_message(
                    format!("Out of range float values are not JSON compliant: {value}"),
                )),
            },
        }
    }
}

/// Positional content of a mapping reduction: a dict, or a sequence of pairs.
fn initial_items(initial: &PyValue) -> Result<Vec<(PyValue, PyValue)>, Error> {
    if let PyValue::Dict(items) = initial {
        return Ok(items.borrow().clone());
    }
    let Some(pairs) = initial.sequence_items() else {
        return Err(Error::not_serializable(&initial.type_name()));
    };
    pairs
        .iter()
        .map(|pair| match pair.sequence_items().as_deref() {
            Some([key, value]) => Ok((key.clone(), value.clone())),
            _ => Err(Error::corrupt("mapping items must be pairs")),
        })
        .collect()
}

fn big_int(value: &BigInt) -> Result<Value, Error> {
    let digits = value.to_string();
    digits.parse::<Number>().map(Value::Number).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("integer {digits} has no JSON form"))
            .with_source(err)
    })
}

fn legacy_text(raw: &[u8]) -> Result<String, Error> {
    PyValue::LegacyStr(raw.to_vec()).as_text().ok_or_else(|| {
        Error::unsupported("'ascii' codec can't decode a legacy str payload (non-ASCII bytes)")
    })
}

/// Stringify a dict key the way `json.dump` does.
fn dict_key(key: &PyValue) -> Result<String, Error> {
    match key {
        PyValue::Str(text) => Ok(text.clone()),
        PyValue::LegacyStr(raw) => legacy_text(raw),
        PyValue::Bool(true) => Ok("true".to_string()),
        PyValue::Bool(false) => Ok("false".to_string()),
        PyValue::None => Ok("null".to_string()),
        PyValue::Int(value) => Ok(value.to_string()),
        PyValue::BigInt(value) => Ok(value.to_string()),
        PyValue::Float(value) if value.is_nan() => Ok("NaN".to_string()),
        PyValue::Float(value) if value.is_infinite() => Ok(if *value > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }),
        PyValue::Float(value) => Ok(Number::from_f64(*value)
            .map(|number| number.to_string())
            .unwrap_or_default()),
        other => Err(Error::new(ErrorKind::NotSerializable).with_message(format!(
            "keys must be str, int, float, bool or None, not {}",
            other.type_name()
        ))),
    }
}

fn scalar_type_name(dtype: &DType) -> String {
    let bits = dtype.item_size * 8;
    match dtype.kind {
        DTypeKind::Bool => "bool".to_string(),
        DTypeKind::Int => format!("int{bits}"),
        DTypeKind::UInt => format!("uint{bits}"),
        DTypeKind::Float => format!("float{bits}"),
        DTypeKind::Complex => format!("complex{bits}"),
        DTypeKind::Unicode => "str_".to_string(),
        DTypeKind::Bytes => "bytes_".to_string(),
        DTypeKind::Object => "object_".to_string(),
        DTypeKind::DateTime => "datetime64".to_string(),
        DTypeKind::TimeDelta => "timedelta64".to_string(),
        DTypeKind::Void => "void".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{NonFinite, NormalizeOptions, normalize};
    use crate::core::error::ErrorKind;
    use crate::core::value::{Global, PyObject, PyValue, shared};
    use num_bigint::BigInt;
    use serde_json::json;

    fn text(value: &str) -> PyValue {
        PyValue::Str(value.to_string())
    }

    #[test]
    fn plain_mapping_passes_through() {
        let value = PyValue::dict(vec![
            (text("b"), PyValue::Int(1)),
            (text("a"), PyValue::tuple(vec![PyValue::Float(1.5), PyValue::None])),
        ]);
        let json = normalize(&value, &NormalizeOptions::default()).unwrap();
        assert_eq!(json, json!({"b": 1, "a": [1.5, null]}));
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn non_string_keys_are_stringified() {
        let value = PyValue::dict(vec![
            (PyValue::Int(1), PyValue::Bool(true)),
            (PyValue::Bool(false), PyValue::Int(2)),
            (PyValue::None, PyValue::Int(3)),
            (PyValue::Float(2.5), PyValue::Int(4)),
        ]);
        let json = normalize(&value, &NormalizeOptions::default()).unwrap();
        assert_eq!(json, json!({"1": true, "false": 2, "null": 3, "2.5": 4}));
    }

    #[test]
    fn colliding_keys_keep_later_value() {
        let value = PyValue::dict(vec![
            (PyValue::Int(1), text("int")),
            (text("z"), PyValue::None),
            (text("1"), text("str")),
        ]);
        let json = normalize(&value, &NormalizeOptions::default()).unwrap();
        let map = json.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["1"], json!("str"));
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, ["1", "z"]);
    }

    #[test]
    fn tuple_keys_are_rejected() {
        let value = PyValue::dict(vec![(PyValue::tuple(Vec::new()), PyValue::None)]);
        let err = normalize(&value, &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSerializable);
        assert!(err.to_string().contains("keys must be str"));
    }

    #[test]
    fn sets_and_bytes_are_not_serializable() {
        let set = PyValue::Set(shared(vec![PyValue::Int(1)]));
        let err = normalize(&set, &NormalizeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Object of type set is not JSON serializable"));

        let bytes = PyValue::list(vec![PyValue::Bytes(vec![1])]);
        let err = normalize(&bytes, &NormalizeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("bytes"));
    }

    #[test]
    fn custom_objects_are_not_serializable() {
        let obj = PyObject::new(
            PyValue::Global(Global::new("__main__", "Histogram").into()),
            Vec::new(),
        );
        let err = normalize(&PyValue::Object(shared(obj)), &NormalizeOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSerializable);
        assert!(err.to_string().contains("Histogram"));
    }

    #[test]
    fn cycles_are_detected() {
        let list = PyValue::list(Vec::new());
        if let PyValue::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        let err = normalize(&list, &NormalizeOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Circular reference detected"));
    }

    #[test]
    fn shared_siblings_are_not_cycles() {
        let inner = PyValue::list(vec![PyValue::Int(1)]);
        let outer = PyValue::list(vec![inner.clone(), inner]);
        let json = normalize(&outer, &NormalizeOptions::default()).unwrap();
        assert_eq!(json, json!([[1], [1]]));
    }

    #[test]
    fn non_finite_policy() {
        let value = PyValue::list(vec![PyValue::Float(f64::NAN)]);
        let json = normalize(&value, &NormalizeOptions::default()).unwrap();
        assert_eq!(json, json!([null]));

        let strict = NormalizeOptions {
            non_finite: NonFinite::Error,
            ..NormalizeOptions::default()
        };
        let err = normalize(&value, &strict).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSerializable);
    }

    #[test]
    fn ordered_dict_reduction_becomes_mapping() {
        let mut obj = PyObject::new(
            PyValue::Global(Global::new("collections", "OrderedDict").into()),
            Vec::new(),
        );
        obj.dict_items.push((text("z"), PyValue::Int(1)));
        obj.dict_items.push((text("a"), PyValue::Int(2)));
        let json = normalize(&PyValue::Object(shared(obj)), &NormalizeOptions::default()).unwrap();
        assert_eq!(json.to_string(), r#"{"z":1,"a":2}"#);
    }

    #[test]
    fn counter_and_defaultdict_become_mappings() {
        let counter = PyObject::new(
            PyValue::Global(Global::new("collections", "Counter").into()),
            vec![PyValue::dict(vec![(text("x"), PyValue::Int(2))])],
        );
        let json = normalize(&PyValue::Object(shared(counter)), &NormalizeOptions::default());
        assert_eq!(json.unwrap(), json!({"x": 2}));

        let mut default = PyObject::new(
            PyValue::Global(Global::new("collections", "defaultdict").into()),
            vec![PyValue::Global(Global::new("builtins", "int").into())],
        );
        default.dict_items.push((text("y"), PyValue::Int(3)));
        let json = normalize(&PyValue::Object(shared(default)), &NormalizeOptions::default());
        assert_eq!(json.unwrap(), json!({"y": 3}));
    }

    #[test]
    fn wide_integers_keep_exact_digits() {
        let big = PyValue::BigInt(BigInt::from(u64::MAX) + 1u8);
        let value = PyValue::dict(vec![(big.clone(), big)]);
        let json = normalize(&value, &NormalizeOptions::default()).unwrap();
        assert_eq!(
            json.to_string(),
            r#"{"18446744073709551616":18446744073709551616}"#
        );
    }

    #[test]
    fn nesting_beyond_limit_is_rejected() {
        let mut value = PyValue::list(Vec::new());
        for _ in 0..1000 {
            value = PyValue::list(vec![value]);
        }
        let err = normalize(&value, &NormalizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSerializable);
        assert!(err.to_string().contains("maximum recursion depth exceeded"));
    }

    #[test]
    fn non_ascii_legacy_strings_fail() {
        let err = normalize(&PyValue::LegacyStr(vec![0xe9]), &NormalizeOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}

//! Purpose: Recognize NumPy arrays, dtypes and scalars inside an unpickled graph.
//! Exports: `DType`, `DTypeKind`, `ByteOrder`, `NdArray`, `ArrayData`, `Element`.
//! Role: Turns `PyObject` reconstructions into typed arrays and flattens them row-major.
//! Invariants: Shapes and buffer sizes are validated before any element is decoded.
//! Invariants: Output nesting follows logical (C) index order even for Fortran buffers.
//! Notes: Covers the `_reconstruct` + `BUILD` path (all protocols) and the protocol 5
//! `_frombuffer` path; scalars are modeled as 0-d arrays.
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::{PyObject, PyValue};

const MULTIARRAY_MODULES: &[&str] = &["numpy.core.multiarray", "numpy._core.multiarray"];
const NUMERIC_MODULES: &[&str] = &["numpy.core.numeric", "numpy._core.numeric"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DTypeKind {
    Bool,
    Int,
    UInt,
    Float,
    Complex,
    Unicode,
    Bytes,
    Object,
    DateTime,
    TimeDelta,
    Void,
}

impl DTypeKind {
    fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'b' | '?' => DTypeKind::Bool,
            'i' => DTypeKind::Int,
            'u' => DTypeKind::UInt,
            'f' => DTypeKind::Float,
            'c' => DTypeKind::Complex,
            'U' => DTypeKind::Unicode,
            'S' => DTypeKind::Bytes,
            'O' => DTypeKind::Object,
            'M' => DTypeKind::DateTime,
            'm' => DTypeKind::TimeDelta,
            'V' => DTypeKind::Void,
            _ => return None,
        })
    }

    /// Python type `tolist()` produces for element kinds without a JSON form.
    fn python_type(self) -> Option<&'static str> {
        match self {
            DTypeKind::Complex => Some("complex"),
            DTypeKind::Bytes => Some("bytes"),
            DTypeKind::DateTime => Some("datetime64"),
            DTypeKind::TimeDelta => Some("timedelta64"),
            DTypeKind::Void => Some("void"),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    Little,
    Big,
    NotApplicable,
}

impl ByteOrder {
    fn from_marker(marker: &str) -> Result<Self, Error> {
        match marker {
            "<" => Ok(ByteOrder::Little),
            ">" => Ok(ByteOrder::Big),
            "|" => Ok(ByteOrder::NotApplicable),
            "=" if cfg!(target_endian = "big") => Ok(ByteOrder::Big),
            "=" => Ok(ByteOrder::Little),
            other => Err(Error::corrupt(format!("invalid dtype byte order {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DType {
    pub kind: DTypeKind,
    pub item_size: usize,
    pub byte_order: ByteOrder,
}

impl DType {
    /// Parse a type string such as `f8`, `<i4` or `U12`.
    pub fn parse(descr: &str) -> Result<Self, Error> {
        let (byte_order, rest) = match descr.chars().next() {
            Some(marker @ ('<' | '>' | '|' | '=')) => {
                (ByteOrder::from_marker(&marker.to_string())?, &descr[1..])
            }
            _ => (ByteOrder::Little, descr),
        };
        let mut chars = rest.chars();
        let kind = chars
            .next()
            .and_then(DTypeKind::from_code)
            .ok_or_else(|| Error::unsupported(format!("unsupported dtype {descr:?}")))?;
        let digits = chars.as_str();
        let digits = digits.split('[').next().unwrap_or(digits);
        let item_size = if digits.is_empty() {
            default_item_size(kind)
        } else {
            digits.parse::<usize>().map_err(|err| {
                Error::corrupt(format!("invalid dtype size in {descr:?}")).with_source(err)
            })?
        };
        let byte_order = if item_size <= 1 || matches!(kind, DTypeKind::Object | DTypeKind::Void) {
            ByteOrder::NotApplicable
        } else {
            byte_order
        };
        Ok(Self {
            kind,
            item_size,
            byte_order,
        })
    }

    /// Rebuild a dtype from its `numpy.dtype` reduction and `BUILD` state.
    pub fn from_value(value: &PyValue) -> Result<Self, Error> {
        let PyValue::Object(obj) = value else {
            return Err(Error::corrupt(format!(
                "expected numpy.dtype, found {}",
                value.type_name()
            )));
        };
        let obj = obj.borrow();
        if !obj.class().is_some_and(|class| class.is("numpy", "dtype")) {
            return Err(Error::corrupt(format!(
                "expected numpy.dtype, found {}",
                value.type_name()
            )));
        }
        let descr = obj
            .args
            .first()
            .and_then(PyValue::as_text)
            .ok_or_else(|| Error::corrupt("numpy.dtype reduction without a type string"))?;
        let mut dtype = DType::parse(&descr)?;
        if let Some(state) = obj.state.as_ref().and_then(PyValue::sequence_items) {
            dtype.apply_state(&state)?;
        }
        Ok(dtype)
    }

    /// `(version, byteorder, subarray, names, fields, elsize, alignment, flags, ...)`
    fn apply_state(&mut self, state: &[PyValue]) -> Result<(), Error> {
        let field = |idx: usize| state.get(idx).filter(|value| !matches!(value, PyValue::None));
        if let Some(marker) = field(1).and_then(PyValue::as_text) {
            let order = ByteOrder::from_marker(&marker)?;
            if self.item_size > 1 && !matches!(self.kind, DTypeKind::Object | DTypeKind::Void) {
                self.byte_order = order;
            }
        }
        if field(2).is_some() {
            return Err(Error::unsupported("sub-array dtypes are not supported"));
        }
        if field(3).is_some() {
            return Err(Error::unsupported("structured dtypes are not supported"));
        }
        if let Some(elsize) = field(5).and_then(PyValue::as_i64).filter(|size| *size > 0) {
            self.item_size = usize::try_from(elsize)
                .map_err(|_| Error::corrupt("dtype element size out of range"))?;
        }
        Ok(())
    }
}

fn default_item_size(kind: DTypeKind) -> usize {
    match kind {
        DTypeKind::Bool => 1,
        DTypeKind::Object => 8,
        DTypeKind::Complex => 16,
        DTypeKind::Unicode | DTypeKind::Bytes | DTypeKind::Void => 0,
        _ => 8,
    }
}

#[derive(Clone, Debug)]
pub enum ArrayData {
    /// Packed element bytes in the array's memory order.
    Raw(Vec<u8>),
    /// Object arrays pickle a flat list in logical (C) order.
    Objects(Vec<PyValue>),
}

/// One decoded element, handed to the caller for JSON mapping.
#[derive(Debug)]
pub enum Element<'a> {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Object(&'a PyValue),
}

#[derive(Clone, Debug)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub fortran_order: bool,
    pub data: ArrayData,
}

impl NdArray {
    /// `Some` when `value` is an ndarray reconstruction; the inner result reports
    /// a malformed one.
    pub fn from_value(value: &PyValue) -> Option<Result<Self, Error>> {
        let PyValue::Object(obj) = value else {
            return None;
        };
        let obj = obj.borrow();
        let class = obj.class()?;
        if class.is_any(MULTIARRAY_MODULES, "_reconstruct") {
            Some(from_reconstruct(&obj))
        } else if class.is_any(NUMERIC_MODULES, "_frombuffer") {
            Some(from_frombuffer(&obj))
        } else {
            None
        }
    }

    /// `Some` when `value` is a `numpy` scalar (`multiarray.scalar`), as a 0-d array.
    pub fn scalar_from_value(value: &PyValue) -> Option<Result<Self, Error>> {
        let PyValue::Object(obj) = value else {
            return None;
        };
        let obj = obj.borrow();
        if !obj.class()?.is_any(MULTIARRAY_MODULES, "scalar") {
            return None;
        }
        Some(from_scalar(&obj))
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nested row-major rendering (`ndarray.tolist()`); 0-d arrays yield the scalar.
    pub fn to_json<F>(&self, mut convert: F) -> Result<Value, Error>
    where
        F: FnMut(Element<'_>) -> Result<Value, Error>,
    {
        if let Some(type_name) = self.dtype.kind.python_type() {
            if !self.is_empty() {
                return Err(Error::not_serializable(type_name));
            }
        }
        let strides = self.element_strides();
        self.build(0, 0, &strides, &mut convert)
    }

    fn element_strides(&self) -> Vec<usize> {
        let fortran = self.fortran_order && matches!(self.data, ArrayData::Raw(_));
        let mut strides = vec![1usize; self.shape.len()];
        if fortran {
            for dim in 1..self.shape.len() {
                strides[dim] = strides[dim - 1] * self.shape[dim - 1];
            }
        } else {
            for dim in (0..self.shape.len().saturating_sub(1)).rev() {
                strides[dim] = strides[dim + 1] * self.shape[dim + 1];
            }
        }
        strides
    }

    fn build<F>(
        &self,
        dim: usize,
        index: usize,
        strides: &[usize],
        convert: &mut F,
    ) -> Result<Value, Error>
    where
        F: FnMut(Element<'_>) -> Result<Value, Error>,
    {
        if dim == self.shape.len() {
            return convert(self.element(index)?);
        }
        let mut items = Vec::with_capacity(self.shape[dim]);
        for i in 0..self.shape[dim] {
            items.push(self.build(dim + 1, index + i * strides[dim], strides, convert)?);
        }
        Ok(Value::Array(items))
    }

    fn element(&self, index: usize) -> Result<Element<'_>, Error> {
        let raw = match &self.data {
            ArrayData::Objects(items) => {
                return items.get(index).map(Element::Object).ok_or_else(out_of_bounds);
            }
            ArrayData::Raw(raw) => raw,
        };
        let size = self.dtype.item_size;
        let start = index * size;
        let bytes = raw.get(start..start + size).ok_or_else(out_of_bounds)?;
        decode_element(&self.dtype, bytes)
    }
}

fn out_of_bounds() -> Error {
    Error::new(ErrorKind::Internal).with_message("element index out of bounds")
}

fn decode_element<'a>(dtype: &DType, bytes: &[u8]) -> Result<Element<'a>, Error> {
    let big = dtype.byte_order == ByteOrder::Big;
    let element = match (dtype.kind, dtype.item_size) {
        (DTypeKind::Bool, 1) => Element::Bool(bytes[0] != 0),
        (DTypeKind::Int, size @ (1 | 2 | 4 | 8)) => {
            let unsigned = read_uint(bytes, big);
            let shift = 64 - 8 * size as u32;
            Element::Int(((unsigned << shift) as i64) >> shift)
        }
        (DTypeKind::UInt, 1 | 2 | 4 | 8) => Element::UInt(read_uint(bytes, big)),
        (DTypeKind::Float, 2) => Element::Float(f16_to_f64(read_uint(bytes, big) as u16)),
        (DTypeKind::Float, 4) => {
            Element::Float(f64::from(f32::from_bits(read_uint(bytes, big) as u32)))
        }
        (DTypeKind::Float, 8) => Element::Float(f64::from_bits(read_uint(bytes, big))),
        (DTypeKind::Unicode, size) if size % 4 == 0 => Element::Text(decode_ucs4(bytes, big)?),
        (kind, size) => {
            return Err(Error::unsupported(format!(
                "unsupported element type {kind:?} of {size} bytes"
            )));
        }
    };
    Ok(element)
}

fn read_uint(bytes: &[u8], big: bool) -> u64 {
    let fold = |acc: u64, byte: &u8| (acc << 8) | u64::from(*byte);
    if big {
        bytes.iter().fold(0, fold)
    } else {
        bytes.iter().rev().fold(0, fold)
    }
}

/// IEEE 754 binary16 to binary64.
fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x3ff);
    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}

fn decode_ucs4(bytes: &[u8], big: bool) -> Result<String, Error> {
    let mut out = String::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let code = read_uint(chunk, big) as u32;
        let ch = char::from_u32(code)
            .ok_or_else(|| Error::corrupt(format!("invalid code point U+{code:X} in str array")))?;
        out.push(ch);
    }
    let trimmed = out.trim_end_matches('\0').len();
    out.truncate(trimmed);
    Ok(out)
}

fn from_reconstruct(obj: &PyObject) -> Result<NdArray, Error> {
    let state = obj
        .state
        .as_ref()
        .and_then(PyValue::sequence_items)
        .ok_or_else(|| Error::corrupt("ndarray reconstruction without array state"))?;
    // Versioned state carries a leading int; the legacy form does not.
    let fields = match state.as_slice() {
        [PyValue::Int(_), rest @ ..] if rest.len() == 4 => rest.to_vec(),
        fields if fields.len() == 4 => fields.to_vec(),
        _ => {
            return Err(Error::corrupt(format!(
                "ndarray state has {} fields, expected 4 or 5",
                state.len()
            )));
        }
    };
    let shape = parse_shape(&fields[0])?;
    let dtype = DType::from_value(&fields[1])?;
    let fortran_order = fields[2]
        .as_bool()
        .ok_or_else(|| Error::corrupt("ndarray fortran flag must be a bool"))?;
    let data = array_data(&fields[3], &dtype)?;
    NdArray {
        shape,
        dtype,
        fortran_order,
        data,
    }
    .validated()
}

fn from_frombuffer(obj: &PyObject) -> Result<NdArray, Error> {
    let [buffer, dtype, shape, order] = obj.args.as_slice() else {
        return Err(Error::corrupt("_frombuffer expects (buffer, dtype, shape, order)"));
    };
    let dtype = DType::from_value(dtype)?;
    let raw = buffer
        .as_byte_buffer()
        .ok_or_else(|| Error::corrupt("_frombuffer buffer must be bytes-like"))?;
    let fortran_order = order.as_text().is_some_and(|order| order == "F");
    NdArray {
        shape: parse_shape(shape)?,
        dtype,
        fortran_order,
        data: ArrayData::Raw(raw),
    }
    .validated()
}

fn from_scalar(obj: &PyObject) -> Result<NdArray, Error> {
    let [dtype, payload, ..] = obj.args.as_slice() else {
        return Err(Error::corrupt("numpy scalar expects (dtype, data)"));
    };
    let dtype = DType::from_value(dtype)?;
    let data = if dtype.kind == DTypeKind::Object {
        ArrayData::Objects(vec![payload.clone()])
    } else {
        ArrayData::Raw(
            payload
                .as_byte_buffer()
                .ok_or_else(|| Error::corrupt("numpy scalar payload must be bytes"))?,
        )
    };
    NdArray {
        shape: Vec::new(),
        dtype,
        fortran_order: false,
        data,
    }
    .validated()
}

fn array_data(value: &PyValue, dtype: &DType) -> Result<ArrayData, Error> {
    if dtype.kind == DTypeKind::Object {
        return value
            .sequence_items()
            .map(ArrayData::Objects)
            .ok_or_else(|| Error::corrupt("object array data must be a list"));
    }
    value
        .as_byte_buffer()
        .map(ArrayData::Raw)
        .ok_or_else(|| {
            Error::corrupt(format!("array data must be bytes, found {}", value.type_name()))
        })
}

fn parse_shape(value: &PyValue) -> Result<Vec<usize>, Error> {
    let items = value
        .sequence_items()
        .ok_or_else(|| Error::corrupt("array shape must be a tuple"))?;
    items
        .iter()
        .map(|dim| {
            dim.as_i64()
                .and_then(|dim| usize::try_from(dim).ok())
                .ok_or_else(|| Error::corrupt("array dimensions must be non-negative ints"))
        })
        .collect()
}

impl NdArray {
    fn validated(self) -> Result<Self, Error> {
        let count = self
            .shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| Error::corrupt("array size overflows"))?;
        let actual = match &self.data {
            ArrayData::Objects(items) => items.len(),
            ArrayData::Raw(raw) if self.dtype.item_size == 0 => {
                if raw.is_empty() { count } else { usize::MAX }
            }
            ArrayData::Raw(raw) => {
                if raw.len() % self.dtype.item_size != 0 {
                    usize::MAX
                } else {
                    raw.len() / self.dtype.item_size
                }
            }
        };
        if actual != count {
            return Err(Error::corrupt(format!(
                "buffer size does not match array size (expected {count} elements)"
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{ArrayData, ByteOrder, DType, DTypeKind, Element, NdArray, f16_to_f64};
    use crate::core::error::ErrorKind;
    use serde_json::{Value, json};

    fn identity(element: Element<'_>) -> Result<Value, crate::core::error::Error> {
        Ok(match element {
            Element::Bool(value) => json!(value),
            Element::Int(value) => json!(value),
            Element::UInt(value) => json!(value),
            Element::Float(value) => json!(value),
            Element::Text(value) => json!(value),
            Element::Object(_) => Value::Null,
        })
    }

    fn array(descr: &str, shape: &[usize], fortran: bool, raw: Vec<u8>) -> NdArray {
        NdArray {
            shape: shape.to_vec(),
            dtype: DType::parse(descr).unwrap(),
            fortran_order: fortran,
            data: ArrayData::Raw(raw),
        }
        .validated()
        .unwrap()
    }

    #[test]
    fn parses_type_strings() {
        let dtype = DType::parse(">i4").unwrap();
        assert_eq!(dtype.kind, DTypeKind::Int);
        assert_eq!(dtype.item_size, 4);
        assert_eq!(dtype.byte_order, ByteOrder::Big);

        let dtype = DType::parse("b1").unwrap();
        assert_eq!(dtype.kind, DTypeKind::Bool);
        assert_eq!(dtype.byte_order, ByteOrder::NotApplicable);

        assert_eq!(DType::parse("U12").unwrap().item_size, 12);
        assert_eq!(DType::parse("z8").unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn row_major_int_matrix() {
        let raw: Vec<u8> = (1i32..=6).flat_map(|v| v.to_le_bytes()).collect();
        let arr = array("<i4", &[2, 3], false, raw);
        assert_eq!(arr.to_json(identity).unwrap(), json!([[1, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn fortran_buffer_is_reindexed() {
        // logical [[1, 2, 3], [4, 5, 6]] stored column-major
        let raw: Vec<u8> = [1i16, 4, 2, 5, 3, 6]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let arr = array("<i2", &[2, 3], true, raw);
        assert_eq!(arr.to_json(identity).unwrap(), json!([[1, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn big_endian_floats_and_negative_ints() {
        let raw: Vec<u8> = [1.5f64, -2.25].iter().flat_map(|v| v.to_be_bytes()).collect();
        assert_eq!(
            array(">f8", &[2], false, raw).to_json(identity).unwrap(),
            json!([1.5, -2.25])
        );
        let arr = array("|i1", &[2], false, vec![0xff, 0x80]);
        assert_eq!(arr.to_json(identity).unwrap(), json!([-1, -128]));
    }

    #[test]
    fn empty_and_zero_dimensional_arrays() {
        assert_eq!(array("<f8", &[0], false, Vec::new()).to_json(identity).unwrap(), json!([]));
        assert_eq!(
            array("<f8", &[2, 0], false, Vec::new()).to_json(identity).unwrap(),
            json!([[], []])
        );
        let scalar = array("<u2", &[], false, vec![0x34, 0x12]);
        assert_eq!(scalar.to_json(identity).unwrap(), json!(0x1234));
    }

    #[test]
    fn unicode_elements_strip_padding() {
        let mut raw = Vec::new();
        for ch in ['h', 'i', '\0'] {
            raw.extend_from_slice(&(ch as u32).to_le_bytes());
        }
        let arr = array("<U12", &[1], false, raw);
        assert_eq!(arr.to_json(identity).unwrap(), json!(["hi"]));
    }

    #[test]
    fn complex_arrays_are_not_serializable() {
        let arr = array("<c16", &[1], false, vec![0u8; 16]);
        let err = arr.to_json(identity).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSerializable);
        assert!(err.to_string().contains("complex"));
    }

    #[test]
    fn buffer_size_mismatch_is_corrupt() {
        let err = NdArray {
            shape: vec![3],
            dtype: DType::parse("<f4").unwrap(),
            fortran_order: false,
            data: ArrayData::Raw(vec![0u8; 8]),
        }
        .validated()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn half_precision_values() {
        assert_eq!(f16_to_f64(0x3c00), 1.0);
        assert_eq!(f16_to_f64(0xc000), -2.0);
        assert_eq!(f16_to_f64(0x0001), 2f64.powi(-24));
        assert!(f16_to_f64(0x7c00).is_infinite());
    }
}

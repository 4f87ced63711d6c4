//! Purpose: Execute a pickle opcode stream into a `PyValue` object graph.
//! Exports: `Unpickler`, `unpickle`.
//! Role: Binary decoding boundary; everything downstream works on `PyValue`.
//! Invariants: Protocols 0 through 5 are accepted; decoding stops at the first `STOP`.
//! Invariants: No code is executed; callables become `PyObject` records except for the
//! small set of builtin reconstructors that produce plain data (bytes, sets).
//! Invariants: Every failure carries the byte offset of the offending opcode.
use std::collections::HashMap;

use num_bigint::BigInt;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::opcodes as op;
use crate::core::reader::ByteReader;
use crate::core::value::{Global, PyObject, PyValue, shared};

/// Decode a complete pickle held in memory.
pub fn unpickle(bytes: &[u8]) -> Result<PyValue, Error> {
    Unpickler::new(bytes).load()
}

pub struct Unpickler<'a> {
    reader: ByteReader<'a>,
    stack: Vec<PyValue>,
    metastack: Vec<Vec<PyValue>>,
    memo: HashMap<u64, PyValue>,
    protocol: u8,
}

impl<'a> Unpickler<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            reader: ByteReader::new(bytes),
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
            protocol: 0,
        }
    }

    pub fn load(mut self) -> Result<PyValue, Error> {
        if self.reader.is_empty() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("pickle data was truncated (empty input)"));
        }
        loop {
            let at = self.reader.position() as u64;
            let opcode = self.reader.read_u8()?;
            if opcode == op::STOP {
                let value = self.pop().map_err(|err| err.with_offset(at))?;
                debug!(
                    protocol = self.protocol,
                    memo = self.memo.len(),
                    trailing = !self.reader.is_empty(),
                    "pickle decoded"
                );
                return Ok(value);
            }
            self.dispatch(opcode).map_err(|err| {
                if err.offset().is_some() {
                    err
                } else {
                    err.with_offset(at)
                }
            })?;
        }
    }

    fn dispatch(&mut self, opcode: u8) -> Result<(), Error> {
        match opcode {
            op::PROTO => {
                let proto = self.reader.read_u8()?;
                if proto > op::HIGHEST_PROTOCOL {
                    return Err(Error::unsupported(format!(
                        "unsupported pickle protocol: {proto}"
                    )));
                }
                self.protocol = proto;
            }
            op::FRAME => {
                self.reader.read_u64_le()?;
            }
            op::MARK => {
                let current = std::mem::take(&mut self.stack);
                self.metastack.push(current);
            }
            op::POP => {
                if self.stack.pop().is_none() {
                    self.pop_mark()?;
                }
            }
            op::POP_MARK => {
                self.pop_mark()?;
            }
            op::DUP => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }

            op::NONE => self.stack.push(PyValue::None),
            op::NEWTRUE => self.stack.push(PyValue::Bool(true)),
            op::NEWFALSE => self.stack.push(PyValue::Bool(false)),
            op::INT => {
                let line = self.reader.read_text_line()?;
                let value = match line {
                    "01" => PyValue::Bool(true),
                    "00" => PyValue::Bool(false),
                    _ => parse_int(line)?,
                };
                self.stack.push(value);
            }
            op::LONG => {
                let line = self.reader.read_text_line()?;
                let line = line.strip_suffix('L').unwrap_or(line);
                self.stack.push(parse_int(line)?);
            }
            op::BININT => {
                let value = self.reader.read_i32_le()?;
                self.stack.push(PyValue::Int(i64::from(value)));
            }
            op::BININT1 => {
                let value = self.reader.read_u8()?;
                self.stack.push(PyValue::Int(i64::from(value)));
            }
            op::BININT2 => {
                let value = self.reader.read_u16_le()?;
                self.stack.push(PyValue::Int(i64::from(value)));
            }
            op::LONG1 => {
                let len = self.reader.read_len(1)?;
                let raw = self.reader.read_bytes(len)?;
                self.stack.push(decode_long(raw));
            }
            op::LONG4 => {
                let len = self.reader.read_len(4)?;
                let raw = self.reader.read_bytes(len)?;
                self.stack.push(decode_long(raw));
            }
            op::FLOAT => {
                let line = self.reader.read_text_line()?;
                let value = line.trim().parse::<f64>().map_err(|err| {
                    Error::corrupt(format!("invalid float literal {line:?}")).with_source(err)
                })?;
                self.stack.push(PyValue::Float(value));
            }
            op::BINFLOAT => {
                let value = self.reader.read_f64_be()?;
                self.stack.push(PyValue::Float(value));
            }

            op::STRING => {
                let line = self.reader.read_line()?;
                self.stack.push(PyValue::LegacyStr(unquote_string(line)?));
            }
            op::BINSTRING => {
                let len = self.reader.read_i32_le()?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::corrupt("BINSTRING pickle has negative byte count"))?;
                let raw = self.reader.read_bytes(len)?;
                self.stack.push(PyValue::LegacyStr(raw.to_vec()));
            }
            op::SHORT_BINSTRING => {
                let len = self.reader.read_len(1)?;
                let raw = self.reader.read_bytes(len)?;
                self.stack.push(PyValue::LegacyStr(raw.to_vec()));
            }
            op::UNICODE => {
                let line = self.reader.read_line()?;
                self.stack.push(PyValue::Str(decode_raw_unicode_escape(line)?));
            }
            op::SHORT_BINUNICODE => self.push_unicode(1)?,
            op::BINUNICODE => self.push_unicode(4)?,
            op::BINUNICODE8 => self.push_unicode(8)?,
            op::SHORT_BINBYTES => self.push_bytes(1, false)?,
            op::BINBYTES => self.push_bytes(4, false)?,
            op::BINBYTES8 => self.push_bytes(8, false)?,
            op::BYTEARRAY8 => self.push_bytes(8, true)?,
            op::READONLY_BUFFER => {
                self.top()?;
            }
            op::NEXT_BUFFER => {
                return Err(Error::unsupported(
                    "out-of-band buffers are not supported (pickle was written with a buffer_callback)",
                ));
            }

            op::EMPTY_TUPLE => self.stack.push(PyValue::tuple(Vec::new())),
            op::TUPLE => {
                let items = self.pop_mark()?;
                self.stack.push(PyValue::tuple(items));
            }
            op::TUPLE1 => {
                let items = self.pop_n(1)?;
                self.stack.push(PyValue::tuple(items));
            }
            op::TUPLE2 => {
                let items = self.pop_n(2)?;
                self.stack.push(PyValue::tuple(items));
            }
            op::TUPLE3 => {
                let items = self.pop_n(3)?;
                self.stack.push(PyValue::tuple(items));
            }
            op::EMPTY_LIST => self.stack.push(PyValue::list(Vec::new())),
            op::LIST => {
                let items = self.pop_mark()?;
                self.stack.push(PyValue::list(items));
            }
            op::APPEND => {
                let item = self.pop()?;
                self.extend_top(vec![item])?;
            }
            op::APPENDS => {
                let items = self.pop_mark()?;
                self.extend_top(items)?;
            }
            op::EMPTY_DICT => self.stack.push(PyValue::dict(Vec::new())),
            op::DICT => {
                let items = self.pop_mark()?;
                let pairs = into_pairs(items)?;
                self.stack.push(PyValue::dict(pairs));
            }
            op::SETITEM => {
                let value = self.pop()?;
                let key = self.pop()?;
                self.set_items_on_top(vec![(key, value)])?;
            }
            op::SETITEMS => {
                let items = self.pop_mark()?;
                let pairs = into_pairs(items)?;
                self.set_items_on_top(pairs)?;
            }
            op::EMPTY_SET => self.stack.push(PyValue::Set(shared(Vec::new()))),
            op::ADDITEMS => {
                let items = self.pop_mark()?;
                match self.top()? {
                    PyValue::Set(set) => set.borrow_mut().extend(items),
                    other => {
                        return Err(Error::corrupt(format!(
                            "ADDITEMS target is {}, expected set",
                            other.type_name()
                        )));
                    }
                }
            }
            op::FROZENSET => {
                let items = self.pop_mark()?;
                self.stack.push(PyValue::FrozenSet(items.into()));
            }

            op::PUT => {
                let line = self.reader.read_text_line()?;
                let key = parse_memo_key(line)?;
                self.memoize(key)?;
            }
            op::BINPUT => {
                let key = u64::from(self.reader.read_u8()?);
                self.memoize(key)?;
            }
            op::LONG_BINPUT => {
                let key = u64::from(self.reader.read_u32_le()?);
                self.memoize(key)?;
            }
            op::MEMOIZE => {
                let key = self.memo.len() as u64;
                self.memoize(key)?;
            }
            op::GET => {
                let line = self.reader.read_text_line()?;
                let key = parse_memo_key(line)?;
                self.push_memo(key)?;
            }
            op::BINGET => {
                let key = u64::from(self.reader.read_u8()?);
                self.push_memo(key)?;
            }
            op::LONG_BINGET => {
                let key = u64::from(self.reader.read_u32_le()?);
                self.push_memo(key)?;
            }

            op::GLOBAL => {
                let module = self.reader.read_text_line()?;
                let name = self.reader.read_text_line()?;
                let global = resolve_global(module, name);
                self.stack.push(PyValue::Global(global.into()));
            }
            op::STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                let (Some(module), Some(name)) = (module.as_text(), name.as_text()) else {
                    return Err(Error::corrupt("STACK_GLOBAL requires str"));
                };
                self.stack.push(PyValue::Global(Global::new(module, name).into()));
            }
            op::REDUCE => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let args = args
                    .sequence_items()
                    .ok_or_else(|| Error::corrupt("REDUCE arguments must be a tuple"))?;
                let value = reduce(callable, args)?;
                self.stack.push(value);
            }
            op::NEWOBJ => {
                let args = self.pop()?;
                let cls = self.pop()?;
                let args = args
                    .sequence_items()
                    .ok_or_else(|| Error::corrupt("NEWOBJ arguments must be a tuple"))?;
                self.stack
                    .push(PyValue::Object(shared(PyObject::new(cls, args))));
            }
            op::NEWOBJ_EX => {
                let kwargs = self.pop()?;
                let args = self.pop()?;
                let cls = self.pop()?;
                let args = args
                    .sequence_items()
                    .ok_or_else(|| Error::corrupt("NEWOBJ_EX arguments must be a tuple"))?;
                let mut obj = PyObject::new(cls, args);
                if let PyValue::Dict(items) = &kwargs {
                    obj.kwargs = items.borrow().clone();
                }
                self.stack.push(PyValue::Object(shared(obj)));
            }
            op::OBJ => {
                let mut items = self.pop_mark()?;
                if items.is_empty() {
                    return Err(Error::corrupt("OBJ without a class"));
                }
                let cls = items.remove(0);
                self.stack
                    .push(PyValue::Object(shared(PyObject::new(cls, items))));
            }
            op::INST => {
                let module = self.reader.read_text_line()?;
                let name = self.reader.read_text_line()?;
                let global = resolve_global(module, name);
                let args = self.pop_mark()?;
                let cls = PyValue::Global(global.into());
                self.stack
                    .push(PyValue::Object(shared(PyObject::new(cls, args))));
            }
            op::BUILD => {
                let state = self.pop()?;
                match self.top()? {
                    PyValue::Object(obj) => obj.borrow_mut().state = Some(state),
                    other => {
                        return Err(Error::unsupported(format!(
                            "cannot apply BUILD state to {}",
                            other.type_name()
                        )));
                    }
                }
            }

            op::PERSID | op::BINPERSID => {
                return Err(Error::unsupported(
                    "persistent IDs are not supported",
                ));
            }
            op::EXT1 | op::EXT2 | op::EXT4 => {
                return Err(Error::unsupported(
                    "extension registry codes are not supported",
                ));
            }
            other => {
                return Err(Error::corrupt(format!("invalid load key, '\\x{other:02x}'")));
            }
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<PyValue, Error> {
        self.stack
            .pop()
            .ok_or_else(|| Error::corrupt("unpickling stack underflow"))
    }

    fn top(&self) -> Result<&PyValue, Error> {
        self.stack
            .last()
            .ok_or_else(|| Error::corrupt("unpickling stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<PyValue>, Error> {
        if self.stack.len() < n {
            return Err(Error::corrupt("unpickling stack underflow"));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    fn pop_mark(&mut self) -> Result<Vec<PyValue>, Error> {
        let previous = self
            .metastack
            .pop()
            .ok_or_else(|| Error::corrupt("could not find MARK"))?;
        Ok(std::mem::replace(&mut self.stack, previous))
    }

    fn memoize(&mut self, key: u64) -> Result<(), Error> {
        let top = self.top()?.clone();
        self.memo.insert(key, top);
        Ok(())
    }

    fn push_memo(&mut self, key: u64) -> Result<(), Error> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::corrupt(format!("memo value not found at index {key}")))?;
        self.stack.push(value);
        Ok(())
    }

    fn push_unicode(&mut self, width: usize) -> Result<(), Error> {
        let len = self.reader.read_len(width)?;
        let raw = self.reader.read_bytes(len)?;
        let text = std::str::from_utf8(raw).map_err(|err| {
            Error::corrupt("unicode payload is not valid UTF-8").with_source(err)
        })?;
        self.stack.push(PyValue::Str(text.to_string()));
        Ok(())
    }

    fn push_bytes(&mut self, width: usize, mutable: bool) -> Result<(), Error> {
        let len = self.reader.read_len(width)?;
        let raw = self.reader.read_bytes(len)?.to_vec();
        self.stack.push(if mutable {
            PyValue::ByteArray(raw)
        } else {
            PyValue::Bytes(raw)
        });
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<PyValue>) -> Result<(), Error> {
        match self.top()? {
            PyValue::List(list) => list.borrow_mut().extend(items),
            PyValue::Object(obj) => obj.borrow_mut().list_items.extend(items),
            other => {
                return Err(Error::corrupt(format!(
                    "cannot append to {}",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    fn set_items_on_top(&mut self, pairs: Vec<(PyValue, PyValue)>) -> Result<(), Error> {
        match self.top()? {
            PyValue::Dict(dict) => dict.borrow_mut().extend(pairs),
            PyValue::Object(obj) => obj.borrow_mut().dict_items.extend(pairs),
            other => {
                return Err(Error::corrupt(format!(
                    "cannot set items on {}",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }
}

/// Python 2 module names used by protocols below 3.
fn resolve_global(module: &str, name: &str) -> Global {
    let module = match module {
        "__builtin__" => "builtins",
        "copy_reg" => "copyreg",
        other => other,
    };
    Global::new(module, name)
}

/// Apply the builtin reconstructors that yield plain data; everything else
/// becomes an opaque `PyObject`.
fn reduce(callable: PyValue, args: Vec<PyValue>) -> Result<PyValue, Error> {
    let builtin = match &callable {
        PyValue::Global(global) => builtin_reduction(global, &args)?,
        _ => None,
    };
    Ok(builtin.unwrap_or_else(|| PyValue::Object(shared(PyObject::new(callable, args)))))
}

fn builtin_reduction(global: &Global, args: &[PyValue]) -> Result<Option<PyValue>, Error> {
    let value = if global.is("_codecs", "encode") {
        Some(PyValue::Bytes(encode_text(args)?))
    } else if global.is("builtins", "bytes") {
        Some(PyValue::Bytes(bytes_from_args(args)?))
    } else if global.is("builtins", "bytearray") {
        Some(PyValue::ByteArray(bytes_from_args(args)?))
    } else if global.is("builtins", "set") {
        Some(PyValue::Set(shared(iterable_arg(args)?)))
    } else if global.is("builtins", "frozenset") {
        Some(PyValue::FrozenSet(iterable_arg(args)?.into()))
    } else if global.is("builtins", "list") {
        Some(PyValue::list(iterable_arg(args)?))
    } else if global.is("builtins", "tuple") {
        Some(PyValue::tuple(iterable_arg(args)?))
    } else if global.is("copyreg", "_reconstructor") {
        // (cls, base, state): an instance of `cls` built from `base`.
        let cls = args.first().cloned().unwrap_or(PyValue::None);
        Some(PyValue::Object(shared(PyObject::new(cls, Vec::new()))))
    } else {
        None
    };
    Ok(value)
}

/// `_codecs.encode(text, encoding)` as emitted for `bytes` under protocol 2.
fn encode_text(args: &[PyValue]) -> Result<Vec<u8>, Error> {
    let text = args
        .first()
        .and_then(PyValue::as_text)
        .ok_or_else(|| Error::corrupt("_codecs.encode expects a str argument"))?;
    let encoding = args
        .get(1)
        .and_then(PyValue::as_text)
        .unwrap_or_else(|| "utf-8".to_string());
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "latin1" | "latin-1" | "iso-8859-1" => latin1_encode(&text),
        "utf-8" | "utf8" => Ok(text.into_bytes()),
        other => Err(Error::unsupported(format!("unsupported text encoding: {other}"))),
    }
}

fn bytes_from_args(args: &[PyValue]) -> Result<Vec<u8>, Error> {
    match args {
        [] => Ok(Vec::new()),
        [value] => value
            .as_byte_buffer()
            .ok_or_else(|| Error::unsupported("bytes() from a non-bytes argument")),
        [_, _, ..] => encode_text(args),
    }
}

fn iterable_arg(args: &[PyValue]) -> Result<Vec<PyValue>, Error> {
    match args.first() {
        None => Ok(Vec::new()),
        Some(value) => value
            .sequence_items()
            .ok_or_else(|| Error::unsupported(format!("cannot iterate {}", value.type_name()))),
    }
}

fn latin1_encode(text: &str) -> Result<Vec<u8>, Error> {
    text.chars()
        .map(|ch| {
            u8::try_from(u32::from(ch)).map_err(|_| {
                Error::corrupt(format!("character {ch:?} is not encodable as latin-1"))
            })
        })
        .collect()
}

fn into_pairs(items: Vec<PyValue>) -> Result<Vec<(PyValue, PyValue)>, Error> {
    if items.len() % 2 != 0 {
        return Err(Error::corrupt("odd number of items for dict"));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn parse_int(text: &str) -> Result<PyValue, Error> {
    let text = text.trim();
    let value = text.parse::<BigInt>().map_err(|err| {
        Error::corrupt(format!("invalid integer literal {text:?}")).with_source(err)
    })?;
    Ok(int_value(value))
}

fn parse_memo_key(text: &str) -> Result<u64, Error> {
    text.trim().parse::<u64>().map_err(|err| {
        Error::corrupt(format!("invalid memo key {text:?}")).with_source(err)
    })
}

/// Little-endian two's complement integer of any width.
fn decode_long(raw: &[u8]) -> PyValue {
    int_value(BigInt::from_signed_bytes_le(raw))
}

fn int_value(value: BigInt) -> PyValue {
    match i64::try_from(&value) {
        Ok(small) => PyValue::Int(small),
        Err(_) => PyValue::BigInt(value),
    }
}

/// Undo the `repr()` quoting used by protocol 0 `STRING`.
fn unquote_string(line: &[u8]) -> Result<Vec<u8>, Error> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let inner = match line {
        [b'\'', inner @ .., b'\''] | [b'"', inner @ .., b'"'] => inner,
        _ => return Err(Error::corrupt("the STRING opcode argument must be quoted")),
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut iter = inner.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        let Some(esc) = iter.next() else {
            return Err(Error::corrupt("trailing backslash in STRING operand"));
        };
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'x' => {
                let hi = iter.next();
                let lo = iter.next();
                let value = hi
                    .zip(lo)
                    .and_then(|(hi, lo)| Some(hex_digit(hi)? << 4 | hex_digit(lo)?))
                    .ok_or_else(|| Error::corrupt("invalid \\x escape in STRING operand"))?;
                out.push(value);
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                for _ in 0..2 {
                    match iter.peek().copied() {
                        Some(digit @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(digit - b'0');
                            iter.next();
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Decode Python's `raw-unicode-escape`: latin-1 bytes plus `\uXXXX`/`\UXXXXXXXX`.
fn decode_raw_unicode_escape(raw: &[u8]) -> Result<String, Error> {
    let mut out = String::with_capacity(raw.len());
    let mut idx = 0;
    while idx < raw.len() {
        let byte = raw[idx];
        let width = match (byte, raw.get(idx + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 {
            out.push(char::from(byte));
            idx += 1;
            continue;
        }
        let digits = raw
            .get(idx + 2..idx + 2 + width)
            .ok_or_else(|| Error::corrupt("truncated \\u escape in UNICODE operand"))?;
        let code = digits.iter().try_fold(0u32, |acc, digit| {
            hex_digit(*digit).map(|value| acc * 16 + u32::from(value))
        });
        let ch = code
            .and_then(char::from_u32)
            .ok_or_else(|| Error::corrupt("invalid \\u escape in UNICODE operand"))?;
        out.push(ch);
        idx += 2 + width;
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

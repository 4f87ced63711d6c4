// Bounded little/big-endian byte cursor over an in-memory pickle stream.
use bstr::ByteSlice;

use crate::core::error::Error;

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| truncated(self.pos, 1))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| truncated(self.pos, len))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        let raw = self.read_array::<2>()?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let raw = self.read_array::<4>()?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, Error> {
        let raw = self.read_array::<4>()?;
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, Error> {
        let raw = self.read_array::<8>()?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_f64_be(&mut self) -> Result<f64, Error> {
        let raw = self.read_array::<8>()?;
        Ok(f64::from_be_bytes(raw))
    }

    /// Length prefix of `u32`/`u64` width, checked against the remaining input.
    pub fn read_len(&mut self, width: usize) -> Result<usize, Error> {
        let at = self.pos;
        let len = match width {
            1 => u64::from(self.read_u8()?),
            4 => u64::from(self.read_u32_le()?),
            _ => self.read_u64_le()?,
        };
        let remaining = self.buf.len() - self.pos;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= remaining)
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "length prefix {len} exceeds remaining input ({remaining} bytes)"
                ))
                .with_offset(at as u64)
            })
    }

    /// Read up to (not including) the next `\n`; the newline is consumed.
    pub fn read_line(&mut self) -> Result<&'a [u8], Error> {
        let rest = &self.buf[self.pos..];
        let Some(end) = rest.find_byte(b'\n') else {
            return Err(
                Error::corrupt("unterminated text operand").with_offset(self.pos as u64)
            );
        };
        let line = &rest[..end];
        self.pos += end + 1;
        Ok(line)
    }

    /// Same as `read_line` but the operand must be UTF-8 text.
    pub fn read_text_line(&mut self) -> Result<&'a str, Error> {
        let at = self.pos;
        let line = self.read_line()?;
        line.to_str().map_err(|err| {
            Error::corrupt("text operand is not valid UTF-8")
                .with_offset(at as u64)
                .with_source(err)
        })
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

fn truncated(pos: usize, want: usize) -> Error {
    Error::corrupt(format!("unexpected end of input (wanted {want} bytes)")).with_offset(pos as u64)
}

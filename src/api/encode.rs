//! Purpose: Render a normalized `serde_json::Value` as JSON text bytes.
//! Exports: `OutputStyle`, `EncodeOptions`, `encode`.
//! Role: Output writer for the converter; owns separators, indentation and escaping.
//! Invariants: `Spaced` output (the default) is byte-compatible with Python's `json.dump`
//! defaults: `", "` and `": "` separators, no indentation, ASCII-only text.
//! Invariants: Output never ends with a trailing newline.
use std::io;

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::{CompactFormatter, Formatter, PrettyFormatter};

use crate::core::error::{Error, ErrorKind};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputStyle {
    /// Single line with a space after `,` and `:`.
    #[default]
    Spaced,
    /// Single line without any insignificant whitespace.
    Compact,
    /// Two-space indentation.
    Pretty,
}

#[derive(Copy, Clone, Debug)]
pub struct EncodeOptions {
    pub style: OutputStyle,
    /// Escape every non-ASCII character as `\uXXXX`.
    pub ensure_ascii: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            style: OutputStyle::Spaced,
            ensure_ascii: true,
        }
    }
}

pub fn encode(value: &Value, options: &EncodeOptions) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match options.style {
        OutputStyle::Spaced => write_with(
            value,
            &mut out,
            StyledFormatter::new(CompactFormatter, true, options.ensure_ascii),
        ),
        OutputStyle::Compact => write_with(
            value,
            &mut out,
            StyledFormatter::new(CompactFormatter, false, options.ensure_ascii),
        ),
        OutputStyle::Pretty => write_with(
            value,
            &mut out,
            StyledFormatter::new(
                PrettyFormatter::with_indent(b"  "),
                false,
                options.ensure_ascii,
            ),
        ),
    }?;
    Ok(out)
}

fn write_with<F: Formatter>(value: &Value, out: &mut Vec<u8>, formatter: F) -> Result<(), Error> {
    let mut serializer = serde_json::Serializer::with_formatter(out, formatter);
    value.serialize(&mut serializer).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode JSON")
            .with_source(err)
    })
}

/// Wraps a serde_json formatter, optionally widening separators and escaping non-ASCII.
struct StyledFormatter<F> {
    inner: F,
    spaced: bool,
    ensure_ascii: bool,
}

impl<F: Formatter> StyledFormatter<F> {
    fn new(inner: F, spaced: bool, ensure_ascii: bool) -> Self {
        Self {
            inner,
            spaced,
            ensure_ascii,
        }
    }
}

impl<F: Formatter> Formatter for StyledFormatter<F> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if self.spaced {
            if !first {
                writer.write_all(b", ")?;
            }
            return Ok(());
        }
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if self.spaced {
            if !first {
                writer.write_all(b", ")?;
            }
            return Ok(());
        }
        self.inner.begin_object_key(writer, first)
    }

    fn end_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_key(writer)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.spaced {
            return writer.write_all(b": ");
        }
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if !self.ensure_ascii {
            return self.inner.write_string_fragment(writer, fragment);
        }
        write_ascii_escaped(writer, fragment)
    }
}

/// Printable ASCII passes through; everything else becomes UTF-16 `\uXXXX` escapes.
fn write_ascii_escaped<W: ?Sized + io::Write>(writer: &mut W, fragment: &str) -> io::Result<()> {
    let mut start = 0;
    for (idx, ch) in fragment.char_indices() {
        if (' '..='~').contains(&ch) {
            continue;
        }
        if start < idx {
            writer.write_all(fragment[start..idx].as_bytes())?;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            write!(writer, "\\u{unit:04x}")?;
        }
        start = idx + ch.len_utf8();
    }
    if start < fragment.len() {
        writer.write_all(fragment[start..].as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EncodeOptions, OutputStyle, encode};
    use serde_json::json;

    fn render(value: &serde_json::Value, style: OutputStyle, ensure_ascii: bool) -> String {
        let bytes = encode(value, &EncodeOptions { style, ensure_ascii }).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn spaced_matches_python_default_separators() {
        let value = json!({"a": [1, 2.5, null], "b": {"c": true}});
        assert_eq!(
            render(&value, OutputStyle::Spaced, true),
            r#"{"a": [1, 2.5, null], "b": {"c": true}}"#
        );
    }

    #[test]
    fn compact_has_no_whitespace() {
        let value = json!([[1, 2], [3, 4]]);
        assert_eq!(render(&value, OutputStyle::Compact, true), "[[1,2],[3,4]]");
    }

    #[test]
    fn pretty_uses_two_space_indent() {
        let value = json!({"k": [1]});
        assert_eq!(
            render(&value, OutputStyle::Pretty, true),
            "{\n  \"k\": [\n    1\n  ]\n}"
        );
    }

    #[test]
    fn empty_containers() {
        assert_eq!(render(&json!([]), OutputStyle::Spaced, true), "[]");
        assert_eq!(render(&json!({}), OutputStyle::Spaced, true), "{}");
    }

    #[test]
    fn ensure_ascii_escapes_non_ascii_and_surrogates() {
        let value = json!("caf\u{e9} \u{1f600}\u{7f}");
        assert_eq!(
            render(&value, OutputStyle::Spaced, true),
            r#""caf\u00e9 \ud83d\ude00\u007f""#,
        );
        assert_eq!(
            render(&value, OutputStyle::Spaced, false),
            "\"caf\u{e9} \u{1f600}\u{7f}\""
        );
    }

    #[test]
    fn control_characters_keep_standard_escapes() {
        let value = json!("a\nb\"c");
        assert_eq!(render(&value, OutputStyle::Spaced, true), r#""a\nb\"c""#);
    }
}

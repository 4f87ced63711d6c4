//! Purpose: Define the public Rust API boundary for pickle2json.
//! Exports: Conversion pipeline, option types, error types and the array model.
//! Role: Public surface used by the CLI and integration tests; hides decoder internals.
//! Invariants: This module is the only public path to `core` types.
//! Invariants: Option structs have `Default` values matching the zero-argument CLI.

mod convert;
mod encode;
mod normalize;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::ndarray::{ArrayData, ByteOrder, DType, DTypeKind, Element, NdArray};
pub use crate::core::unpickler::unpickle;
pub use crate::core::value::{Global, PyObject, PyValue};
pub use convert::{
    ArraySummary, ConvertOptions, ConvertReport, Converted, DEFAULT_INPUT, DEFAULT_OUTPUT,
    convert_bytes, convert_file,
};
pub use encode::{EncodeOptions, OutputStyle, encode};
pub use normalize::{NonFinite, NormalizeOptions, normalize, normalize_array};

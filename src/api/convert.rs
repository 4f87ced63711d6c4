//! Purpose: The conversion pipeline: read pickle → normalize → write JSON.
//! Exports: `ConvertOptions`, `ConvertReport`, `ArraySummary`, `Converted`,
//! `convert_bytes`, `convert_file`, `DEFAULT_INPUT`, `DEFAULT_OUTPUT`.
//! Role: Single entry point used by the CLI; library callers get the same behavior.
//! Invariants: The output file is only opened after the whole document encoded, and is
//! truncated on open so a run always fully replaces previous output.
//! Invariants: Identical input and options produce byte-identical output.
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use super::encode::{EncodeOptions, encode};
use super::normalize::{NormalizeOptions, normalize, normalize_array};
use crate::core::error::Error;
use crate::core::ndarray::{DType, NdArray};
use crate::core::unpickler::unpickle;

pub const DEFAULT_INPUT: &str = "Code/hist";
pub const DEFAULT_OUTPUT: &str = "hist_data.json";

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub normalize: NormalizeOptions,
    pub encode: EncodeOptions,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT),
            output: PathBuf::from(DEFAULT_OUTPUT),
            normalize: NormalizeOptions::default(),
            encode: EncodeOptions::default(),
        }
    }
}

/// Shape and element type of a top-level array that was flattened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArraySummary {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

#[derive(Clone, Debug)]
pub struct Converted {
    pub json: Vec<u8>,
    pub array: Option<ArraySummary>,
}

#[derive(Clone, Debug)]
pub struct ConvertReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub bytes_read: usize,
    pub bytes_written: usize,
    pub array: Option<ArraySummary>,
}

/// Convert an in-memory pickle to JSON text.
pub fn convert_bytes(
    bytes: &[u8],
    normalize_options: &NormalizeOptions,
    encode_options: &EncodeOptions,
) -> Result<Converted, Error> {
    let value = unpickle(bytes)?;
    let (document, array) = match NdArray::from_value(&value) {
        Some(array) => {
            let array = array?;
            let document = normalize_array(&array, normalize_options)?;
            let summary = ArraySummary {
                shape: array.shape,
                dtype: array.dtype,
            };
            (document, Some(summary))
        }
        None => (normalize(&value, normalize_options)?, None),
    };
    let json = encode(&document, encode_options)?;
    Ok(Converted { json, array })
}

/// Run the full pipeline between two files, replacing any existing output.
pub fn convert_file(options: &ConvertOptions) -> Result<ConvertReport, Error> {
    let bytes = fs::read(&options.input).map_err(|err| {
        Error::from_io(err, "failed to read input").with_path(&options.input)
    })?;
    debug!(path = %options.input.display(), bytes = bytes.len(), "read input");

    let converted =
        convert_bytes(&bytes, &options.normalize, &options.encode).map_err(|err| {
            if err.path().is_some() {
                err
            } else {
                err.with_path(&options.input)
            }
        })?;

    fs::write(&options.output, &converted.json).map_err(|err| {
        Error::from_io(err, "failed to write output").with_path(&options.output)
    })?;
    info!(
        path = %options.output.display(),
        bytes = converted.json.len(),
        array = converted.array.is_some(),
        "wrote JSON output"
    );

    Ok(ConvertReport {
        input: options.input.clone(),
        output: options.output.clone(),
        bytes_read: bytes.len(),
        bytes_written: converted.json.len(),
        array: converted.array,
    })
}

// Core modules implementing pickle decoding, the value model, and error modeling.
pub mod error;
pub mod ndarray;
pub mod opcodes;
pub mod reader;
pub mod unpickler;
pub mod value;

//! Purpose: Library crate behind the `pickle2json` CLI and its tests.
//! Exports: `api` (conversion pipeline, options, errors, decoded value model).
//! Role: Decodes pickled values (including NumPy arrays) and renders them as JSON.
//! Invariants: The `api` module is the only public path; `core` stays internal.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;

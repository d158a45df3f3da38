//! # Record Serialization
//!
//! Codecs for record payloads stored by the surrounding storage layer.
//! Currently the CSV document form, which is independent of the tree engine.

pub mod csv;

pub use csv::{Document, FieldValue, RecordId};

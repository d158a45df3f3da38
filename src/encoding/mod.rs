//! # Encoding Module
//!
//! Byte-level encoding utilities shared by the bucket layout and the WAL:
//!
//! - **Varint encoding**: compact length fields for variable-size entries

pub mod varint;

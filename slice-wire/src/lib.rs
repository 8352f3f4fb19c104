//! Streaming ZSTD-framed decoder for the slice bulk-import wire format.
//!
//! A slice is a single compressed file: a `SliceHeader`, then for each table
//! a `TableHeader` followed by zero or more `Row` records terminated by the
//! sentinel byte `0xFF`. [`decoder::SliceDecoder`] turns an arbitrarily
//! chunked byte stream into that logical sequence of events, restartable
//! across any chunk boundary.

pub mod decoder;
pub mod error;
mod scanner;
pub mod types;
mod varint;

pub use decoder::{HeaderOutcome, RowOutcome, SliceDecoder, TableHeaderOutcome};
pub use error::{ParseError, SliceWireError};
pub use types::{FieldValue, Row, SliceHeader, TableHeader};

use thiserror::Error;

/// Reasons a slice stream failed to parse. Carried inside [`SliceWireError::Parse`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("varint longer than 10 bytes")]
  BadVarint,
  #[error("string of {0} bytes exceeds the {1} byte cap")]
  OversizedString(u64, u64),
  #[error("field of {0} bytes exceeds the {1} byte cap")]
  OversizedField(u64, u64),
  #[error("table declares {0} columns, outside the allowed 1..=200 range")]
  BadColumnCount(u64),
  #[error("table name is empty")]
  EmptyTableName,
  #[error("slice declares {0} tables, exceeding the cap of {1}")]
  TooManyTables(u64, u64),
  #[error("unknown row type tag {0}")]
  BadTypeTag(u8),
  #[error("more tables were parsed than the header's numberOfTables ({0})")]
  TableCountExceeded(u64),
  #[error("unexpected end of stream while parsing")]
  UnexpectedEof,
  #[error("parseSliceHeader() called more than once")]
  HeaderAlreadyParsed,
}

/// Abstract error kinds for the slice wire format, matching the core's
/// error-kind table: `DecodeInit`, `Decompress`, `Parse`.
#[derive(Debug, Error, Clone)]
pub enum SliceWireError {
  #[error("failed to initialize the decompression context: {0}")]
  DecodeInit(String),
  #[error("zstd frame corruption or unexpected end of frame: {0}")]
  Decompress(String),
  #[error("malformed slice data: {0}")]
  Parse(#[from] ParseError),
}

impl SliceWireError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}

use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

use crate::error::{ParseError, SliceWireError};
use crate::scanner::Scanner;
use crate::types::{FieldValue, Row, SliceHeader, TableHeader};

/// Safety caps from §3. Exceeding any of these is a `Parse` error.
pub const MAX_STRING_LEN: u64 = 1 * 1024 * 1024;
pub const MAX_FIELD_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_NAME_LEN: u64 = 256;
pub const MIN_COLUMNS: u64 = 1;
pub const MAX_COLUMNS: u64 = 200;
pub const MAX_TABLES: u64 = 10_000;

/// Sentinel byte that terminates a table's row sequence (§3, §4.1).
const END_OF_TABLE: u8 = 0xFF;

/// Outcome of [`SliceDecoder::parse_table_header`].
pub enum TableHeaderOutcome {
  Ok(TableHeader),
  NeedMore,
  EndOfStream,
}

/// Outcome of [`SliceDecoder::parse_row`].
pub enum RowOutcome {
  Ok(Row),
  NeedMore,
  EndOfTable,
}

/// Outcome of [`SliceDecoder::parse_slice_header`].
pub enum HeaderOutcome {
  Ok(SliceHeader),
  NeedMore,
}

const COMPACT_CONSUMED_THRESHOLD: usize = 2 * 1024 * 1024;
const COMPACT_CAPACITY_THRESHOLD: usize = 16 * 1024 * 1024;
const DECOMPRESS_SCRATCH: usize = 64 * 1024;

/// Streaming ZSTD-framed decoder for the slice wire format (§3, §4.1).
///
/// Maintains `(buffer, offset, stream_ended)`: every parser reads
/// tentatively from `offset` and only advances it once a
/// full record has been recognized, so a `SliceDecoder` fed one byte at a
/// time produces the identical event sequence as one fed the whole stream at
/// once (the restartability property in §8, invariant 6).
pub struct SliceDecoder {
  zstd: Option<zstd::stream::raw::Decoder<'static>>,
  buffer: Vec<u8>,
  offset: usize,
  stream_ended: bool,
  header_parsed: bool,
  declared_tables: Option<u64>,
  tables_parsed: u64,
  rows_parsed: u64,
  current_table_name: Option<String>,
  error: Option<SliceWireError>,
}

impl Default for SliceDecoder {
  fn default() -> Self {
    Self::new()
  }
}

impl SliceDecoder {
  pub fn new() -> Self {
    SliceDecoder {
      zstd: None,
      buffer: Vec::new(),
      offset: 0,
      stream_ended: false,
      header_parsed: false,
      declared_tables: None,
      tables_parsed: 0,
      rows_parsed: 0,
      current_table_name: None,
      error: None,
    }
  }

  /// Allocates the decompression context. Must be called before [`feed`].
  pub fn initialize(&mut self) -> Result<(), SliceWireError> {
    let decoder = zstd::stream::raw::Decoder::new().map_err(|e| SliceWireError::DecodeInit(e.to_string()))?;
    self.zstd = Some(decoder);
    Ok(())
  }

  pub fn error(&self) -> Option<&SliceWireError> {
    self.error.as_ref()
  }

  pub fn is_end_of_stream(&self) -> bool {
    self.stream_ended
  }

  pub fn remaining_bytes(&self) -> usize {
    self.buffer.len() - self.offset
  }

  pub fn rows_parsed(&self) -> u64 {
    self.rows_parsed
  }

  pub fn current_table_name(&self) -> Option<&str> {
    self.current_table_name.as_deref()
  }

  fn poison<T>(&mut self, err: ParseError) -> Result<T, SliceWireError> {
    let wrapped = SliceWireError::Parse(err);
    self.error = Some(wrapped.clone());
    Err(wrapped)
  }

  fn fail_if_poisoned(&self) -> Result<(), SliceWireError> {
    if let Some(err) = &self.error {
      return Err(err.clone());
    }
    Ok(())
  }

  /// Appends compressed bytes, decompressing as much as the internal
  /// scratch buffer allows. Sets `stream_ended` once the ZSTD frame
  /// reports completion.
  pub fn feed(&mut self, compressed: &[u8]) -> Result<(), SliceWireError> {
    self.fail_if_poisoned()?;
    let zstd = self.zstd.as_mut().ok_or_else(|| {
      let err = SliceWireError::DecodeInit("feed() called before initialize()".to_string());
      err
    })?;

    let mut src = InBuffer::around(compressed);
    let mut scratch = vec![0u8; DECOMPRESS_SCRATCH];
    loop {
      let mut dst = OutBuffer::around(&mut scratch);
      let hint = zstd.run(&mut src, &mut dst).map_err(|e| {
        let err = SliceWireError::Decompress(e.to_string());
        self.error = Some(err.clone());
        err
      })?;
      let produced = dst.as_slice().len();
      if produced > 0 {
        self.buffer.extend_from_slice(dst.as_slice());
      }
      if hint == 0 {
        self.stream_ended = true;
        break;
      }
      if src.pos() >= compressed.len() && produced == 0 {
        break;
      }
    }
    Ok(())
  }

  fn unread(&self) -> &[u8] {
    &self.buffer[self.offset..]
  }

  /// Reclaims buffer capacity once consumed bytes cross the threshold, or
  /// the buffer is empty but oversized (§4.1).
  pub fn compact(&mut self) {
    if self.offset >= COMPACT_CONSUMED_THRESHOLD
      || (self.offset == self.buffer.len() && self.buffer.capacity() > COMPACT_CAPACITY_THRESHOLD)
    {
      self.buffer.drain(0..self.offset);
      self.offset = 0;
      if self.buffer.is_empty() {
        self.buffer.shrink_to_fit();
      }
    }
  }

  pub fn parse_slice_header(&mut self) -> Result<HeaderOutcome, SliceWireError> {
    self.fail_if_poisoned()?;
    if self.header_parsed {
      return self.poison(ParseError::HeaderAlreadyParsed);
    }

    let mut sc = Scanner::new(self.unread());
    let slice_id = sc.string(MAX_STRING_LEN)?;
    let version = sc.varint()? as i64;
    let priority = sc.string(MAX_STRING_LEN)?;
    let timestamp = sc.varint()? as i64;
    let number_of_tables = sc.varint()?;

    if sc.needs_more() {
      return Ok(HeaderOutcome::NeedMore);
    }

    if number_of_tables > MAX_TABLES {
      return self.poison(ParseError::TooManyTables(number_of_tables, MAX_TABLES));
    }

    self.offset += sc.consumed();
    self.header_parsed = true;
    self.declared_tables = if number_of_tables == 0 { None } else { Some(number_of_tables) };
    if number_of_tables == 0 {
      log::warn!("slice header declares numberOfTables=0; falling back to read-until-EOF (legacy)");
    }

    Ok(HeaderOutcome::Ok(SliceHeader {
      slice_id,
      version,
      priority,
      timestamp,
      number_of_tables: number_of_tables as i64,
    }))
  }

  pub fn parse_table_header(&mut self) -> Result<TableHeaderOutcome, SliceWireError> {
    self.fail_if_poisoned()?;

    if let Some(declared) = self.declared_tables {
      if self.tables_parsed >= declared {
        return Ok(TableHeaderOutcome::EndOfStream);
      }
    } else if self.stream_ended && self.remaining_bytes() == 0 {
      return Ok(TableHeaderOutcome::EndOfStream);
    }

    if self.remaining_bytes() == 0 {
      if self.stream_ended {
        return Ok(TableHeaderOutcome::EndOfStream);
      }
      return Ok(TableHeaderOutcome::NeedMore);
    }

    let mut sc = Scanner::new(self.unread());
    let table_name = sc.string(MAX_NAME_LEN)?;
    let num_columns = sc.varint()?;

    if sc.needs_more() {
      return Ok(TableHeaderOutcome::NeedMore);
    }

    if table_name.is_empty() {
      return self.poison(ParseError::EmptyTableName);
    }
    if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&num_columns) {
      return self.poison(ParseError::BadColumnCount(num_columns));
    }

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
      let col = sc.string(MAX_NAME_LEN)?;
      if sc.needs_more() {
        return Ok(TableHeaderOutcome::NeedMore);
      }
      columns.push(col);
    }

    self.offset += sc.consumed();
    self.tables_parsed += 1;
    if let Some(declared) = self.declared_tables {
      if self.tables_parsed > declared {
        return self.poison(ParseError::TableCountExceeded(declared));
      }
    }
    self.current_table_name = Some(table_name.clone());

    Ok(TableHeaderOutcome::Ok(TableHeader { table_name, columns }))
  }

  pub fn parse_row(&mut self, columns: &[String]) -> Result<RowOutcome, SliceWireError> {
    self.fail_if_poisoned()?;

    if self.remaining_bytes() == 0 {
      return Ok(RowOutcome::NeedMore);
    }

    // Peek the end-of-table sentinel before attempting a row parse.
    if self.unread()[0] == END_OF_TABLE {
      self.offset += 1;
      self.current_table_name = None;
      return Ok(RowOutcome::EndOfTable);
    }

    let mut sc = Scanner::new(self.unread());
    let mut values = Vec::with_capacity(columns.len());
    for _ in 0..columns.len() {
      let field_size = sc.varint()?;
      if sc.needs_more() {
        return Ok(RowOutcome::NeedMore);
      }
      if field_size > MAX_FIELD_SIZE {
        return self.poison(ParseError::OversizedField(field_size, MAX_FIELD_SIZE));
      }
      let field_bytes = sc.bytes(field_size as usize);
      if sc.needs_more() {
        return Ok(RowOutcome::NeedMore);
      }
      let type_tag = match sc.byte() {
        Some(b) => b,
        None => return Ok(RowOutcome::NeedMore),
      };

      let value = if field_size == 0 {
        FieldValue::Null
      } else {
        match type_tag {
          0 => FieldValue::Null,
          1 => {
            if field_bytes.len() != 8 {
              return self.poison(ParseError::BadTypeTag(type_tag));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(field_bytes);
            FieldValue::Int(i64::from_be_bytes(b))
          }
          2 => {
            if field_bytes.len() != 8 {
              return self.poison(ParseError::BadTypeTag(type_tag));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(field_bytes);
            FieldValue::Real(f64::from_be_bytes(b))
          }
          3 => match std::str::from_utf8(field_bytes) {
            Ok(s) => FieldValue::Text(s.to_string()),
            Err(_) => return self.poison(ParseError::BadVarint),
          },
          4 => FieldValue::Blob(field_bytes.to_vec()),
          other => return self.poison(ParseError::BadTypeTag(other)),
        }
      };
      values.push(value);
    }

    if sc.needs_more() {
      return Ok(RowOutcome::NeedMore);
    }

    self.offset += sc.consumed();
    self.rows_parsed += 1;
    Ok(RowOutcome::Ok(Row { values }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
      let mut byte = (v & 0x7F) as u8;
      v >>= 7;
      if v != 0 {
        byte |= 0x80;
      }
      out.push(byte);
      if v == 0 {
        break;
      }
    }
  }

  fn encode_string(s: &str, out: &mut Vec<u8>) {
    encode_varint(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
  }

  fn compress(raw: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(raw, 0).unwrap()
  }

  fn build_raw_slice(table: &str, columns: &[&str], rows: &[Vec<FieldValue>]) -> Vec<u8> {
    let mut raw = Vec::new();
    encode_string("s1", &mut raw);
    encode_varint(1, &mut raw); // version
    encode_string("high", &mut raw);
    encode_varint(1234, &mut raw); // timestamp
    encode_varint(1, &mut raw); // numberOfTables

    encode_string(table, &mut raw);
    encode_varint(columns.len() as u64, &mut raw);
    for c in columns {
      encode_string(c, &mut raw);
    }

    for row in rows {
      for value in row {
        match value {
          FieldValue::Null => {
            encode_varint(0, &mut raw);
          }
          FieldValue::Int(i) => {
            encode_varint(8, &mut raw);
            raw.extend_from_slice(&i.to_be_bytes());
            raw.push(1);
          }
          FieldValue::Real(r) => {
            encode_varint(8, &mut raw);
            raw.extend_from_slice(&r.to_be_bytes());
            raw.push(2);
          }
          FieldValue::Text(s) => {
            encode_varint(s.len() as u64, &mut raw);
            raw.extend_from_slice(s.as_bytes());
            raw.push(3);
          }
          FieldValue::Blob(b) => {
            encode_varint(b.len() as u64, &mut raw);
            raw.extend_from_slice(b);
            raw.push(4);
          }
        }
      }
    }
    raw.push(0xFF);
    raw
  }

  fn drain_one_table(decoder: &mut SliceDecoder) -> (TableHeader, Vec<Row>) {
    let header = loop {
      match decoder.parse_table_header().unwrap() {
        TableHeaderOutcome::Ok(h) => break h,
        TableHeaderOutcome::NeedMore => panic!("unexpected NeedMore in single-feed test"),
        TableHeaderOutcome::EndOfStream => panic!("expected a table header"),
      }
    };
    let mut rows = Vec::new();
    loop {
      match decoder.parse_row(&header.columns).unwrap() {
        RowOutcome::Ok(row) => rows.push(row),
        RowOutcome::EndOfTable => break,
        RowOutcome::NeedMore => panic!("unexpected NeedMore in single-feed test"),
      }
    }
    (header, rows)
  }

  #[test]
  fn decodes_header_table_and_rows_fed_whole() {
    let raw = build_raw_slice(
      "tasks",
      &["id", "name"],
      &[vec![FieldValue::Text("t1".into()), FieldValue::Text("Alpha".into())]],
    );
    let compressed = compress(&raw);

    let mut decoder = SliceDecoder::new();
    decoder.initialize().unwrap();
    decoder.feed(&compressed).unwrap();

    match decoder.parse_slice_header().unwrap() {
      HeaderOutcome::Ok(h) => {
        assert_eq!(h.slice_id, "s1");
        assert_eq!(h.number_of_tables, 1);
      }
      HeaderOutcome::NeedMore => panic!("expected header"),
    }

    let (header, rows) = drain_one_table(&mut decoder);
    assert_eq!(header.table_name, "tasks");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values[0], FieldValue::Text("t1".into()));

    assert!(matches!(decoder.parse_table_header().unwrap(), TableHeaderOutcome::EndOfStream));
    assert!(decoder.is_end_of_stream());
    assert_eq!(decoder.remaining_bytes(), 0);
  }

  #[test]
  fn restartable_across_arbitrary_chunk_boundaries() {
    let raw = build_raw_slice(
      "tasks",
      &["id", "name"],
      &[
        vec![FieldValue::Text("t1".into()), FieldValue::Text("Alpha".into())],
        vec![FieldValue::Text("t2".into()), FieldValue::Null],
      ],
    );
    let compressed = compress(&raw);

    // Feed one whole.
    let mut whole = SliceDecoder::new();
    whole.initialize().unwrap();
    whole.feed(&compressed).unwrap();
    let HeaderOutcome::Ok(h1) = whole.parse_slice_header().unwrap() else {
      panic!()
    };
    let (_, rows1) = drain_one_table(&mut whole);

    // Feed byte-by-byte.
    let mut piecemeal = SliceDecoder::new();
    piecemeal.initialize().unwrap();
    for byte in &compressed {
      piecemeal.feed(std::slice::from_ref(byte)).unwrap();
    }
    let header = loop {
      match piecemeal.parse_slice_header().unwrap() {
        HeaderOutcome::Ok(h) => break h,
        HeaderOutcome::NeedMore => continue,
      }
    };
    assert_eq!(header, h1);
    let (_, rows2) = drain_one_table(&mut piecemeal);
    assert_eq!(rows1, rows2);
  }

  #[test]
  fn field_at_exactly_max_size_decodes_oversize_fails() {
    let mut raw = Vec::new();
    encode_string("s1", &mut raw);
    encode_varint(1, &mut raw);
    encode_string("high", &mut raw);
    encode_varint(0, &mut raw);
    encode_varint(1, &mut raw);
    encode_string("t", &mut raw);
    encode_varint(1, &mut raw);
    encode_string("blob", &mut raw);

    let mut raw_ok = raw.clone();
    let max_blob = vec![0u8; MAX_FIELD_SIZE as usize];
    encode_varint(max_blob.len() as u64, &mut raw_ok);
    raw_ok.extend_from_slice(&max_blob);
    raw_ok.push(4);
    raw_ok.push(0xFF);

    let compressed_ok = compress(&raw_ok);
    let mut decoder = SliceDecoder::new();
    decoder.initialize().unwrap();
    decoder.feed(&compressed_ok).unwrap();
    decoder.parse_slice_header().unwrap();
    let (_, rows) = drain_one_table(&mut decoder);
    assert_eq!(rows.len(), 1);

    let mut raw_bad = raw;
    let over_blob = vec![0u8; (MAX_FIELD_SIZE + 1) as usize];
    encode_varint(over_blob.len() as u64, &mut raw_bad);
    raw_bad.extend_from_slice(&over_blob);
    raw_bad.push(4);
    raw_bad.push(0xFF);

    let compressed_bad = compress(&raw_bad);
    let mut decoder2 = SliceDecoder::new();
    decoder2.initialize().unwrap();
    decoder2.feed(&compressed_bad).unwrap();
    decoder2.parse_slice_header().unwrap();
    let header = match decoder2.parse_table_header().unwrap() {
      TableHeaderOutcome::Ok(h) => h,
      _ => panic!(),
    };
    let err = decoder2.parse_row(&header.columns).unwrap_err();
    assert!(matches!(err, SliceWireError::Parse(ParseError::OversizedField(_, _))));
  }

  #[test]
  fn zero_tables_is_lenient_read_until_eof() {
    let mut raw = Vec::new();
    encode_string("legacy".into(), &mut raw);
    encode_varint(1, &mut raw);
    encode_string("normal", &mut raw);
    encode_varint(0, &mut raw); // numberOfTables = 0, legacy read-until-EOF

    encode_string("tasks", &mut raw);
    encode_varint(1, &mut raw);
    encode_string("id", &mut raw);
    encode_string("t1", &mut raw);
    raw.push(3);
    raw.push(0xFF);

    let compressed = compress(&raw);
    let mut decoder = SliceDecoder::new();
    decoder.initialize().unwrap();
    decoder.feed(&compressed).unwrap();
    decoder.parse_slice_header().unwrap();
    let (_, rows) = drain_one_table(&mut decoder);
    assert_eq!(rows.len(), 1);
    assert!(matches!(decoder.parse_table_header().unwrap(), TableHeaderOutcome::EndOfStream));
  }

  #[test]
  fn declaring_more_tables_than_the_cap_is_a_parse_error() {
    let mut raw = Vec::new();
    encode_string("s1", &mut raw);
    encode_varint(1, &mut raw);
    encode_string("high", &mut raw);
    encode_varint(1234, &mut raw);
    encode_varint(MAX_TABLES + 1, &mut raw);

    let compressed = compress(&raw);
    let mut decoder = SliceDecoder::new();
    decoder.initialize().unwrap();
    decoder.feed(&compressed).unwrap();
    let err = decoder.parse_slice_header().unwrap_err();
    assert!(matches!(err, SliceWireError::Parse(ParseError::TooManyTables(_, _))));
  }

  #[test]
  fn second_header_parse_is_an_error() {
    let raw = build_raw_slice("t", &["id"], &[]);
    let compressed = compress(&raw);
    let mut decoder = SliceDecoder::new();
    decoder.initialize().unwrap();
    decoder.feed(&compressed).unwrap();
    decoder.parse_slice_header().unwrap();
    let err = decoder.parse_slice_header().unwrap_err();
    assert!(matches!(err, SliceWireError::Parse(ParseError::HeaderAlreadyParsed)));
  }
}

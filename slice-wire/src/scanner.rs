use crate::error::ParseError;
use crate::varint::{read_f64_be, read_i64_be, read_string, read_varint, TentativeRead};

/// A cursor over an in-memory buffer that supports tentative, restartable
/// reads: every method either advances the internal position past a fully
/// parsed value, or marks `need_more` and leaves the position untouched.
///
/// Callers drive a sequence of reads with `?` for real errors, then check
/// [`Scanner::needs_more`] once at the end: if set, nothing should be
/// consumed from the owning buffer.
pub struct Scanner<'a> {
  buf: &'a [u8],
  pos: usize,
  need_more: bool,
}

impl<'a> Scanner<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Scanner { buf, pos: 0, need_more: false }
  }

  pub fn needs_more(&self) -> bool {
    self.need_more
  }

  /// Bytes consumed so far, meaningful only when `!needs_more()`.
  pub fn consumed(&self) -> usize {
    self.pos
  }

  fn remaining(&self) -> &'a [u8] {
    &self.buf[self.pos..]
  }

  pub fn varint(&mut self) -> Result<u64, ParseError> {
    if self.need_more {
      return Ok(0);
    }
    match read_varint(self.remaining()) {
      TentativeRead::Ok(v, n) => {
        self.pos += n;
        Ok(v)
      }
      TentativeRead::NeedMore => {
        self.need_more = true;
        Ok(0)
      }
      TentativeRead::Err(e) => Err(e),
    }
  }

  pub fn string(&mut self, max_len: u64) -> Result<String, ParseError> {
    if self.need_more {
      return Ok(String::new());
    }
    match read_string(self.remaining(), max_len) {
      TentativeRead::Ok(v, n) => {
        self.pos += n;
        Ok(v)
      }
      TentativeRead::NeedMore => {
        self.need_more = true;
        Ok(String::new())
      }
      TentativeRead::Err(e) => Err(e),
    }
  }

  pub fn bytes(&mut self, n: usize) -> &'a [u8] {
    if self.need_more || self.remaining().len() < n {
      self.need_more = true;
      return &[];
    }
    let out = &self.remaining()[..n];
    self.pos += n;
    out
  }

  pub fn byte(&mut self) -> Option<u8> {
    if self.need_more || self.remaining().is_empty() {
      self.need_more = true;
      return None;
    }
    let b = self.remaining()[0];
    self.pos += 1;
    Some(b)
  }

  pub fn i64_be(&mut self) -> i64 {
    let bytes = self.bytes(8);
    if bytes.len() < 8 {
      return 0;
    }
    read_i64_be(bytes)
  }

  pub fn f64_be(&mut self) -> f64 {
    let bytes = self.bytes(8);
    if bytes.len() < 8 {
      return 0.0;
    }
    read_f64_be(bytes)
  }
}

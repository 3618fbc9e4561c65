//! PostgreSQL COPY text format encoder.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

/// Builds COPY text: tab-separated fields, newline-terminated rows, `\N` for
/// NULL, with backslash, tab, newline and carriage return escaped.
#[derive(Debug, Default)]
pub struct CopyText {
    buf: BytesMut,
    rows: usize,
}

impl CopyText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(bytes),
            rows: 0,
        }
    }

    /// Appends one row. `None` fields are written as NULL.
    pub fn push_row<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                self.buf.put_u8(b'\t');
            }
            match field {
                Some(text) => self.buf.put_slice(escape(text.as_ref()).as_bytes()),
                None => self.buf.put_slice(b"\\N"),
            }
        }
        self.buf.put_u8(b'\n');
        self.rows += 1;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Escapes one field for COPY text format.
pub fn escape(field: &str) -> Cow<'_, str> {
    if !field.contains(['\\', '\t', '\n', '\r']) {
        return Cow::Borrowed(field);
    }
    let mut out = String::with_capacity(field.len() + 8);
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

//! Bencode decoding and encoding.
//!
//! The decoder is a single left-to-right scan with one byte of lookahead. While decoding the
//! root dictionary it records where the raw `info` value starts and ends, so the info-hash can be
//! computed over the exact bytes found in the file instead of a re-encoding.

use std::ops::Range;

use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("malformed bencode: unexpected end of input")]
    UnexpectedEof,
    #[error("malformed bencode: invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("malformed bencode: invalid string length at offset {0}")]
    InvalidStringLength(usize),
    #[error("malformed bencode: string of length {len} at offset {pos} overruns input")]
    StringOverrun { pos: usize, len: usize },
    #[error("malformed bencode: unexpected byte {byte:#04x} at offset {pos}")]
    UnexpectedByte { byte: u8, pos: usize },
    #[error("malformed bencode: dictionary key at offset {0} is not a string")]
    KeyNotString(usize),
    #[error("malformed bencode: trailing data at offset {0}")]
    TrailingData(usize),
    #[error("malformed bencode: nesting too deep")]
    NestingTooDeep,
}

/// A decoded bencode value. Dictionaries keep their keys in the order they were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }
}

/// Result of decoding a whole document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Value,
    /// Byte range of the raw `info` value inside the root dictionary, if present.
    pub info_span: Option<Range<usize>>,
}

pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    decode_document(data).map(|doc| doc.root)
}

pub fn decode_document(data: &[u8]) -> Result<Document, BencodeError> {
    let mut decoder = Decoder {
        data,
        pos: 0,
        info_span: None,
    };
    let root = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData(decoder.pos));
    }
    Ok(Document {
        root,
        info_span: decoder.info_span,
    })
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let token = &self.data[start..self.pos];
        self.pos += 1;

        let digits = token.strip_prefix(b"-").unwrap_or(token);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidInteger(
                String::from_utf8_lossy(token).into_owned(),
            ));
        }
        // token is ASCII at this point
        let text = String::from_utf8_lossy(token);
        text.parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| BencodeError::InvalidInteger(text.into_owned()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.peek()? {
                b':' => break,
                c @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((c - b'0') as usize))
                        .ok_or(BencodeError::InvalidStringLength(start))?;
                    self.pos += 1;
                }
                _ => return Err(BencodeError::InvalidStringLength(start)),
            }
        }
        self.pos += 1;

        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(BencodeError::StringOverrun { pos: start, len });
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = Vec::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::KeyNotString(self.pos));
            }
            let key = self.bytes()?;
            let value_start = self.pos;
            let value = self.value(depth + 1)?;
            if depth == 0 && key == b"info" && self.info_span.is_none() {
                self.info_span = Some(value_start..self.pos);
            }
            entries.push((key, value));
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, value) in entries {
                encode_bytes(key, out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

//! Schema-driven binary codec
//!
//! Every record on the wire starts with a one-byte type tag. The tag selects a
//! [`Schema`] from the [`SchemaRegistry`], and the schema's ordered field list
//! says exactly which primitives follow. Both ends build the same registry at
//! startup; nothing about the schema travels on the wire.
//!
//! All multi-byte values are little-endian. Strings are a `u16` byte length
//! followed by UTF-8 bytes, arrays are a `u16` element count followed by the
//! elements.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while encoding or decoding records
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("invalid utf-8 in string field at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("unknown type tag {tag}")]
    UnknownTag { tag: u8 },

    #[error("unknown section id {id}")]
    UnknownSection { id: u8 },

    #[error("tag {tag} is not allowed in section {section}")]
    UnexpectedTag { section: &'static str, tag: u8 },

    #[error("schema {schema} field {field}: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        schema: &'static str,
        field: &'static str,
        expected: Primitive,
        actual: Primitive,
    },

    #[error("schema {schema} expects {expected} fields, got {actual}")]
    FieldCount {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("schema {schema} has no field index {index}")]
    NoSuchField { schema: &'static str, index: u8 },

    #[error("type tag {tag} registered twice")]
    DuplicateTag { tag: u8 },

    #[error("{what} of length {len} does not fit its length prefix")]
    TooLong { what: &'static str, len: usize },
}

impl CodecError {
    /// Whether the error means the byte stream can no longer be trusted.
    ///
    /// A truncated buffer or garbage string bytes indicate a broken or hostile
    /// peer, and the connection should be dropped. An unknown tag or section
    /// only loses the rest of the packet it appeared in.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::Truncated { .. } | CodecError::InvalidUtf8 { .. }
        )
    }
}

/// Primitive field types the codec knows how to read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    U8,
    U16,
    U32,
    I32,
    F32,
    F64,
    Str,
    F32Array,
    U16Array,
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
    Str(String),
    F32Array(Vec<f32>),
    U16Array(Vec<u16>),
}

impl Value {
    pub fn primitive(&self) -> Primitive {
        match self {
            Value::Bool(_) => Primitive::Bool,
            Value::U8(_) => Primitive::U8,
            Value::U16(_) => Primitive::U16,
            Value::U32(_) => Primitive::U32,
            Value::I32(_) => Primitive::I32,
            Value::F32(_) => Primitive::F32,
            Value::F64(_) => Primitive::F64,
            Value::Str(_) => Primitive::Str,
            Value::F32Array(_) => Primitive::F32Array,
            Value::U16Array(_) => Primitive::U16Array,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::U8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// One named field in a schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub primitive: Primitive,
}

/// The ordered field list for one type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub tag: u8,
    pub name: &'static str,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(tag: u8, name: &'static str, fields: &[(&'static str, Primitive)]) -> Self {
        Self {
            tag,
            name,
            fields: fields
                .iter()
                .map(|&(name, primitive)| Field { name, primitive })
                .collect(),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<u8> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u8)
    }
}

/// Process-wide mapping from type tag to schema
///
/// Built once at startup and shared by reference; never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<u8, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Schema) -> Result<(), CodecError> {
        if self.schemas.contains_key(&schema.tag) {
            return Err(CodecError::DuplicateTag { tag: schema.tag });
        }
        self.schemas.insert(schema.tag, schema);
        Ok(())
    }

    pub fn get(&self, tag: u8) -> Result<&Schema, CodecError> {
        self.schemas.get(&tag).ok_or(CodecError::UnknownTag { tag })
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// A tagged, schema-ordered list of values
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tag: u8,
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(tag: u8, values: Vec<Value>) -> Self {
        Self { tag, values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Growable little-endian output buffer
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Bool(v) => self.write_u8(u8::from(*v)),
            Value::U8(v) => self.write_u8(*v),
            Value::U16(v) => self.write_u16(*v),
            Value::U32(v) => self.write_u32(*v),
            Value::I32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
            Value::Str(s) => {
                let len = u16::try_from(s.len()).map_err(|_| CodecError::TooLong {
                    what: "string",
                    len: s.len(),
                })?;
                self.write_u16(len);
                self.buf.extend_from_slice(s.as_bytes());
            }
            Value::F32Array(items) => {
                self.write_array_len(items.len())?;
                for v in items {
                    self.buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            Value::U16Array(items) => {
                self.write_array_len(items.len())?;
                for v in items {
                    self.write_u16(*v);
                }
            }
        }
        Ok(())
    }

    fn write_array_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u16::try_from(len).map_err(|_| CodecError::TooLong { what: "array", len })?;
        self.write_u16(len);
        Ok(())
    }
}

/// Cursor over an input buffer that refuses to read past its end
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_value(&mut self, primitive: Primitive) -> Result<Value, CodecError> {
        let value = match primitive {
            Primitive::Bool => Value::Bool(self.read_u8()? != 0),
            Primitive::U8 => Value::U8(self.read_u8()?),
            Primitive::U16 => Value::U16(self.read_u16()?),
            Primitive::U32 => Value::U32(self.read_u32()?),
            Primitive::I32 => Value::I32(i32::from_le_bytes(self.take_array()?)),
            Primitive::F32 => Value::F32(f32::from_le_bytes(self.take_array()?)),
            Primitive::F64 => Value::F64(f64::from_le_bytes(self.take_array()?)),
            Primitive::Str => {
                let len = self.read_u16()? as usize;
                let offset = self.pos;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { offset })?;
                Value::Str(s.to_string())
            }
            Primitive::F32Array => {
                let len = self.read_u16()? as usize;
                let mut items = Vec::with_capacity(len.min(self.remaining() / 4));
                for _ in 0..len {
                    items.push(f32::from_le_bytes(self.take_array()?));
                }
                Value::F32Array(items)
            }
            Primitive::U16Array => {
                let len = self.read_u16()? as usize;
                let mut items = Vec::with_capacity(len.min(self.remaining() / 2));
                for _ in 0..len {
                    items.push(self.read_u16()?);
                }
                Value::U16Array(items)
            }
        };
        Ok(value)
    }
}

/// Writes `record` as `[tag][fields...]`, checking it against its schema.
pub fn encode_record(
    registry: &SchemaRegistry,
    record: &Record,
    writer: &mut Writer,
) -> Result<(), CodecError> {
    let schema = registry.get(record.tag)?;
    if schema.fields.len() != record.values.len() {
        return Err(CodecError::FieldCount {
            schema: schema.name,
            expected: schema.fields.len(),
            actual: record.values.len(),
        });
    }
    for (field, value) in schema.fields.iter().zip(&record.values) {
        if field.primitive != value.primitive() {
            return Err(CodecError::SchemaMismatch {
                schema: schema.name,
                field: field.name,
                expected: field.primitive,
                actual: value.primitive(),
            });
        }
    }

    writer.write_u8(record.tag);
    for value in &record.values {
        writer.write_value(value)?;
    }
    Ok(())
}

/// Reads one `[tag][fields...]` record, consuming exactly what the schema declares.
pub fn decode_record(
    registry: &SchemaRegistry,
    reader: &mut Reader<'_>,
) -> Result<Record, CodecError> {
    let tag = reader.read_u8()?;
    let schema = registry.get(tag)?;
    let mut values = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        values.push(reader.read_value(field.primitive)?);
    }
    Ok(Record { tag, values })
}

/// Convenience wrapper producing a standalone byte vector.
pub fn encode(registry: &SchemaRegistry, record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new();
    encode_record(registry, record, &mut writer)?;
    Ok(writer.into_bytes())
}

/// Decodes a single record occupying the whole of `bytes`.
pub fn decode(registry: &SchemaRegistry, bytes: &[u8]) -> Result<Record, CodecError> {
    let mut reader = Reader::new(bytes);
    decode_record(registry, &mut reader)
}

//! Sectioned frames
//!
//! A frame is one transport message. It is a sequence of sections, each laid
//! out as `[sectionId:u8][itemCount:u8]{item}*`, so a single socket write can
//! carry everything one tick produced for a peer. Sections longer than 255
//! items are split into consecutive sections with the same id.

use crate::codec::{decode_record, encode_record, CodecError, Reader, Record, SchemaRegistry, Writer};
use crate::protocol::{is_entity_tag, Command, EngineMessage, EntityUpdate, Message, Request, Response};

const MAX_ITEMS_PER_SECTION: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectionId {
    EngineMessages = 0,
    Commands = 1,
    Requests = 2,
    Messages = 3,
    CreateEntities = 4,
    UpdateEntities = 5,
    DeleteEntities = 6,
    Responses = 7,
}

impl SectionId {
    pub fn from_u8(id: u8) -> Option<Self> {
        let section = match id {
            0 => SectionId::EngineMessages,
            1 => SectionId::Commands,
            2 => SectionId::Requests,
            3 => SectionId::Messages,
            4 => SectionId::CreateEntities,
            5 => SectionId::UpdateEntities,
            6 => SectionId::DeleteEntities,
            7 => SectionId::Responses,
            _ => return None,
        };
        Some(section)
    }
}

/// One decoded (or to-be-encoded) section
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Engine(Vec<EngineMessage>),
    Commands(Vec<Command>),
    Requests(Vec<Request>),
    Messages(Vec<Message>),
    Creates(Vec<Record>),
    Updates(Vec<EntityUpdate>),
    Deletes(Vec<u16>),
    Responses(Vec<Response>),
}

impl Section {
    pub fn id(&self) -> SectionId {
        match self {
            Section::Engine(_) => SectionId::EngineMessages,
            Section::Commands(_) => SectionId::Commands,
            Section::Requests(_) => SectionId::Requests,
            Section::Messages(_) => SectionId::Messages,
            Section::Creates(_) => SectionId::CreateEntities,
            Section::Updates(_) => SectionId::UpdateEntities,
            Section::Deletes(_) => SectionId::DeleteEntities,
            Section::Responses(_) => SectionId::Responses,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Section::Engine(items) => items.len(),
            Section::Commands(items) => items.len(),
            Section::Requests(items) => items.len(),
            Section::Messages(items) => items.len(),
            Section::Creates(items) => items.len(),
            Section::Updates(items) => items.len(),
            Section::Deletes(items) => items.len(),
            Section::Responses(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An ordered list of sections making up one transport message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub sections: Vec<Section>,
    /// Set when decoding stopped early on a recoverable error. Everything
    /// after the offending byte was dropped.
    pub discarded: Option<CodecError>,
    /// Items that decoded cleanly but do not belong in their section. They
    /// were left out and parsing carried on after them.
    pub skipped: Vec<CodecError>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a section, ignoring empty ones.
    pub fn push(&mut self, section: Section) {
        if !section.is_empty() {
            self.sections.push(section);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn engine_messages(&self) -> impl Iterator<Item = &EngineMessage> {
        self.sections.iter().flat_map(|s| match s {
            Section::Engine(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.sections.iter().flat_map(|s| match s {
            Section::Commands(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.sections.iter().flat_map(|s| match s {
            Section::Requests(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.sections.iter().flat_map(|s| match s {
            Section::Messages(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn creates(&self) -> impl Iterator<Item = &Record> {
        self.sections.iter().flat_map(|s| match s {
            Section::Creates(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = &EntityUpdate> {
        self.sections.iter().flat_map(|s| match s {
            Section::Updates(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &u16> {
        self.sections.iter().flat_map(|s| match s {
            Section::Deletes(items) => items.as_slice(),
            _ => &[][..],
        })
    }

    pub fn responses(&self) -> impl Iterator<Item = &Response> {
        self.sections.iter().flat_map(|s| match s {
            Section::Responses(items) => items.as_slice(),
            _ => &[][..],
        })
    }
}

fn write_update(
    registry: &SchemaRegistry,
    update: &EntityUpdate,
    writer: &mut Writer,
) -> Result<(), CodecError> {
    let schema = registry.get(update.tag)?;
    let field = schema
        .fields
        .get(update.field as usize)
        .ok_or(CodecError::NoSuchField {
            schema: schema.name,
            index: update.field,
        })?;
    if field.primitive != update.value.primitive() {
        return Err(CodecError::SchemaMismatch {
            schema: schema.name,
            field: field.name,
            expected: field.primitive,
            actual: update.value.primitive(),
        });
    }
    writer.write_u8(update.tag);
    writer.write_u16(update.nid);
    writer.write_u8(update.field);
    writer.write_value(&update.value)
}

fn read_update(registry: &SchemaRegistry, reader: &mut Reader<'_>) -> Result<EntityUpdate, CodecError> {
    let tag = reader.read_u8()?;
    let nid = reader.read_u16()?;
    let field = reader.read_u8()?;
    let schema = registry.get(tag)?;
    let primitive = schema
        .fields
        .get(field as usize)
        .ok_or(CodecError::NoSuchField {
            schema: schema.name,
            index: field,
        })?
        .primitive;
    let value = reader.read_value(primitive)?;
    Ok(EntityUpdate {
        tag,
        nid,
        field,
        value,
    })
}

fn write_items<T>(
    writer: &mut Writer,
    id: SectionId,
    items: &[T],
    mut write: impl FnMut(&T, &mut Writer) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    for chunk in items.chunks(MAX_ITEMS_PER_SECTION) {
        writer.write_u8(id as u8);
        writer.write_u8(chunk.len() as u8);
        for item in chunk {
            write(item, writer)?;
        }
    }
    Ok(())
}

/// Serialises every non-empty section of `frame`.
pub fn encode_frame(registry: &SchemaRegistry, frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer::new();
    for section in &frame.sections {
        let id = section.id();
        match section {
            Section::Engine(items) => write_items(&mut writer, id, items.as_slice(), |m, w| {
                encode_record(registry, &m.to_record(), w)
            })?,
            Section::Commands(items) => write_items(&mut writer, id, items.as_slice(), |c, w| {
                encode_record(registry, &c.to_record(), w)
            })?,
            Section::Requests(items) => write_items(&mut writer, id, items.as_slice(), |r, w| {
                encode_record(registry, &r.to_record(), w)
            })?,
            Section::Messages(items) => write_items(&mut writer, id, items.as_slice(), |m, w| {
                encode_record(registry, &m.to_record(), w)
            })?,
            Section::Creates(items) => {
                write_items(&mut writer, id, items.as_slice(), |r, w| encode_record(registry, r, w))?
            }
            Section::Updates(items) => {
                write_items(&mut writer, id, items.as_slice(), |u, w| write_update(registry, u, w))?
            }
            Section::Deletes(items) => write_items(&mut writer, id, items.as_slice(), |nid, w| {
                w.write_u16(*nid);
                Ok(())
            })?,
            Section::Responses(items) => write_items(&mut writer, id, items.as_slice(), |r, w| {
                encode_record(registry, &r.to_record(), w)
            })?,
        }
    }
    Ok(writer.into_bytes())
}

/// Reads `count` items with `read`, keeping what was decoded if a
/// recoverable error cuts the section short. `Ok(None)` items were consumed
/// but refused and are left out.
fn read_items<T>(
    reader: &mut Reader<'_>,
    count: u8,
    mut read: impl FnMut(&mut Reader<'_>) -> Result<Option<T>, CodecError>,
) -> Result<(Vec<T>, Option<CodecError>), CodecError> {
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match read(reader) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) if e.is_transport_fatal() => return Err(e),
            Err(e) => return Ok((items, Some(e))),
        }
    }
    Ok((items, None))
}

/// Typed conversion of a record that was already read in full.
fn keep<T>(converted: Result<T, CodecError>, skipped: &mut Vec<CodecError>) -> Option<T> {
    match converted {
        Ok(item) => Some(item),
        Err(e) => {
            skipped.push(e);
            None
        }
    }
}

/// Parses a whole frame.
///
/// Returns `Err` only for transport-fatal errors. A record whose tag is known
/// but not allowed in its section is skipped on its own, since its length is
/// known; it lands in [`Frame::skipped`]. An unknown section id or an unknown
/// type tag ends parsing there: sections decoded before it are returned and
/// the error is recorded in [`Frame::discarded`], since the stream cannot be
/// resynchronised mid-section.
pub fn decode_frame(registry: &SchemaRegistry, bytes: &[u8]) -> Result<Frame, CodecError> {
    let mut reader = Reader::new(bytes);
    let mut frame = Frame::new();
    let mut skipped = Vec::new();

    while !reader.is_empty() {
        let raw_id = reader.read_u8()?;
        let Some(id) = SectionId::from_u8(raw_id) else {
            frame.discarded = Some(CodecError::UnknownSection { id: raw_id });
            break;
        };
        let count = reader.read_u8()?;

        let (section, stopped) = match id {
            SectionId::EngineMessages => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    Ok(keep(EngineMessage::from_record(&record), &mut skipped))
                })?;
                (Section::Engine(items), stopped)
            }
            SectionId::Commands => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    Ok(keep(Command::from_record(&record), &mut skipped))
                })?;
                (Section::Commands(items), stopped)
            }
            SectionId::Requests => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    Ok(keep(Request::from_record(&record), &mut skipped))
                })?;
                (Section::Requests(items), stopped)
            }
            SectionId::Messages => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    Ok(keep(Message::from_record(&record), &mut skipped))
                })?;
                (Section::Messages(items), stopped)
            }
            SectionId::CreateEntities => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    let checked = if is_entity_tag(record.tag) {
                        Ok(record)
                    } else {
                        Err(CodecError::UnexpectedTag {
                            section: "create entities",
                            tag: record.tag,
                        })
                    };
                    Ok(keep(checked, &mut skipped))
                })?;
                (Section::Creates(items), stopped)
            }
            SectionId::UpdateEntities => {
                let (items, stopped) =
                    read_items(&mut reader, count, |r| read_update(registry, r).map(Some))?;
                (Section::Updates(items), stopped)
            }
            SectionId::DeleteEntities => {
                let (items, stopped) = read_items(&mut reader, count, |r| r.read_u16().map(Some))?;
                (Section::Deletes(items), stopped)
            }
            SectionId::Responses => {
                let (items, stopped) = read_items(&mut reader, count, |r| {
                    let record = decode_record(registry, r)?;
                    Ok(keep(Response::from_record(&record), &mut skipped))
                })?;
                (Section::Responses(items), stopped)
            }
        };

        frame.push(section);
        if stopped.is_some() {
            frame.discarded = stopped;
            break;
        }
    }

    frame.skipped = skipped;
    Ok(frame)
}

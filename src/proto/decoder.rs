//! Runtime protobuf decoder.
//!
//! [`ProtoDecoder`] is bound to one message type resolved from a
//! [`ProtoSchema`] and turns wire-encoded payloads into [`ProtoMessage`]
//! values. Decoding is stateless: one decoder may be shared across threads
//! and used for any number of payloads.

use crate::error::{Error, Result};
use crate::proto::parser::{ProtoFieldDescriptor, ProtoMessageDescriptor, ProtoSchema, ProtoType};
use protobuf::CodedInputStream;
use std::collections::HashMap;

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LENGTH_DELIMITED: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Represents a field value in a decoded protobuf message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoFieldValue {
    Double(f64),
    Float(f32),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Message(Box<ProtoMessage>),
    Repeated(Vec<ProtoFieldValue>),
}

/// Represents a decoded protobuf message.
///
/// Contains the message type name, decoded fields, and the schema descriptor
/// for field introspection. Fields left at their proto3 defaults are absent
/// from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMessage {
    /// Fully-qualified message type name
    pub message_type: String,
    /// Decoded field values by field name
    pub fields: HashMap<String, ProtoFieldValue>,
    /// Schema reference for field introspection
    pub descriptor: ProtoMessageDescriptor,
}

impl ProtoMessage {
    /// Get a decoded field value by name.
    pub fn get_field(&self, name: &str) -> Option<&ProtoFieldValue> {
        self.fields.get(name)
    }
}

/// Runtime protobuf decoder bound to a single message type.
pub struct ProtoDecoder {
    schema: ProtoSchema,
    descriptor: ProtoMessageDescriptor,
}

impl ProtoDecoder {
    /// Bind a decoder to `type_name` within `schema`.
    ///
    /// The name is looked up eagerly so an absent type surfaces here, not on
    /// the first payload.
    pub fn for_type(schema: ProtoSchema, type_name: &str) -> Result<Self> {
        let descriptor = schema
            .get_message(type_name)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        Ok(Self { schema, descriptor })
    }

    /// Fully-qualified name of the bound message type.
    pub fn message_type(&self) -> &str {
        &self.descriptor.name
    }

    /// Get a reference to the schema.
    pub fn schema(&self) -> &ProtoSchema {
        &self.schema
    }

    /// Decode a payload as the bound message type.
    pub fn decode(&self, data: &[u8]) -> Result<ProtoMessage> {
        let mut stream = CodedInputStream::from_bytes(data);
        self.decode_message(&self.descriptor, &mut stream)
    }

    fn decode_message(
        &self,
        descriptor: &ProtoMessageDescriptor,
        stream: &mut CodedInputStream,
    ) -> Result<ProtoMessage> {
        let mut fields = HashMap::new();

        loop {
            if stream
                .eof()
                .map_err(|e| Error::Decode(e.to_string()))?
            {
                break;
            }

            let tag = stream
                .read_raw_varint32()
                .map_err(|e| Error::Decode(e.to_string()))?;
            if tag == 0 {
                return Err(Error::Decode(format!(
                    "corrupt tag 0 in message {}",
                    descriptor.name
                )));
            }

            let field_number = (tag >> 3) as i32;
            let wire_type = tag & 0x7;

            // Unknown field numbers are skipped, not errors: a payload from
            // a newer schema revision still decodes the fields we know.
            let Some(field_desc) = descriptor.field_by_number(field_number) else {
                skip_field(stream, wire_type, descriptor, field_number)?;
                continue;
            };

            if field_desc.is_repeated {
                let entry = fields
                    .entry(field_desc.name.clone())
                    .or_insert_with(|| ProtoFieldValue::Repeated(Vec::new()));

                if let ProtoFieldValue::Repeated(values) = entry {
                    if wire_type == WIRE_LENGTH_DELIMITED && is_packable(&field_desc.field_type) {
                        // Packed encoding: a single length-delimited run of
                        // scalar values.
                        let len = stream
                            .read_raw_varint64()
                            .map_err(|e| Error::Decode(e.to_string()))?;
                        let old_limit = stream
                            .push_limit(len)
                            .map_err(|e| Error::Decode(e.to_string()))?;
                        while !stream.eof().map_err(|e| Error::Decode(e.to_string()))? {
                            values.push(self.decode_field_value(field_desc, stream)?);
                        }
                        stream.pop_limit(old_limit);
                    } else {
                        check_wire_type(field_desc, wire_type, &descriptor.name)?;
                        values.push(self.decode_field_value(field_desc, stream)?);
                    }
                }
                continue;
            }

            check_wire_type(field_desc, wire_type, &descriptor.name)?;
            let value = self.decode_field_value(field_desc, stream)?;
            fields.insert(field_desc.name.clone(), value);
        }

        Ok(ProtoMessage {
            message_type: descriptor.name.clone(),
            fields,
            descriptor: descriptor.clone(),
        })
    }

    fn decode_field_value(
        &self,
        field_desc: &ProtoFieldDescriptor,
        stream: &mut CodedInputStream,
    ) -> Result<ProtoFieldValue> {
        match &field_desc.field_type {
            ProtoType::Double => {
                let v = stream
                    .read_double()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Double(v))
            }
            ProtoType::Float => {
                let v = stream
                    .read_float()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Float(v))
            }
            ProtoType::Int32 => {
                let v = stream
                    .read_int32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int32(v))
            }
            ProtoType::Int64 => {
                let v = stream
                    .read_int64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int64(v))
            }
            ProtoType::Uint32 => {
                let v = stream
                    .read_uint32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Uint32(v))
            }
            ProtoType::Uint64 => {
                let v = stream
                    .read_uint64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Uint64(v))
            }
            ProtoType::Sint32 => {
                let v = stream
                    .read_sint32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int32(v))
            }
            ProtoType::Sint64 => {
                let v = stream
                    .read_sint64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int64(v))
            }
            ProtoType::Fixed32 => {
                let v = stream
                    .read_fixed32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Uint32(v))
            }
            ProtoType::Fixed64 => {
                let v = stream
                    .read_fixed64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Uint64(v))
            }
            ProtoType::Sfixed32 => {
                let v = stream
                    .read_sfixed32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int32(v))
            }
            ProtoType::Sfixed64 => {
                let v = stream
                    .read_sfixed64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int64(v))
            }
            ProtoType::Bool => {
                let v = stream
                    .read_bool()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Bool(v))
            }
            ProtoType::String => {
                let v = stream
                    .read_string()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::String(v))
            }
            ProtoType::Bytes => {
                let v = stream
                    .read_bytes()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Bytes(v.to_vec()))
            }
            ProtoType::Message(type_name) => {
                let len = stream
                    .read_raw_varint64()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                let old_limit = stream
                    .push_limit(len)
                    .map_err(|e| Error::Decode(e.to_string()))?;

                let nested_descriptor = self.schema.get_message(type_name).ok_or_else(|| {
                    Error::Decode(format!("unresolved message type reference {type_name}"))
                })?;
                let nested_message = self.decode_message(nested_descriptor, stream)?;

                stream.pop_limit(old_limit);

                Ok(ProtoFieldValue::Message(Box::new(nested_message)))
            }
            ProtoType::Enum(_) => {
                // Enum values travel as varint; represented by number
                let v = stream
                    .read_int32()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Ok(ProtoFieldValue::Int32(v))
            }
        }
    }
}

/// Wire type the declared field type must arrive with.
fn expected_wire_type(field_type: &ProtoType) -> u32 {
    match field_type {
        ProtoType::Int32
        | ProtoType::Int64
        | ProtoType::Uint32
        | ProtoType::Uint64
        | ProtoType::Sint32
        | ProtoType::Sint64
        | ProtoType::Bool
        | ProtoType::Enum(_) => WIRE_VARINT,
        ProtoType::Fixed64 | ProtoType::Sfixed64 | ProtoType::Double => WIRE_FIXED64,
        ProtoType::String | ProtoType::Bytes | ProtoType::Message(_) => WIRE_LENGTH_DELIMITED,
        ProtoType::Fixed32 | ProtoType::Sfixed32 | ProtoType::Float => WIRE_FIXED32,
    }
}

/// Whether values of this type may arrive in packed encoding.
fn is_packable(field_type: &ProtoType) -> bool {
    !matches!(
        field_type,
        ProtoType::String | ProtoType::Bytes | ProtoType::Message(_)
    )
}

fn check_wire_type(field_desc: &ProtoFieldDescriptor, wire_type: u32, message: &str) -> Result<()> {
    let expected = expected_wire_type(&field_desc.field_type);
    if wire_type != expected {
        return Err(Error::Decode(format!(
            "field {}.{} declared {} expects wire type {expected}, got {wire_type}",
            message, field_desc.name, field_desc.field_type
        )));
    }
    Ok(())
}

/// Skip a field we have no descriptor for.
fn skip_field(
    stream: &mut CodedInputStream,
    wire_type: u32,
    descriptor: &ProtoMessageDescriptor,
    field_number: i32,
) -> Result<()> {
    match wire_type {
        WIRE_VARINT => {
            stream
                .read_raw_varint64()
                .map_err(|e| Error::Decode(e.to_string()))?;
        }
        WIRE_FIXED64 => {
            stream
                .read_fixed64()
                .map_err(|e| Error::Decode(e.to_string()))?;
        }
        WIRE_LENGTH_DELIMITED => {
            stream
                .read_bytes()
                .map_err(|e| Error::Decode(e.to_string()))?;
        }
        WIRE_FIXED32 => {
            stream
                .read_fixed32()
                .map_err(|e| Error::Decode(e.to_string()))?;
        }
        other => {
            return Err(Error::Decode(format!(
                "unsupported wire type {other} for unknown field {field_number} in message {}",
                descriptor.name
            )));
        }
    }
    Ok(())
}

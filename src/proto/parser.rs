use crate::error::{Error, Result};
use protobuf::descriptor::{DescriptorProto, FileDescriptorProto, FileDescriptorSet};
use protobuf::Message;
use protobuf_parse::Parser;
use std::collections::HashMap;
use std::path::Path;

/// Represents a parsed protobuf schema.
///
/// The registry spans every file of the descriptor set, so a type declared
/// in one file may reference types declared in another.
#[derive(Debug, Clone)]
pub struct ProtoSchema {
    /// Map of fully-qualified message type names to their descriptors
    pub(crate) messages: HashMap<String, ProtoMessageDescriptor>,
}

/// Describes a protobuf message type.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMessageDescriptor {
    /// Fully qualified message name (e.g., "mypackage.MyMessage")
    pub name: String,
    /// Map of field names to their descriptors
    pub fields: HashMap<String, ProtoFieldDescriptor>,
    /// Ordered list of field names (preserves proto definition order)
    pub field_order: Vec<String>,
}

/// Describes a single field in a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoFieldDescriptor {
    /// Field name
    pub name: String,
    /// Field number (tag)
    pub number: i32,
    /// Field type
    pub field_type: ProtoType,
    /// Whether the field is repeated
    pub is_repeated: bool,
    /// Whether the field is optional
    pub is_optional: bool,
}

/// Protobuf field types.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoType {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    /// Nested message type, fully-qualified name
    Message(String),
    /// Enum type, fully-qualified name
    Enum(String),
}

impl std::fmt::Display for ProtoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoType::Double => write!(f, "double"),
            ProtoType::Float => write!(f, "float"),
            ProtoType::Int32 => write!(f, "int32"),
            ProtoType::Int64 => write!(f, "int64"),
            ProtoType::Uint32 => write!(f, "uint32"),
            ProtoType::Uint64 => write!(f, "uint64"),
            ProtoType::Sint32 => write!(f, "sint32"),
            ProtoType::Sint64 => write!(f, "sint64"),
            ProtoType::Fixed32 => write!(f, "fixed32"),
            ProtoType::Fixed64 => write!(f, "fixed64"),
            ProtoType::Sfixed32 => write!(f, "sfixed32"),
            ProtoType::Sfixed64 => write!(f, "sfixed64"),
            ProtoType::Bool => write!(f, "bool"),
            ProtoType::String => write!(f, "string"),
            ProtoType::Bytes => write!(f, "bytes"),
            ProtoType::Message(name) => write!(f, "message:{name}"),
            ProtoType::Enum(name) => write!(f, "enum:{name}"),
        }
    }
}

impl ProtoSchema {
    /// Build a schema from serialized `FileDescriptorSet` bytes.
    ///
    /// This is the entry point used when the schema arrives over the wire
    /// (e.g. from a topic metadata source). The bytes are borrowed only for
    /// the duration of the call.
    pub fn from_descriptor_set_bytes(bytes: &[u8]) -> Result<Self> {
        let set = FileDescriptorSet::parse_from_bytes(bytes)
            .map_err(|e| Error::Schema(e.to_string()))?;
        Self::from_file_descriptors(set.file)
    }

    /// Parse a .proto file and create a schema.
    ///
    /// Imports are resolved relative to the file's parent directory, and the
    /// descriptors of imported files are included in the registry.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_descriptors(parse_proto_file(path.as_ref())?)
    }

    /// Parse .proto file content from a string.
    pub fn from_string(content: &str) -> Result<Self> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        // Write content to a temporary file
        let mut temp_file = NamedTempFile::new()
            .map_err(|e| Error::Schema(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| Error::Schema(format!("Failed to write temp file: {e}")))?;

        Self::from_file(temp_file.path())
    }

    /// Build the combined registry from a set of file descriptors.
    ///
    /// Later files may reference types from earlier files (and vice versa);
    /// every message type of every file lands in one registry keyed by
    /// fully-qualified name, and references are resolved against that
    /// registry at decode time.
    pub(crate) fn from_file_descriptors(files: Vec<FileDescriptorProto>) -> Result<Self> {
        let mut messages = HashMap::new();

        for file in &files {
            let package = file.package.clone().unwrap_or_default();
            for message in &file.message_type {
                collect_message(&package, message, &mut messages)?;
            }
        }

        Ok(ProtoSchema { messages })
    }

    /// Get a message descriptor by fully-qualified name.
    ///
    /// A leading dot (the absolute-reference form used inside descriptors)
    /// is accepted and stripped.
    pub fn get_message(&self, name: &str) -> Option<&ProtoMessageDescriptor> {
        self.messages.get(name.strip_prefix('.').unwrap_or(name))
    }

    /// List all message type names in the schema.
    pub fn list_messages(&self) -> Vec<String> {
        self.messages.keys().cloned().collect()
    }
}

/// Convert .proto source into serialized `FileDescriptorSet` bytes.
///
/// This is the inverse of [`ProtoSchema::from_descriptor_set_bytes`] for
/// setups without a schema registry: parse the source once, then hand the
/// resulting bytes to a metadata source.
pub fn descriptor_set_from_source(content: &str) -> Result<Vec<u8>> {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let mut temp_file = NamedTempFile::new()
        .map_err(|e| Error::Schema(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|e| Error::Schema(format!("Failed to write temp file: {e}")))?;

    let mut set = FileDescriptorSet::new();
    set.file = parse_proto_file(temp_file.path())?;
    set.write_to_bytes().map_err(|e| Error::Schema(e.to_string()))
}

fn parse_proto_file(path: &Path) -> Result<Vec<FileDescriptorProto>> {
    let mut parser = Parser::new();
    parser.input(path);

    // Imports are looked up next to the input file
    if let Some(parent) = path.parent() {
        parser.include(parent);
    }

    let parsed = parser
        .parse_and_typecheck()
        .map_err(|e| Error::Schema(e.to_string()))?;

    Ok(parsed.file_descriptors)
}

/// Collect `message` and its nested declarations into the registry.
fn collect_message(
    scope: &str,
    message: &DescriptorProto,
    out: &mut HashMap<String, ProtoMessageDescriptor>,
) -> Result<()> {
    let simple_name = message.name.clone().unwrap_or_default();
    if simple_name.is_empty() {
        return Ok(());
    }
    let full_name = if scope.is_empty() {
        simple_name
    } else {
        format!("{scope}.{simple_name}")
    };

    for nested in &message.nested_type {
        collect_message(&full_name, nested, out)?;
    }

    let mut fields = HashMap::new();
    let mut field_order = Vec::new();

    for field in &message.field {
        let field_name = field.name.clone().unwrap_or_default();
        if field_name.is_empty() {
            continue;
        }
        field_order.push(field_name.clone());

        let field_type = parse_field_type(field)?;

        let descriptor = ProtoFieldDescriptor {
            name: field_name.clone(),
            number: field.number.unwrap_or(0),
            field_type,
            is_repeated: field.label
                == Some(
                    protobuf::descriptor::field_descriptor_proto::Label::LABEL_REPEATED.into(),
                ),
            is_optional: field.label
                == Some(
                    protobuf::descriptor::field_descriptor_proto::Label::LABEL_OPTIONAL.into(),
                ),
        };

        fields.insert(field_name, descriptor);
    }

    out.insert(
        full_name.clone(),
        ProtoMessageDescriptor {
            name: full_name,
            fields,
            field_order,
        },
    );

    Ok(())
}

fn parse_field_type(field: &protobuf::descriptor::FieldDescriptorProto) -> Result<ProtoType> {
    use protobuf::descriptor::field_descriptor_proto::Type;

    let field_type_enum_or_unknown = field
        .type_
        .ok_or_else(|| Error::Schema("Field missing type".to_string()))?;

    // Convert EnumOrUnknown to the enum value
    let field_type_enum = field_type_enum_or_unknown.enum_value_or_default();

    Ok(match field_type_enum {
        Type::TYPE_DOUBLE => ProtoType::Double,
        Type::TYPE_FLOAT => ProtoType::Float,
        Type::TYPE_INT64 => ProtoType::Int64,
        Type::TYPE_UINT64 => ProtoType::Uint64,
        Type::TYPE_INT32 => ProtoType::Int32,
        Type::TYPE_FIXED64 => ProtoType::Fixed64,
        Type::TYPE_FIXED32 => ProtoType::Fixed32,
        Type::TYPE_BOOL => ProtoType::Bool,
        Type::TYPE_STRING => ProtoType::String,
        Type::TYPE_MESSAGE => {
            let type_name = field.type_name.clone().unwrap_or_default();
            ProtoType::Message(normalize_type_name(&type_name))
        }
        Type::TYPE_BYTES => ProtoType::Bytes,
        Type::TYPE_UINT32 => ProtoType::Uint32,
        Type::TYPE_ENUM => {
            let type_name = field.type_name.clone().unwrap_or_default();
            ProtoType::Enum(normalize_type_name(&type_name))
        }
        Type::TYPE_SFIXED32 => ProtoType::Sfixed32,
        Type::TYPE_SFIXED64 => ProtoType::Sfixed64,
        Type::TYPE_SINT32 => ProtoType::Sint32,
        Type::TYPE_SINT64 => ProtoType::Sint64,
        Type::TYPE_GROUP => {
            return Err(Error::Schema(
                "TYPE_GROUP is Proto2 syntax only and deprecated hence not supported".to_string(),
            ))
        }
    })
}

/// Strip the leading dot of an absolute type reference.
fn normalize_type_name(name: &str) -> String {
    name.strip_prefix('.').unwrap_or(name).to_string()
}

impl ProtoMessageDescriptor {
    /// Get a field descriptor by name.
    pub fn get_field(&self, name: &str) -> Option<&ProtoFieldDescriptor> {
        self.fields.get(name)
    }

    /// Find a field descriptor by wire tag number.
    pub fn field_by_number(&self, number: i32) -> Option<&ProtoFieldDescriptor> {
        self.fields.values().find(|f| f.number == number)
    }

    /// List all field names in definition order.
    pub fn list_fields(&self) -> &[String] {
        &self.field_order
    }
}

//! Runtime protobuf schema and decoding.
//!
//! No code generation: schemas arrive as serialized descriptor sets (or
//! .proto source) and are turned into decoders at runtime.
//!
//! - [`parser`] builds the type registry
//! - [`decoder`] decodes payloads with a registry-bound message type
//! - [`json`] renders decoded messages as JSON

pub mod decoder;
pub mod json;
pub mod parser;

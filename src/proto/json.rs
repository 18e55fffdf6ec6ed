//! JSON view of decoded messages.
//!
//! Renders a [`ProtoMessage`] as a `serde_json::Value` keyed by field name,
//! for consumers that inspect dynamic payloads without caring about the
//! schema types. Bytes fields are base64-encoded; non-finite floats become
//! JSON null.

use base64::engine::general_purpose;
use base64::Engine;
use serde_json::Value;

use crate::proto::decoder::{ProtoFieldValue, ProtoMessage};

impl ProtoMessage {
    /// Render the decoded message as a JSON object.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for name in self.descriptor.list_fields() {
            if let Some(value) = self.fields.get(name) {
                map.insert(name.clone(), value.to_json());
            }
        }
        Value::Object(map)
    }
}

impl ProtoFieldValue {
    /// Render a single field value as JSON.
    pub fn to_json(&self) -> Value {
        match self {
            ProtoFieldValue::Double(v) => Value::from(*v),
            ProtoFieldValue::Float(v) => Value::from(*v),
            ProtoFieldValue::Int32(v) => Value::from(*v),
            ProtoFieldValue::Int64(v) => Value::from(*v),
            ProtoFieldValue::Uint32(v) => Value::from(*v),
            ProtoFieldValue::Uint64(v) => Value::from(*v),
            ProtoFieldValue::Bool(v) => Value::from(*v),
            ProtoFieldValue::String(v) => Value::from(v.clone()),
            ProtoFieldValue::Bytes(v) => Value::from(general_purpose::STANDARD.encode(v)),
            ProtoFieldValue::Message(m) => m.to_json(),
            ProtoFieldValue::Repeated(vs) => {
                Value::Array(vs.iter().map(ProtoFieldValue::to_json).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::decoder::ProtoDecoder;
    use crate::proto::parser::ProtoSchema;
    use protobuf::CodedOutputStream;

    #[test]
    fn test_message_to_json() {
        let schema = ProtoSchema::from_string(
            r#"
            syntax = "proto3";

            message Reading {
                string sensor = 1;
                double value = 2;
                repeated int32 samples = 3;
                bytes raw = 4;
            }
            "#,
        )
        .expect("Failed to parse proto");
        let decoder = ProtoDecoder::for_type(schema, "Reading").expect("Failed to bind decoder");

        let mut payload = Vec::new();
        {
            let mut stream = CodedOutputStream::vec(&mut payload);
            stream.write_string(1, "temp-1").unwrap();
            stream.write_double(2, 21.5).unwrap();
            stream.write_int32(3, 4).unwrap();
            stream.write_int32(3, 5).unwrap();
            stream.write_bytes(4, &[1, 2, 3]).unwrap();
            stream.flush().unwrap();
        }

        let json = decoder.decode(&payload).expect("Failed to decode").to_json();
        assert_eq!(json["sensor"], "temp-1");
        assert_eq!(json["value"], 21.5);
        assert_eq!(json["samples"], serde_json::json!([4, 5]));
        // [1, 2, 3] in standard base64
        assert_eq!(json["raw"], "AQID");
    }

    #[test]
    fn test_json_field_order_and_absent_fields() {
        let schema = ProtoSchema::from_string(
            r#"
            syntax = "proto3";

            message Sparse {
                string a = 1;
                string b = 2;
            }
            "#,
        )
        .expect("Failed to parse proto");
        let decoder = ProtoDecoder::for_type(schema, "Sparse").expect("Failed to bind decoder");

        let mut payload = Vec::new();
        {
            let mut stream = CodedOutputStream::vec(&mut payload);
            stream.write_string(2, "only-b").unwrap();
            stream.flush().unwrap();
        }

        let json = decoder.decode(&payload).expect("Failed to decode").to_json();
        let obj = json.as_object().expect("object expected");
        assert_eq!(obj.len(), 1);
        assert_eq!(json["b"], "only-b");
    }
}

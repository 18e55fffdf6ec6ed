use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed descriptor set: {0}")]
    Schema(String),

    #[error("Message type not found: {0}")]
    TypeNotFound(String),

    #[error("Protobuf decode error: {0}")]
    Decode(String),

    #[error("Subscription is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Topic metadata error: {0}")]
    Metadata(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CritError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Image file not found: {path}")]
    ImageNotFound { path: String },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("No memory images for process {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("Malformed pagemap: {reason}")]
    MalformedPagemap { reason: String },

    #[error("Corrupt page store: {reason}")]
    CorruptPageStore { reason: String },

    #[error("Invalid address range 0x{lo:x}-0x{hi:x}")]
    InvalidRange { lo: u64, hi: u64 },
}

pub type Result<T> = std::result::Result<T, CritError>;

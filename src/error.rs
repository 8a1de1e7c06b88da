//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid quantization range: {0}")]
    InvalidRange(String),

    #[error("Encoding has not been computed for this quantizer")]
    EncodingNotSet,

    #[error("Device mismatch: quantizer registered for {expected}, buffer resides on {got}")]
    DeviceMismatch { expected: String, got: String },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("No quantizer registered for handle {0}")]
    UnknownHandle(u64),

    #[error("Kernel execution failed: {0}")]
    Kernel(String),
}

pub type Result<T> = std::result::Result<T, Error>;

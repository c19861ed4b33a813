use thiserror::Error;

/// Hard failures surfaced by the engine.
///
/// Out-of-range indices are not errors: structural operations report them
/// through `bool` / `Option` return values and leave the stack untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A surface could not be allocated at the requested size.
    #[error("cannot allocate a {width}×{height} surface")]
    Allocation { width: u32, height: u32 },

    /// Unrecognised blend mode name or code. The previous mode is kept.
    #[error("invalid blend mode '{0}'")]
    InvalidBlendMode(String),

    /// Malformed or unsupported raster input.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EngineError::Serialize(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

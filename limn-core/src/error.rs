use thiserror::Error;

/// Failure to serialize a pixel buffer into a transport data URL.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode image container")]
    Image(#[from] image::ImageError),
}

/// Failure to turn a transport data URL back into a pixel buffer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing or malformed data URL header")]
    MalformedHeader,

    #[error("invalid base64 payload")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a parseable image container")]
    Image(#[from] image::ImageError),
}

/// Failure to resolve or load a model from the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported model identifier: {0}")]
    UnsupportedModel(String),

    #[error("failed to load model")]
    Load(#[source] anyhow::Error),
}

/// Failure of an underlying pipeline invocation. A single failing call
/// aborts the whole batch; no partial results are returned.
#[derive(Debug, Error)]
#[error("image generation failed: {0}")]
pub struct GenerationError(#[from] anyhow::Error);

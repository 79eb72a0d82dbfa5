//! Byte-level transport codec between pixel buffers and data URLs.
//!
//! The wire format is `data:image/<subtype>;base64,<payload>` where the
//! subtype is the lower-cased container format name and the payload is the
//! standard base64 encoding of the container bytes.

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::error::{DecodeError, EncodeError};

const BASE64_BLOCK: usize = 4;

/// Serializes the image into `format` and wraps the bytes in a data URL.
///
/// Lossless formats (PNG) round-trip pixel-exact through
/// [`data_url_to_image`].
pub fn image_to_data_url(image: &DynamicImage, format: ImageFormat) -> Result<String, EncodeError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), format)?;
    let payload = BASE64_STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", format.to_mime_type(), payload))
}

/// Parses a data URL back into a decoded pixel buffer.
///
/// Trailing base64 filler may have been stripped upstream, so the payload is
/// first restored to a multiple of four characters. The filler count is
/// `(4 - len % 4) % 4`: an already-aligned payload gets zero filler, never a
/// full redundant block.
pub fn data_url_to_image(data_url: &str) -> Result<DynamicImage, DecodeError> {
    let (header, payload) = data_url.split_once(',').ok_or(DecodeError::MalformedHeader)?;
    if !header.starts_with("data:") || !header.ends_with(";base64") {
        return Err(DecodeError::MalformedHeader);
    }

    let mut payload = payload.to_string();
    payload.push_str(&"=".repeat(padding_needed(payload.len())));

    let bytes = BASE64_STANDARD.decode(&payload)?;
    Ok(image::load_from_memory(&bytes)?)
}

fn padding_needed(payload_len: usize) -> usize {
    (BASE64_BLOCK - payload_len % BASE64_BLOCK) % BASE64_BLOCK
}

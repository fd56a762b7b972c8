use artarget_core::JobError;
use thiserror::Error;

use crate::settings::ValidationSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file is empty")]
    Empty,
    #[error("file is {actual} bytes, the limit is {max} bytes")]
    TooLarge { max: u64, actual: u64 },
    #[error("unsupported file type {found}")]
    UnsupportedType { found: String },
    #[error("could not read image dimensions")]
    UnreadableHeader,
    #[error("image is {width}x{height}, expected between {min_width}x{min_height} and {max_width}x{max_height}")]
    Dimensions {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
        max_width: u32,
        max_height: u32,
    },
}

impl From<ValidationError> for JobError {
    fn from(err: ValidationError) -> Self {
        JobError::validation(err.to_string())
    }
}

/// What validation learned about an accepted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Checks size, type and pixel dimensions of an image upload.
///
/// The type comes from the file signature; the name's extension is only
/// consulted when the signature is not recognized.
pub fn validate_image(
    name: &str,
    bytes: &[u8],
    settings: &ValidationSettings,
) -> Result<ImageInfo, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    let actual = bytes.len() as u64;
    if actual > settings.max_bytes {
        return Err(ValidationError::TooLarge {
            max: settings.max_bytes,
            actual,
        });
    }

    let content_type = sniff_content_type(bytes)
        .map(str::to_string)
        .or_else(|| mime_guess::from_path(name).first_raw().map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if !settings
        .allowed_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
    {
        return Err(ValidationError::UnsupportedType {
            found: content_type,
        });
    }

    let (width, height) = dimensions(bytes).ok_or(ValidationError::UnreadableHeader)?;
    if width < settings.min_width
        || height < settings.min_height
        || width > settings.max_width
        || height > settings.max_height
    {
        return Err(ValidationError::Dimensions {
            width,
            height,
            min_width: settings.min_width,
            min_height: settings.min_height,
            max_width: settings.max_width,
            max_height: settings.max_height,
        });
    }

    Ok(ImageInfo {
        content_type,
        width,
        height,
    })
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PNG_SIGNATURE) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.starts_with(PNG_SIGNATURE) {
        png_dimensions(bytes)
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        jpeg_dimensions(bytes)
    } else {
        None
    }
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    // IHDR is always the first chunk.
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes.get(16..20)?.try_into().ok()?);
    let height = u32::from_be_bytes(bytes.get(20..24)?.try_into().ok()?);
    Some((width, height))
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if matches!(marker, 0xD8 | 0x01 | 0xD0..=0xD7) {
            pos += 2;
            continue;
        }
        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let segment = bytes.get(pos + 4..pos + 9)?;
            let height = u16::from_be_bytes([segment[1], segment[2]]) as u32;
            let width = u16::from_be_bytes([segment[3], segment[4]]) as u32;
            return Some((width, height));
        }
        if len < 2 {
            return None;
        }
        pos += 2 + len;
    }
    None
}

use crate::errors::{AppError, AppResult};
use crate::models::NoteImage;
use base64::Engine;
use uuid::Uuid;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_IMAGE_DIMENSION: u32 = 10_000;

const ALLOWED_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/webp", "image/gif"];

/// An image picked by the user, not yet hosted. Until the upload returns,
/// the note shows it through an inline data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub uuid: Uuid,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn placeholder(&self) -> NoteImage {
        NoteImage {
            uuid: self.uuid,
            url: format!(
                "data:{};base64,{}",
                self.content_type,
                base64::engine::general_purpose::STANDARD.encode(&self.bytes)
            ),
        }
    }
}

pub fn validate_image_upload(upload: &ImageUpload) -> AppResult<()> {
    let content_type = upload.content_type.to_ascii_lowercase();
    if !ALLOWED_TYPES.contains(&content_type.as_str()) {
        return Err(AppError::Validation(format!(
            "Unsupported image type {}",
            upload.content_type
        )));
    }
    if upload.bytes.is_empty() {
        return Err(AppError::Validation("Image is empty".to_string()));
    }
    if upload.bytes.len() > MAX_IMAGE_BYTES {
        return Err(AppError::Validation(format!(
            "Image exceeds {} MB",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    if sniff_type(&upload.bytes).is_some_and(|sniffed| sniffed != content_type) {
        return Err(AppError::Validation("Image content does not match its type".to_string()));
    }
    if let Some((width, height)) = dimensions(&upload.bytes) {
        if width == 0 || height == 0 || width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
            return Err(AppError::Validation(format!(
                "Image dimensions {}x{} are not supported",
                width, height
            )));
        }
    }
    Ok(())
}

pub fn is_placeholder_url(url: &str) -> bool {
    url.starts_with("data:")
}

fn sniff_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
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

/// Width and height from the PNG IHDR chunk or the GIF logical screen
/// descriptor. Other formats are not inspected.
fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    match sniff_type(bytes)? {
        "image/png" if bytes.len() >= 24 => {
            let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
            let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
            Some((width, height))
        }
        "image/gif" if bytes.len() >= 10 => {
            let width = u16::from_le_bytes([bytes[6], bytes[7]]) as u32;
            let height = u16::from_le_bytes([bytes[8], bytes[9]]) as u32;
            Some((width, height))
        }
        _ => None,
    }
}

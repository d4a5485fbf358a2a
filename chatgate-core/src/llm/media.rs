//! Media input for one-off analysis calls

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GateError;

/// Output cap for media analysis replies
pub const MEDIA_MAX_OUTPUT_TOKENS: usize = 1024;

/// What kind of upload is being analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

impl MediaKind {
    /// Instruction sent alongside the bytes
    pub fn instruction(self) -> &'static str {
        match self {
            MediaKind::Image => {
                "Describe what you see in this image briefly but accurately. Keep your response under 2000 characters."
            }
            MediaKind::Video => {
                "Describe what's happening in this video briefly but accurately. Keep your response under 2000 characters."
            }
            MediaKind::Audio => {
                "Transcribe and analyze this audio content briefly. Keep your response under 2000 characters."
            }
        }
    }

    /// Whether `mime_type` is a valid upload for this kind
    pub fn accepts(self, mime_type: &str) -> bool {
        let prefix = match self {
            MediaKind::Image => "image/",
            MediaKind::Video => "video/",
            MediaKind::Audio => "audio/",
        };
        mime_type.to_ascii_lowercase().starts_with(prefix)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            other => Err(GateError::Other(format!("Unknown media kind '{}'", other))),
        }
    }
}

/// Raw bytes plus their MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPart {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl MediaPart {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// MIME type for a file by extension, for the formats the service accepts
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mpeg" | "mpg" => "video/mpeg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        _ => return None,
    };
    Some(mime)
}

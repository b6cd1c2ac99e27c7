//! Per-kind task payloads.
//!
//! Payloads are stored as JSON next to the task's `pipeline_kind`, so the
//! serialized form carries no tag. Parsing always goes through
//! [`TaskPayload::from_value`], which picks the shape from the kind and
//! fills in platform defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PipelineKind;
use crate::{Error, Result};

/// Maximum reference images accepted by image-to-image.
pub const MAX_IMG2IMG_IMAGES: usize = 6;

const MAX_DURATION_SECS: u32 = 30;

fn default_image_model() -> String {
    "Image 3.1".to_string()
}

fn default_video_model() -> String {
    "Video 3.0".to_string()
}

fn default_ratio() -> String {
    "1:1".to_string()
}

fn default_video_ratio() -> String {
    "16:9".to_string()
}

fn default_quality() -> String {
    "1K".to_string()
}

fn default_duration() -> u32 {
    5
}

fn default_resolution_1080p() -> String {
    "1080p".to_string()
}

fn default_resolution_720p() -> String {
    "720p".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Text2ImgPayload {
    pub prompt: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_ratio")]
    pub ratio: String,
    #[serde(default = "default_quality")]
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Img2ImgPayload {
    pub prompt: String,
    pub images: Vec<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_ratio")]
    pub ratio: String,
    #[serde(default = "default_quality")]
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Img2VideoPayload {
    pub image_path: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_video_model")]
    pub model: String,
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    #[serde(default = "default_resolution_1080p")]
    pub resolution: String,
    /// Qingying only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_mode: Option<String>,
    /// Qingying only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    /// Qingying only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_audio: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Text2VideoPayload {
    pub prompt: String,
    #[serde(default = "default_video_model")]
    pub model: String,
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    #[serde(default = "default_resolution_720p")]
    pub resolution: String,
    #[serde(default = "default_video_ratio")]
    pub ratio: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirstLastFramePayload {
    pub first_frame_path: String,
    pub last_frame_path: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_video_model")]
    pub model: String,
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    #[serde(default = "default_resolution_1080p")]
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigitalHumanPayload {
    pub image_path: String,
    pub audio_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_description: Option<String>,
}

/// Validated input of a task, one variant per pipeline kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskPayload {
    Text2Img(Text2ImgPayload),
    Img2Img(Img2ImgPayload),
    Img2Video(Img2VideoPayload),
    Text2Video(Text2VideoPayload),
    FirstLastFrame(FirstLastFramePayload),
    DigitalHuman(DigitalHumanPayload),
}

fn parse_shape<T: serde::de::DeserializeOwned>(kind: PipelineKind, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("invalid {} payload: {}", kind, e)))
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn check_duration(duration_secs: u32) -> Result<()> {
    if duration_secs == 0 || duration_secs > MAX_DURATION_SECS {
        return Err(Error::validation(format!(
            "duration_secs must be between 1 and {}",
            MAX_DURATION_SECS
        )));
    }
    Ok(())
}

impl TaskPayload {
    /// Parse and validate a raw JSON payload for `kind`.
    pub fn from_value(kind: PipelineKind, value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::validation(format!(
                "{} payload must be a JSON object",
                kind
            )));
        }

        let payload = match kind {
            PipelineKind::Text2Img => Self::Text2Img(parse_shape(kind, value)?),
            PipelineKind::Img2Img => Self::Img2Img(parse_shape(kind, value)?),
            PipelineKind::Img2Video => Self::Img2Video(parse_shape(kind, value)?),
            PipelineKind::Text2Video => Self::Text2Video(parse_shape(kind, value)?),
            PipelineKind::FirstLastFrameImg2Video => {
                Self::FirstLastFrame(parse_shape(kind, value)?)
            }
            PipelineKind::DigitalHuman => Self::DigitalHuman(parse_shape(kind, value)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Parse a payload previously written by this crate.
    pub fn from_json(kind: PipelineKind, json: &str) -> Result<Self> {
        Self::from_value(kind, serde_json::from_str(json)?)
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Text2Img(_) => PipelineKind::Text2Img,
            Self::Img2Img(_) => PipelineKind::Img2Img,
            Self::Img2Video(_) => PipelineKind::Img2Video,
            Self::Text2Video(_) => PipelineKind::Text2Video,
            Self::FirstLastFrame(_) => PipelineKind::FirstLastFrameImg2Video,
            Self::DigitalHuman(_) => PipelineKind::DigitalHuman,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Text2Img(p) => require_non_empty("prompt", &p.prompt),
            Self::Img2Img(p) => {
                require_non_empty("prompt", &p.prompt)?;
                if p.images.is_empty() || p.images.len() > MAX_IMG2IMG_IMAGES {
                    return Err(Error::validation(format!(
                        "images must contain between 1 and {} paths",
                        MAX_IMG2IMG_IMAGES
                    )));
                }
                p.images
                    .iter()
                    .try_for_each(|path| require_non_empty("images[]", path))
            }
            Self::Img2Video(p) => {
                require_non_empty("image_path", &p.image_path)?;
                check_duration(p.duration_secs)
            }
            Self::Text2Video(p) => {
                require_non_empty("prompt", &p.prompt)?;
                check_duration(p.duration_secs)
            }
            Self::FirstLastFrame(p) => {
                require_non_empty("first_frame_path", &p.first_frame_path)?;
                require_non_empty("last_frame_path", &p.last_frame_path)?;
                check_duration(p.duration_secs)
            }
            Self::DigitalHuman(p) => {
                require_non_empty("image_path", &p.image_path)?;
                require_non_empty("audio_path", &p.audio_path)
            }
        }
    }

    /// Text prompt, if the kind has one.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Text2Img(p) => Some(&p.prompt),
            Self::Img2Img(p) => Some(&p.prompt),
            Self::Img2Video(p) => Some(&p.prompt),
            Self::Text2Video(p) => Some(&p.prompt),
            Self::FirstLastFrame(p) => Some(&p.prompt),
            Self::DigitalHuman(p) => p.action_description.as_deref(),
        }
    }

    /// Local files the payload references.
    pub fn input_files(&self) -> Vec<&str> {
        match self {
            Self::Text2Img(_) | Self::Text2Video(_) => Vec::new(),
            Self::Img2Img(p) => p.images.iter().map(String::as_str).collect(),
            Self::Img2Video(p) => vec![p.image_path.as_str()],
            Self::FirstLastFrame(p) => {
                vec![p.first_frame_path.as_str(), p.last_frame_path.as_str()]
            }
            Self::DigitalHuman(p) => vec![p.image_path.as_str(), p.audio_path.as_str()],
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

//! Pipeline kinds and the platforms that serve them.

use serde::{Deserialize, Serialize};

/// The six generation pipelines.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum PipelineKind {
    #[serde(rename = "text2img")]
    #[strum(serialize = "text2img")]
    Text2Img,
    #[serde(rename = "img2img")]
    #[strum(serialize = "img2img")]
    Img2Img,
    #[serde(rename = "img2video")]
    #[strum(serialize = "img2video")]
    Img2Video,
    #[serde(rename = "text2video")]
    #[strum(serialize = "text2video")]
    Text2Video,
    #[serde(rename = "first_last_frame_img2video")]
    #[strum(serialize = "first_last_frame_img2video")]
    FirstLastFrameImg2Video,
    #[serde(rename = "digital_human")]
    #[strum(serialize = "digital_human")]
    DigitalHuman,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 6] = [
        Self::Text2Img,
        Self::Img2Img,
        Self::Img2Video,
        Self::Text2Video,
        Self::FirstLastFrameImg2Video,
        Self::DigitalHuman,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text2Img => "text2img",
            Self::Img2Img => "img2img",
            Self::Img2Video => "img2video",
            Self::Text2Video => "text2video",
            Self::FirstLastFrameImg2Video => "first_last_frame_img2video",
            Self::DigitalHuman => "digital_human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Platform used when a task does not name one.
    pub fn default_platform(&self) -> Platform {
        Platform::Jimeng
    }

    /// Whether tasks of this kind may run on `platform`.
    pub fn supports(&self, platform: Platform) -> bool {
        match platform {
            Platform::Jimeng => true,
            Platform::Qingying => matches!(self, Self::Img2Video),
        }
    }

    /// Suffix used for per-kind environment variables (`GENFLOW_EXECUTOR_TEXT2IMG`).
    pub fn env_suffix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    /// Payload field that receives the image path on folder import.
    pub fn folder_image_field(&self) -> Option<&'static str> {
        match self {
            Self::Img2Img => Some("images"),
            Self::Img2Video => Some("image_path"),
            _ => None,
        }
    }
}

/// Third-party creative platform an account belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Jimeng,
    Qingying,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Self::Jimeng, Self::Qingying];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jimeng => "jimeng",
            Self::Qingying => "qingying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jimeng" => Some(Self::Jimeng),
            "qingying" => Some(Self::Qingying),
            _ => None,
        }
    }

    /// Labels of the identifier and secret columns in bulk account text.
    pub fn credential_labels(&self) -> (&'static str, &'static str) {
        match self {
            Self::Jimeng => ("account", "password"),
            Self::Qingying => ("nickname", "phone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in PipelineKind::ALL {
            assert_eq!(PipelineKind::parse(kind.as_str()), Some(kind));
            assert_eq!(PipelineKind::from_str(&kind.to_string()).ok(), Some(kind));
        }
        assert_eq!(PipelineKind::parse("img2txt"), None);
    }

    #[test]
    fn test_kind_serde_name() {
        let json = serde_json::to_string(&PipelineKind::FirstLastFrameImg2Video).unwrap();
        assert_eq!(json, "\"first_last_frame_img2video\"");
    }

    #[test]
    fn test_platform_support() {
        assert!(PipelineKind::Img2Video.supports(Platform::Qingying));
        assert!(!PipelineKind::Text2Img.supports(Platform::Qingying));
        assert!(PipelineKind::DigitalHuman.supports(Platform::Jimeng));
    }

    #[test]
    fn test_env_suffix() {
        assert_eq!(PipelineKind::DigitalHuman.env_suffix(), "DIGITAL_HUMAN");
    }
}

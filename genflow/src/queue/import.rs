//! Turning spreadsheet rows and image folders into task payloads.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::domain::{PipelineKind, Platform};
use crate::{Error, Result};

/// Image extensions picked up by folder import.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// Column aliases found in exported task tables.
const FIELD_ALIASES: [(&str, &str); 4] = [
    ("second", "duration_secs"),
    ("duration", "duration_secs"),
    ("image", "image_path"),
    ("audio", "audio_path"),
];

const INTEGER_FIELDS: [&str; 2] = ["duration_secs", "frame_rate"];

/// A table row split into its target platform and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub platform: Option<Platform>,
    pub payload: Value,
}

/// Normalize a loose table row: trims strings, drops empty cells, applies
/// column aliases, coerces numeric cells and splits `images` lists.
pub fn normalize_row(kind: PipelineKind, row: &Value) -> Result<NormalizedRow> {
    let Value::Object(cells) = row else {
        return Err(Error::validation("row must be an object"));
    };

    let mut payload = Map::new();
    let mut platform = None;
    for (key, value) in cells {
        let key = FIELD_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key.as_str())
            .map(|(_, field)| *field)
            .unwrap_or(key.as_str());

        let value = match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    continue;
                }
                Value::String(trimmed.to_string())
            }
            Value::Null => continue,
            other => other.clone(),
        };

        if key == "platform" {
            let name = value.as_str().unwrap_or_default();
            platform = Some(
                Platform::parse(name)
                    .ok_or_else(|| Error::validation(format!("unknown platform '{}'", name)))?,
            );
            continue;
        }

        let value = if INTEGER_FIELDS.contains(&key) {
            coerce_integer(key, value)?
        } else if key == "images" && kind == PipelineKind::Img2Img {
            split_list(value)
        } else if key == "ai_audio" {
            coerce_bool(value)
        } else {
            value
        };
        payload.insert(key.to_string(), value);
    }

    Ok(NormalizedRow {
        platform,
        payload: Value::Object(payload),
    })
}

fn coerce_integer(field: &str, value: Value) -> Result<Value> {
    match &value {
        Value::Number(_) => Ok(value),
        Value::String(s) => s
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| Value::from(n.round() as u64))
            .ok_or_else(|| Error::validation(format!("{} must be a number, got '{}'", field, s))),
        _ => Err(Error::validation(format!("{} must be a number", field))),
    }
}

fn coerce_bool(value: Value) -> Value {
    match &value {
        Value::String(s) => Value::Bool(matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|n| n != 0.0)),
        _ => value,
    }
}

fn split_list(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Array(
            s.split([',', ';', '\n'])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| Value::String(p.to_string()))
                .collect(),
        ),
        other => other,
    }
}

/// First referenced file that does not exist, if any.
pub async fn first_missing_file<'a>(paths: &[&'a str]) -> Option<&'a str> {
    for path in paths {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Some(*path);
        }
    }
    None
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Image files directly inside `folder`, sorted by file name.
pub async fn list_folder_images(folder: &Path) -> Result<Vec<PathBuf>> {
    if !tokio::fs::metadata(folder)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(Error::validation(format!(
            "folder '{}' does not exist",
            folder.display()
        )));
    }

    let mut entries = tokio::fs::read_dir(folder).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Payload for one folder image: the template with the kind's image field set.
pub fn folder_payload(kind: PipelineKind, template: &Value, image: &Path) -> Result<Value> {
    let field = kind.folder_image_field().ok_or_else(|| {
        Error::validation(format!("{} does not take image inputs from a folder", kind))
    })?;
    let mut payload = match template {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(Error::validation("template must be an object")),
    };
    let path = Value::String(image.to_string_lossy().into_owned());
    let value = if kind == PipelineKind::Img2Img {
        Value::Array(vec![path])
    } else {
        path
    };
    payload.insert(field.to_string(), value);
    Ok(Value::Object(payload))
}

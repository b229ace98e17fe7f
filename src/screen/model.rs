//! Screen frame types and image header sniffing.

use axum::body::Bytes;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::Error;

/// Latest captured screen of a runner. Only the newest one is kept.
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    pub runner_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Per-runner, increases by one with each accepted frame.
    pub sequence: u64,
}

/// `POST /runners/{id}/screen/frame` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameUpload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Zero means "sniff from the image header".
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Image bytes (base64 in JSON).
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub image: Vec<u8>,
}

impl FrameUpload {
    /// Turn an upload into a frame for `runner_id`. The sequence is assigned
    /// by the hub.
    pub fn into_frame(self, runner_id: Uuid) -> Result<ScreenFrame, Error> {
        if self.image.is_empty() {
            return Err(Error::Validation("screen frame image is empty".into()));
        }
        if self.runner_id.is_some_and(|id| id != runner_id) {
            return Err(Error::Validation(
                "runner_id in body does not match the path".into(),
            ));
        }
        let (width, height) = match (self.width, self.height) {
            (0, _) | (_, 0) => image_dimensions(&self.image).unwrap_or((0, 0)),
            dims => dims,
        };
        Ok(ScreenFrame {
            runner_id,
            captured_at: self.timestamp.unwrap_or_else(Utc::now),
            data: Bytes::from(self.image),
            width,
            height,
            sequence: 0,
        })
    }
}

/// `GET /runners/{id}/screen/status` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenStatus {
    pub runner_id: Uuid,
    pub last_frame_at: Option<DateTime<Utc>>,
    /// Whether the last frame is younger than the freshness threshold.
    pub live: bool,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub viewer_count: usize,
}

/// Width and height from a PNG or JPEG header.
pub fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    if data.starts_with(PNG_SIGNATURE) {
        // IHDR is always the first chunk.
        if data.len() < 24 || &data[12..16] != b"IHDR" {
            return None;
        }
        let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
        let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
        return Some((width, height));
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return jpeg_dimensions(data);
    }
    None
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        // Fill bytes.
        if marker == 0xFF {
            i += 1;
            continue;
        }
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[i + 5], data[i + 6]]) as u32;
            let width = u16::from_be_bytes([data[i + 7], data[i + 8]]) as u32;
            return Some((width, height));
        }
        i += 2 + len;
    }
    None
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    serializer.serialize_str(&encoded)
}

fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(&s)
        .map_err(serde::de::Error::custom)
}

//! Text envelope codec.
//!
//! An envelope is a flat JSON object of scalars. Camera frames travel inside
//! it as base64 (standard alphabet) strings of a JPEG image; an empty string
//! marks an absent frame.

use crate::error::CodecError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One scalar value on the wire.
///
/// Variant order matters for deserialization: JSON integers land in `Int`,
/// anything with a fraction or exponent in `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

pub type Envelope = BTreeMap<String, FieldValue>;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    // serde_json would silently turn NaN/inf into `null`
    if let Some((key, _)) = envelope
        .iter()
        .find(|(_, v)| matches!(v, FieldValue::Float(f) if !f.is_finite()))
    {
        return Err(CodecError::NonFinite(key.clone()));
    }
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text)?)
}

/// Keys of `map` that start with `prefix`, with the prefix stripped.
/// Keys without the prefix are left out.
pub fn split<V: Clone>(prefix: &str, map: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

pub fn join<V>(prefix: &str, map: BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.into_iter()
        .map(|(k, v)| (format!("{prefix}{k}"), v))
        .collect()
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(jpeg)
}

/// JPEG-compress and base64-armor one camera frame.
pub fn encode_frame(frame: &RgbImage, quality: u8) -> Result<String, CodecError> {
    Ok(STANDARD.encode(encode_jpeg(frame, quality)?))
}

/// Inverse of [`encode_frame`]. Anything that does not decode to an image is
/// treated as an absent frame.
pub fn decode_frame(armored: &str) -> Option<RgbImage> {
    if armored.is_empty() {
        return None;
    }
    let jpeg = match STANDARD.decode(armored) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("camera frame is not valid base64: {e}");
            return None;
        }
    };
    match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
        Ok(img) => Some(img.to_rgb8()),
        Err(e) => {
            tracing::debug!("camera frame failed to decode: {e}");
            None
        }
    }
}

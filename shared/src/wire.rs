//! Typed command / observation payloads and their mapping onto the flat,
//! prefixed wire envelope.
//!
//! Prefixed keys only exist at this boundary. `from_envelope` demultiplexes
//! straight into per-unit maps; nothing past it sees `arm1_...` keys.

use crate::codec::{self, Envelope, FieldValue};
use crate::error::CodecError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key prefix (after the unit prefix) of the action a unit actually applied.
pub const APPLIED_ACTION_PREFIX: &str = "action.";

/// Name of one actuator unit. Its wire prefix is `"<name>_"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId(String);

impl UnitId {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() {
            return Err("unit name must not be empty".into());
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!(
                "unit name `{name}` may only contain ASCII letters, digits and '-'"
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key_prefix(&self) -> String {
        format!("{}_", self.0)
    }
}

impl TryFrom<String> for UnitId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UnitId::new(value)
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Actuator channel -> target value for one unit.
pub type Action = BTreeMap<String, f64>;

/// Joints of the five-DoF arms (plus gripper) used on both ends.
pub const ARM_JOINTS: [&str; 6] = [
    "shoulder_pan",
    "shoulder_lift",
    "elbow_flex",
    "wrist_flex",
    "wrist_roll",
    "gripper",
];

/// Position channel names, `"<joint>.pos"`, in `ARM_JOINTS` order.
pub fn arm_position_features() -> Vec<String> {
    ARM_JOINTS.iter().map(|j| format!("{j}.pos")).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub units: BTreeMap<UnitId, Action>,
}

impl Command {
    pub fn action(&self, unit: &UnitId) -> Option<&Action> {
        self.units.get(unit)
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut env = Envelope::new();
        for (unit, action) in &self.units {
            let fields = action
                .iter()
                .map(|(k, v)| (k.clone(), FieldValue::Float(*v)))
                .collect();
            env.extend(codec::join(&unit.key_prefix(), fields));
        }
        env
    }

    /// Fails on any non-numeric value of a known unit and on envelopes that
    /// mention none of `units`. Keys of other units are ignored.
    pub fn from_envelope(env: &Envelope, units: &[UnitId]) -> Result<Self, CodecError> {
        let mut out = BTreeMap::new();
        for unit in units {
            let prefix = unit.key_prefix();
            let fields = codec::split(&prefix, env);
            if fields.is_empty() {
                continue;
            }
            let mut action = Action::new();
            for (key, value) in fields {
                let v = value.as_f64().ok_or_else(|| CodecError::UnexpectedType {
                    key: format!("{prefix}{key}"),
                    expected: "number",
                })?;
                action.insert(key, v);
            }
            out.insert(unit.clone(), action);
        }
        if out.is_empty() {
            return Err(CodecError::NoKnownUnit);
        }
        Ok(Self { units: out })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(&self.to_envelope())
    }

    pub fn decode(bytes: &[u8], units: &[UnitId]) -> Result<Self, CodecError> {
        Self::from_envelope(&codec::decode(bytes)?, units)
    }
}

/// Everything one unit reported in a single tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitObservation {
    pub state: BTreeMap<String, f64>,
    pub applied: Action,
    pub cameras: BTreeMap<String, Option<RgbImage>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub units: BTreeMap<UnitId, UnitObservation>,
}

impl Observation {
    pub fn unit(&self, unit: &UnitId) -> Option<&UnitObservation> {
        self.units.get(unit)
    }

    /// Camera frames that fail to compress go out as the empty string.
    pub fn to_envelope(&self, jpeg_quality: u8) -> Envelope {
        let mut env = Envelope::new();
        for (unit, obs) in &self.units {
            let mut fields = Envelope::new();
            for (k, v) in &obs.state {
                fields.insert(k.clone(), FieldValue::Float(*v));
            }
            for (k, v) in &obs.applied {
                fields.insert(format!("{APPLIED_ACTION_PREFIX}{k}"), FieldValue::Float(*v));
            }
            for (name, frame) in &obs.cameras {
                let armored = match frame {
                    Some(img) => codec::encode_frame(img, jpeg_quality).unwrap_or_else(|e| {
                        tracing::warn!("{unit}: dropping frame from camera `{name}`: {e}");
                        String::new()
                    }),
                    None => String::new(),
                };
                fields.insert(name.clone(), FieldValue::Text(armored));
            }
            env.extend(codec::join(&unit.key_prefix(), fields));
        }
        env
    }

    pub fn from_envelope(env: &Envelope, units: &[UnitId]) -> Result<Self, CodecError> {
        let mut out = BTreeMap::new();
        for unit in units {
            let prefix = unit.key_prefix();
            let fields = codec::split(&prefix, env);
            if fields.is_empty() {
                continue;
            }
            let mut obs = UnitObservation::default();
            for (key, value) in fields {
                match value {
                    FieldValue::Int(_) | FieldValue::Float(_) => {
                        let v = value.as_f64().unwrap_or_default();
                        match key.strip_prefix(APPLIED_ACTION_PREFIX) {
                            Some(channel) => obs.applied.insert(channel.to_string(), v),
                            None => obs.state.insert(key, v),
                        };
                    }
                    FieldValue::Text(armored) => {
                        obs.cameras.insert(key, codec::decode_frame(&armored));
                    }
                    FieldValue::Bool(_) => {
                        return Err(CodecError::UnexpectedType {
                            key: format!("{prefix}{key}"),
                            expected: "number or camera frame",
                        });
                    }
                }
            }
            out.insert(unit.clone(), obs);
        }
        Ok(Self { units: out })
    }

    pub fn encode(&self, jpeg_quality: u8) -> Result<Vec<u8>, CodecError> {
        codec::encode(&self.to_envelope(jpeg_quality))
    }

    pub fn decode(bytes: &[u8], units: &[UnitId]) -> Result<Self, CodecError> {
        Self::from_envelope(&codec::decode(bytes)?, units)
    }
}

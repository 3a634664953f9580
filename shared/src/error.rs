use std::time::Duration;
use thiserror::Error;

use crate::transport::Channel;

/// Failures of the envelope / camera codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("envelope is not a flat JSON object of scalars: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field `{0}` is not a finite number")]
    NonFinite(String),

    #[error("field `{key}` has unexpected type (expected {expected})")]
    UnexpectedType { key: String, expected: &'static str },

    #[error("envelope carries no field for any known unit")]
    NoKnownUnit,

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures reported by actuators, cameras and teleoperator devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0} is not connected")]
    NotConnected(String),

    #[error("{0} is already connected")]
    AlreadyConnected(String),

    #[error("{device}: {reason}")]
    Fault { device: String, reason: String },
}

/// Error taxonomy of the relay. Only `Config`, `ConnectTimeout` and startup
/// `DeviceDisconnected` are fatal; everything else is contained in a tick.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no receiver attached on the {0} channel")]
    TransportUnavailable(Channel),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),

    #[error("unit `{unit}` disconnected: {source}")]
    DeviceDisconnected {
        unit: String,
        #[source]
        source: DeviceError,
    },

    #[error("tick took {elapsed:?}, period is {period:?}")]
    DeadlineMissed { elapsed: Duration, period: Duration },

    #[error("{channel} channel to {peer} not connected within {timeout:?}")]
    ConnectTimeout {
        channel: Channel,
        peer: String,
        timeout: Duration,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

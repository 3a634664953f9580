//! Pieces shared by the teleoperation host and client: the wire envelope,
//! typed command/observation payloads, the conflate-to-latest transport and
//! configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod throttle;
pub mod transport;
pub mod wire;

pub use codec::{Envelope, FieldValue};
pub use error::{CodecError, DeviceError, RelayError};
pub use throttle::LogThrottle;
pub use transport::{Channel, LatestSink, LatestSource, SendStatus};
pub use wire::{Action, Command, Observation, UnitId, UnitObservation};

pub fn get_current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

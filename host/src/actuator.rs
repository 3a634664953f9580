use image::RgbImage;
use std::collections::BTreeMap;
use teleop_shared::config::SafeAction;
use teleop_shared::{Action, DeviceError, RelayError, UnitId, UnitObservation};

// ======================================================================
//  Device traits
// ======================================================================

/// One motor assembly (e.g. a follower arm) on the host.
pub trait Actuator: Send {
    fn name(&self) -> &str;
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;
    /// Channels `send_action` understands, e.g. `shoulder_pan.pos`.
    fn action_features(&self) -> Vec<String>;
    /// Returns the targets actually applied, which may be clamped.
    fn send_action(&mut self, action: &Action) -> Result<Action, DeviceError>;
    fn get_observation(&mut self) -> Result<BTreeMap<String, f64>, DeviceError>;
}

pub trait Camera: Send {
    fn name(&self) -> &str;
    fn connect(&mut self) -> Result<(), DeviceError>;
    /// `None` when no frame could be captured this tick.
    fn read(&mut self) -> Option<RgbImage>;
    fn disconnect(&mut self);
}

// ======================================================================
//  Unit: one actuator plus the cameras mounted on it
// ======================================================================
pub struct Unit {
    pub id: UnitId,
    actuator: Box<dyn Actuator>,
    cameras: Vec<Box<dyn Camera>>,
    last_state: BTreeMap<String, f64>,
}

impl Unit {
    pub fn new(id: UnitId, actuator: Box<dyn Actuator>, cameras: Vec<Box<dyn Camera>>) -> Self {
        Self {
            id,
            actuator,
            cameras,
            last_state: BTreeMap::new(),
        }
    }

    pub fn connect(&mut self) -> Result<(), RelayError> {
        let unit = self.id.to_string();
        self.actuator
            .connect()
            .map_err(|source| RelayError::DeviceDisconnected {
                unit: unit.clone(),
                source,
            })?;
        for i in 0..self.cameras.len() {
            if let Err(source) = self.cameras[i].connect() {
                for cam in &mut self.cameras[..i] {
                    cam.disconnect();
                }
                let _ = self.actuator.disconnect();
                return Err(RelayError::DeviceDisconnected { unit, source });
            }
        }
        // Seed hold-position targets before the first tick.
        match self.actuator.get_observation() {
            Ok(state) => self.last_state = state,
            Err(e) => tracing::warn!("{}: no initial observation: {e}", self.id),
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        for cam in &mut self.cameras {
            cam.disconnect();
        }
        if self.actuator.is_connected()
            && let Err(e) = self.actuator.disconnect()
        {
            tracing::error!("{}: disconnect failed: {e}", self.id);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.actuator.is_connected()
    }

    /// The action dispatched when no trusted command is available for this
    /// unit.
    pub fn safe_action(&self, policy: &SafeAction) -> Action {
        let features = self.actuator.action_features();
        match policy {
            SafeAction::HoldPosition => features
                .into_iter()
                .filter_map(|f| self.last_state.get(&f).map(|v| (f, *v)))
                .collect(),
            SafeAction::Idle { targets } => features
                .into_iter()
                .map(|f| {
                    let v = targets.get(&f).copied().unwrap_or(0.0);
                    (f, v)
                })
                .collect(),
        }
    }

    pub fn dispatch(&mut self, action: &Action) -> Result<Action, DeviceError> {
        self.actuator.send_action(action)
    }

    /// Actuator state and every camera frame of this tick, as one snapshot.
    pub fn capture(&mut self, applied: Action) -> Result<UnitObservation, DeviceError> {
        let state = self.actuator.get_observation()?;
        let cameras = self
            .cameras
            .iter_mut()
            .map(|cam| (cam.name().to_string(), cam.read()))
            .collect();
        self.last_state = state.clone();
        Ok(UnitObservation {
            state,
            applied,
            cameras,
        })
    }
}

/// Connect every unit or none: on the first failure the ones already
/// connected are released again.
pub fn connect_all(units: &mut [Unit]) -> Result<(), RelayError> {
    for i in 0..units.len() {
        tracing::info!("Connecting unit {} ({})", units[i].id, units[i].actuator.name());
        if let Err(e) = units[i].connect() {
            for unit in &mut units[..i] {
                unit.disconnect();
            }
            return Err(e);
        }
    }
    Ok(())
}

pub fn disconnect_all(units: &mut [Unit]) {
    for unit in units {
        unit.disconnect();
    }
}

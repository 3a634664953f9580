use std::f64::consts::TAU;
use std::time::Instant;
use teleop_shared::config::LeaderConfig;
use teleop_shared::wire::ARM_JOINTS;
use teleop_shared::{Action, DeviceError, RelayError, UnitId};

/// An operator input device (e.g. a leader arm) producing one unit's action.
pub trait Teleoperator: Send {
    fn name(&self) -> &str;
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;
    fn get_action(&mut self) -> Result<Action, DeviceError>;
}

/// Leader arm that sweeps every joint through a slow sine so the relay can
/// be exercised without an operator.
pub struct SimLeaderArm {
    name: String,
    started: Option<Instant>,
}

const SWEEP_HZ: f64 = 0.2;
const SWEEP_AMPLITUDE: f64 = 30.0;

impl SimLeaderArm {
    pub fn new(cfg: &LeaderConfig) -> Self {
        let name = if cfg.id.is_empty() {
            cfg.name.to_string()
        } else {
            cfg.id.clone()
        };
        Self {
            name,
            started: None,
        }
    }

    fn pose_at(t: f64) -> Action {
        ARM_JOINTS
            .iter()
            .enumerate()
            .map(|(i, joint)| {
                let phase = i as f64 * TAU / ARM_JOINTS.len() as f64;
                let wave = (TAU * SWEEP_HZ * t + phase).sin();
                let target = if *joint == "gripper" {
                    50.0 + 40.0 * wave
                } else {
                    SWEEP_AMPLITUDE * wave
                };
                (format!("{joint}.pos"), target)
            })
            .collect()
    }
}

impl Teleoperator for SimLeaderArm {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        if self.started.is_some() {
            return Err(DeviceError::AlreadyConnected(self.name.clone()));
        }
        self.started = Some(Instant::now());
        tracing::info!("{} connected (simulated)", self.name);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        if self.started.take().is_none() {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        tracing::info!("{} disconnected", self.name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.started.is_some()
    }

    fn get_action(&mut self) -> Result<Action, DeviceError> {
        let started = self
            .started
            .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;
        Ok(Self::pose_at(started.elapsed().as_secs_f64()))
    }
}

/// A teleoperator bound to the unit whose commands it drives.
pub struct Leader {
    pub id: UnitId,
    device: Box<dyn Teleoperator>,
}

impl Leader {
    pub fn new(id: UnitId, device: Box<dyn Teleoperator>) -> Self {
        Self { id, device }
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    pub fn get_action(&mut self) -> Result<Action, DeviceError> {
        self.device.get_action()
    }

    pub fn disconnect(&mut self) {
        if self.device.is_connected()
            && let Err(e) = self.device.disconnect()
        {
            tracing::error!("{}: disconnect failed: {e}", self.id);
        }
    }
}

pub fn build_leaders(configs: &[LeaderConfig]) -> Vec<Leader> {
    configs
        .iter()
        .map(|c| Leader::new(c.name.clone(), Box::new(SimLeaderArm::new(c))))
        .collect()
}

/// All leaders connect or none stay connected.
pub fn connect_leaders(leaders: &mut [Leader]) -> Result<(), RelayError> {
    for i in 0..leaders.len() {
        let device = leaders[i].device.name();
        tracing::info!("Connecting leader {device} for {}", leaders[i].id);
        if let Err(source) = leaders[i].device.connect() {
            for leader in &mut leaders[..i] {
                leader.disconnect();
            }
            return Err(RelayError::DeviceDisconnected {
                unit: leaders[i].id.to_string(),
                source,
            });
        }
    }
    Ok(())
}

pub fn disconnect_leaders(leaders: &mut [Leader]) {
    for leader in leaders {
        leader.disconnect();
    }
}

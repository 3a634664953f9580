//! Simulated follower arms and cameras so the host runs without hardware.

use crate::actuator::{Actuator, Camera, Unit};
use image::{Rgb, RgbImage};
use rand::RngExt;
use std::collections::BTreeMap;
use teleop_shared::config::{CameraConfig, HostConfig, UnitConfig};
use teleop_shared::wire::arm_position_features;
use teleop_shared::{Action, DeviceError};

const JOINT_RANGE: (f64, f64) = (-100.0, 100.0);
const GRIPPER_RANGE: (f64, f64) = (0.0, 100.0);
const SENSOR_NOISE: f64 = 0.05;

fn range_for(channel: &str) -> (f64, f64) {
    if channel.starts_with("gripper") {
        GRIPPER_RANGE
    } else {
        JOINT_RANGE
    }
}

/// Position-controlled arm that reaches each (clamped) target within one tick.
pub struct SimFollowerArm {
    name: String,
    connected: bool,
    positions: BTreeMap<String, f64>,
    max_relative_target: Option<f64>,
}

impl SimFollowerArm {
    pub fn new(cfg: &UnitConfig) -> Self {
        let name = if cfg.id.is_empty() {
            cfg.name.to_string()
        } else {
            cfg.id.clone()
        };
        let positions = arm_position_features()
            .into_iter()
            .map(|channel| (channel, 0.0))
            .collect();
        Self {
            name,
            connected: false,
            positions,
            max_relative_target: cfg.max_relative_target,
        }
    }

    fn clamp(&self, channel: &str, target: f64) -> f64 {
        let (lo, hi) = range_for(channel);
        let mut target = target.clamp(lo, hi);
        if let Some(max_step) = self.max_relative_target
            && let Some(present) = self.positions.get(channel)
        {
            target = target.clamp(present - max_step, present + max_step);
        }
        target
    }
}

impl Actuator for SimFollowerArm {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        if self.connected {
            return Err(DeviceError::AlreadyConnected(self.name.clone()));
        }
        self.connected = true;
        tracing::info!("{} connected (simulated)", self.name);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        self.connected = false;
        tracing::info!("{} disconnected", self.name);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn action_features(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    fn send_action(&mut self, action: &Action) -> Result<Action, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        let mut applied = Action::new();
        for (channel, target) in action {
            if !self.positions.contains_key(channel) {
                return Err(DeviceError::Fault {
                    device: self.name.clone(),
                    reason: format!("unknown channel `{channel}`"),
                });
            }
            applied.insert(channel.clone(), self.clamp(channel, *target));
        }
        self.positions.extend(applied.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(applied)
    }

    fn get_observation(&mut self) -> Result<BTreeMap<String, f64>, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        let mut rng = rand::rng();
        Ok(self
            .positions
            .iter()
            .map(|(k, v)| (k.clone(), v + rng.random_range(-SENSOR_NOISE..SENSOR_NOISE)))
            .collect())
    }
}

/// Moving colour-bar test pattern at the configured resolution.
pub struct PatternCamera {
    name: String,
    width: u32,
    height: u32,
    frame: u32,
    connected: bool,
}

impl PatternCamera {
    pub fn new(cfg: &CameraConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            width: cfg.width,
            height: cfg.height,
            frame: 0,
            connected: false,
        }
    }
}

impl Camera for PatternCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        if self.width == 0 || self.height == 0 {
            return Err(DeviceError::Fault {
                device: self.name.clone(),
                reason: "empty resolution".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn read(&mut self) -> Option<RgbImage> {
        if !self.connected {
            return None;
        }
        self.frame = self.frame.wrapping_add(1);
        let shift = self.frame.wrapping_mul(4);
        let h = self.height.max(1);
        Some(RgbImage::from_fn(self.width, self.height, |x, y| {
            let band = ((x.wrapping_add(shift)) / 32) % 3;
            let shade = (255 * y / h) as u8;
            match band {
                0 => Rgb([shade, 40, 40]),
                1 => Rgb([40, shade, 40]),
                _ => Rgb([40, 40, shade]),
            }
        }))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

pub fn build_units(cfg: &HostConfig) -> Vec<Unit> {
    cfg.units
        .iter()
        .map(|u| {
            let cameras: Vec<Box<dyn Camera>> = u
                .cameras
                .iter()
                .map(|c| Box::new(PatternCamera::new(c)) as Box<dyn Camera>)
                .collect();
            Unit::new(u.name.clone(), Box::new(SimFollowerArm::new(u)), cameras)
        })
        .collect()
}

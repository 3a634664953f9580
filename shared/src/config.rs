//! Host and client configuration, loaded from JSON.
//!
//! Every field has a default, so a partial file (or none at all) works.

use crate::error::RelayError;
use crate::wire::{Action, UnitId};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CMD_PORT: u16 = 5555;
pub const DEFAULT_OBS_PORT: u16 = 5556;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "wrist".into(),
            path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// One follower arm on the host.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub name: UnitId,
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_follower_port")]
    pub port: String,
    /// Largest allowed step between present position and target, per tick.
    #[serde(default)]
    pub max_relative_target: Option<f64>,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

fn default_follower_port() -> String {
    "/dev/ttyACM0".into()
}

/// What the host dispatches when it has no trusted command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SafeAction {
    /// Re-target every action channel at its last observed value.
    #[default]
    HoldPosition,
    /// Fixed targets; channels not listed go to 0.0.
    ///
    /// Dispatched on every tick that brings no new command, not only once
    /// the watchdog trips. If the client sends slower than the host ticks,
    /// the arms alternate between the commanded pose and these targets.
    Idle {
        #[serde(default)]
        targets: Action,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bind_address: IpAddr,
    pub port_cmd: u16,
    pub port_observations: u16,
    /// Stop trusting the command stream after this much silence.
    pub watchdog_timeout_ms: u64,
    /// Lower this if the arms jitter and the host CPU is saturated.
    pub max_loop_freq_hz: u32,
    pub jpeg_quality: u8,
    pub safe_action: SafeAction,
    pub run_duration_s: Option<u64>,
    pub units: Vec<UnitConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port_cmd: DEFAULT_CMD_PORT,
            port_observations: DEFAULT_OBS_PORT,
            watchdog_timeout_ms: 500,
            max_loop_freq_hz: 30,
            jpeg_quality: 90,
            safe_action: SafeAction::default(),
            run_duration_s: None,
            units: vec![
                UnitConfig {
                    name: UnitId::new("arm1").expect("static unit name"),
                    id: "left_arm".into(),
                    port: "/dev/ttyACM1".into(),
                    max_relative_target: None,
                    cameras: vec![
                        CameraConfig {
                            name: "wrist_left".into(),
                            path: PathBuf::from("/dev/video0"),
                            ..CameraConfig::default()
                        },
                        CameraConfig {
                            name: "wrist_right".into(),
                            path: PathBuf::from("/dev/video2"),
                            ..CameraConfig::default()
                        },
                    ],
                },
                UnitConfig {
                    name: UnitId::new("arm2").expect("static unit name"),
                    id: "right_arm".into(),
                    port: "/dev/ttyACM0".into(),
                    max_relative_target: None,
                    cameras: Vec::new(),
                },
            ],
        }
    }
}

impl HostConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_loop_freq_hz.max(1) as f64)
    }

    pub fn run_duration(&self) -> Option<Duration> {
        self.run_duration_s.map(Duration::from_secs)
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|u| u.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_loop_freq_hz == 0 {
            return Err(RelayError::Config("max_loop_freq_hz must be > 0".into()));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(RelayError::Config("watchdog_timeout_ms must be > 0".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(RelayError::Config("jpeg_quality must be within 1..=100".into()));
        }
        if self.port_cmd == self.port_observations && self.port_cmd != 0 {
            return Err(RelayError::Config(
                "command and observation ports must differ".into(),
            ));
        }
        check_units(self.units.iter().map(|u| &u.name))?;
        for unit in &self.units {
            if let Some(limit) = unit.max_relative_target
                && !(limit.is_finite() && limit > 0.0)
            {
                return Err(RelayError::Config(format!(
                    "unit `{}`: max_relative_target must be a positive number",
                    unit.name
                )));
            }
            let mut cams = HashSet::new();
            for cam in &unit.cameras {
                if !cams.insert(cam.name.as_str()) {
                    return Err(RelayError::Config(format!(
                        "unit `{}`: duplicate camera `{}`",
                        unit.name, cam.name
                    )));
                }
                if cam.width == 0 || cam.height == 0 {
                    return Err(RelayError::Config(format!(
                        "camera `{}` has an empty resolution",
                        cam.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One leader (teleoperator) arm on the client.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderConfig {
    pub name: UnitId,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub path: PathBuf,
    pub task: String,
    pub fps: u32,
    pub reset_time_s: u64,
    pub jpeg_quality: u8,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/episodes.db"),
            task: "teleoperated demonstration".into(),
            fps: 10,
            reset_time_s: 5,
            jpeg_quality: 90,
        }
    }
}

impl DatasetConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn reset_time(&self) -> Duration {
        Duration::from_secs(self.reset_time_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub remote_ip: String,
    pub port_cmd: u16,
    pub port_observations: u16,
    pub connect_timeout_s: u64,
    pub loop_freq_hz: u32,
    pub units: Vec<LeaderConfig>,
    pub dataset: DatasetConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_ip: "127.0.0.1".into(),
            port_cmd: DEFAULT_CMD_PORT,
            port_observations: DEFAULT_OBS_PORT,
            connect_timeout_s: 5,
            loop_freq_hz: 30,
            units: vec![
                LeaderConfig {
                    name: UnitId::new("arm1").expect("static unit name"),
                    id: "leader_left".into(),
                    port: "/dev/tty.usbmodem58FA0833831".into(),
                },
                LeaderConfig {
                    name: UnitId::new("arm2").expect("static unit name"),
                    id: "leader_right".into(),
                    port: "/dev/tty.usbmodem58FA0831921".into(),
                },
            ],
            dataset: DatasetConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_freq_hz.max(1) as f64)
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|u| u.name.clone()).collect()
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.remote_ip.trim().is_empty() {
            return Err(RelayError::Config("remote_ip must be set".into()));
        }
        if self.loop_freq_hz == 0 {
            return Err(RelayError::Config("loop_freq_hz must be > 0".into()));
        }
        if self.dataset.fps == 0 || self.dataset.fps > self.loop_freq_hz {
            return Err(RelayError::Config(
                "dataset.fps must be within 1..=loop_freq_hz".into(),
            ));
        }
        if !(1..=100).contains(&self.dataset.jpeg_quality) {
            return Err(RelayError::Config(
                "dataset.jpeg_quality must be within 1..=100".into(),
            ));
        }
        check_units(self.units.iter().map(|u| &u.name))
    }
}

fn check_units<'a>(names: impl Iterator<Item = &'a UnitId>) -> Result<(), RelayError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(RelayError::Config(format!("duplicate unit `{name}`")));
        }
    }
    if seen.is_empty() {
        return Err(RelayError::Config("at least one unit is required".into()));
    }
    Ok(())
}

/// `env_var` if set, otherwise `default` under the calling crate.
pub fn config_path(env_var: &str, default: &Path) -> PathBuf {
    if let Ok(path) = std::env::var(env_var) {
        return PathBuf::from(path);
    }
    default.to_path_buf()
}

/// A missing file yields the defaults; a malformed one is an error.
pub fn load_config<T: DeserializeOwned + Default>(path: &Path) -> Result<T, RelayError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no config at {}, using defaults", path.display());
            return Ok(T::default());
        }
        Err(e) => {
            return Err(RelayError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    serde_json::from_str(&raw)
        .map_err(|e| RelayError::Config(format!("invalid JSON in {}: {e}", path.display())))
}

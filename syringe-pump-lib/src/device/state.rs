use std::fmt::{self, Display};
use std::time::Duration;

use crate::protocol::{Orientation, Valve};

use super::PumpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Moving,
    Homing,
    Aborting,
}

impl Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionState::Idle => "idle",
            MotionState::Moving => "moving",
            MotionState::Homing => "homing",
            MotionState::Aborting => "aborting",
        };
        name.fmt(f)
    }
}

/// Everything the controller knows about its pump.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpState {
    pub pump_id: u8,
    pub orientation: Orientation,
    pub backlash: u32,
    pub syringe_volume: u32,
    pub commanded_position: f64,
    /// Last position read back from the pump, `None` until the first
    /// successful query.
    pub measured_position: Option<f64>,
    pub commanded_speed: f64,
    pub valve: Valve,
    pub busy: Option<bool>,
    pub last_error: Option<String>,
    pub last_error_code: Option<u8>,
    pub scan_period: Duration,
    pub motion: MotionState,
    pub status: String,
    pub running: bool,
}

impl PumpState {
    pub fn new(config: &PumpConfig) -> Self {
        Self {
            pump_id: config.pump_id,
            orientation: config.orientation,
            backlash: config.backlash,
            syringe_volume: config.syringe_volume,
            commanded_position: 0.0,
            measured_position: None,
            commanded_speed: config.initial_speed,
            valve: Valve::Out,
            busy: None,
            last_error: None,
            last_error_code: None,
            scan_period: config.idle_scan_period,
            motion: MotionState::Idle,
            status: String::new(),
            running: false,
        }
    }

    /// `None` while the position is unknown.
    pub fn done_moving(&self, epsilon: f64) -> Option<bool> {
        self.measured_position
            .map(|measured| (self.commanded_position - measured).abs() < epsilon)
    }

    /// Empty unless the plunger sits at or below `limit`.
    pub fn low_level(&self, limit: f64) -> String {
        match self.measured_position {
            Some(position) if position <= limit => format!(
                "current position {} below low level limit {}",
                position, limit
            ),
            _ => String::new(),
        }
    }
}

use std::time::Duration;

use crate::protocol::{Orientation, DEFAULT_ADDRESS};

/// Static settings of one pump controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpConfig {
    pub pump_id: u8,
    pub address: u8,
    pub orientation: Orientation,
    /// Backlash compensation in motor increments.
    pub backlash: u32,
    /// Installed syringe size in uL, also the full plunger stroke.
    pub syringe_volume: u32,
    pub initial_speed: f64,

    pub fill_speed: f64,
    pub prime_speed: f64,
    pub low_pressure_speed: f64,
    /// `flow` refuses speeds above this.
    pub flow_speed_high_limit: f64,
    /// Commanded and measured positions closer than this count as done moving.
    pub done_epsilon: f64,

    pub fast_scan_period: Duration,
    pub idle_scan_period: Duration,
    pub scan_tick: Duration,
    pub wait_poll_interval: Duration,
    pub abort_poll_interval: Duration,
    pub abort_timeout: Duration,
    pub valve_settle: Duration,

    pub low_level_alarm: f64,
    pub low_level_warning: f64,
}

impl PumpConfig {
    pub fn for_pump(pump_id: u8) -> Self {
        Self {
            pump_id,
            orientation: Orientation::for_pump(pump_id),
            ..Self::default()
        }
    }

    pub fn full_stroke(&self) -> f64 {
        f64::from(self.syringe_volume)
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            pump_id: 1,
            address: DEFAULT_ADDRESS,
            orientation: Orientation::for_pump(1),
            backlash: 100,
            syringe_volume: 250,
            initial_speed: 25.0,
            fill_speed: 100.0,
            prime_speed: 68.0,
            low_pressure_speed: 1.0,
            flow_speed_high_limit: 5.0,
            done_epsilon: 0.002,
            fast_scan_period: Duration::from_millis(1),
            idle_scan_period: Duration::from_secs(10),
            scan_tick: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(340),
            abort_poll_interval: Duration::from_millis(100),
            abort_timeout: Duration::from_secs(10),
            valve_settle: Duration::from_millis(200),
            low_level_alarm: 5.0,
            low_level_warning: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_follows_pump_id() {
        assert_eq!(PumpConfig::for_pump(1).orientation, Orientation::Y);
        assert_eq!(PumpConfig::for_pump(2).orientation, Orientation::Z);
        assert_eq!(PumpConfig::for_pump(2).pump_id, 2);
        assert_eq!(PumpConfig::for_pump(2).address, DEFAULT_ADDRESS);
    }
}

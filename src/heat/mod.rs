//! The heat subsystem: owns one [`Pid`] per heater and samples them all at
//! a fixed period from the cooperative loop. Heaters never interact with
//! motion; a latched fault is reported upwards so the tools using the
//! heater can be disabled.

pub mod pid;

pub use pid::Pid;

use crate::config::{Config, HeatSettings, HEATERS};
use crate::hardware::Platform;

pub struct Heat {
    pids: [Pid; HEATERS],
    settings: HeatSettings,
    last_time: f64,
    active: bool,
}

impl Heat {
    pub fn new(config: &Config) -> Self {
        Self {
            pids: std::array::from_fn(Pid::new),
            settings: config.heat.clone(),
            last_time: 0.0,
            active: false,
        }
    }

    pub fn init<P: Platform>(&mut self, platform: &mut P) {
        for pid in self.pids.iter_mut() {
            pid.init(platform);
        }
        self.last_time = platform.time();
        self.active = true;
    }

    /// One cooperative tick. Regulates every heater once per sample
    /// period; returns the heaters that latched a fault this tick.
    pub fn spin<P: Platform>(&mut self, platform: &mut P) -> Vec<usize> {
        if !self.active {
            return Vec::new();
        }
        let t = platform.time();
        if t - self.last_time < self.settings.sample_time {
            return Vec::new();
        }
        self.last_time = t;

        let mut faults = Vec::new();
        for (heater, pid) in self.pids.iter_mut().enumerate() {
            if pid.spin(platform, &self.settings) {
                faults.push(heater);
            }
        }
        faults
    }

    pub fn exit<P: Platform>(&mut self, platform: &mut P) {
        for (heater, pid) in self.pids.iter_mut().enumerate() {
            pid.switch_off();
            platform.set_heater(heater, 0.0);
        }
        tracing::info!("Heat shut down");
        self.active = false;
    }

    pub fn get_temperature(&self, heater: usize) -> f64 {
        self.pids[heater].temperature()
    }

    pub fn active_temperature(&self, heater: usize) -> f64 {
        self.pids[heater].active_temperature()
    }

    pub fn standby_temperature(&self, heater: usize) -> f64 {
        self.pids[heater].standby_temperature()
    }

    pub fn set_active_temperature(&mut self, heater: usize, temperature: f64, now: f64) {
        self.pids[heater].set_active_temperature(temperature, now);
    }

    pub fn set_standby_temperature(&mut self, heater: usize, temperature: f64) {
        self.pids[heater].set_standby_temperature(temperature);
    }

    pub fn activate(&mut self, heater: usize, now: f64) {
        self.pids[heater].activate(now);
    }

    pub fn standby(&mut self, heater: usize) {
        self.pids[heater].standby();
    }

    pub fn switch_off(&mut self, heater: usize) {
        self.pids[heater].switch_off();
    }

    pub fn temperature_fault(&self, heater: usize) -> bool {
        self.pids[heater].temperature_fault()
    }

    pub fn reset_fault(&mut self, heater: usize) {
        self.pids[heater].reset_fault();
    }

    pub fn all_heaters_at_set_temperatures(&self) -> bool {
        (0..HEATERS).all(|heater| self.heater_at_set_temperature(heater))
    }

    /// A switched-off heater is wherever it should be; setpoints below
    /// the care threshold are not waited for.
    pub fn heater_at_set_temperature(&self, heater: usize) -> bool {
        let pid = &self.pids[heater];
        if pid.is_switched_off() {
            return true;
        }
        let target = if pid.is_active() {
            pid.active_temperature()
        } else {
            pid.standby_temperature()
        };
        if target < self.settings.temperature_low_so_dont_care {
            return true;
        }
        (pid.temperature() - target).abs() <= self.settings.temperature_close_enough
    }

    pub fn hot_enough_to_extrude(&self) -> f64 {
        self.settings.hot_enough_to_extrude
    }
}

impl std::fmt::Debug for Heat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heat")
            .field("active", &self.active)
            .field("last_time", &self.last_time)
            .finish()
    }
}

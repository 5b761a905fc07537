//! Simulated platform: a virtual clock, step recorder, switchable endstops
//! and a first-order thermal model. Used by the demo binary and the
//! integration tests to drive the cores without electronics.

use crate::config::{Config, DriveConfig, HeaterConfig, AXES, DRIVES, HEATERS};

use super::{EndStopHit, Platform};

/// One recorded step pulse, for test assertions about timing.
#[derive(Debug, Clone, Copy)]
pub struct StepEvent {
    pub time: f64,
    pub drive: usize,
}

#[derive(Debug)]
pub struct SimPlatform {
    drives: [DriveConfig; DRIVES],
    heaters: [HeaterConfig; HEATERS],
    z_probe_stop_height: f64,
    slowest: usize,

    now: f64,
    interrupt_at: Option<f64>,

    directions: [bool; DRIVES],
    step_counts: [u64; DRIVES],
    position_steps: [i64; DRIVES],
    low_trigger_mm: [Option<f64>; DRIVES],
    high_trigger_mm: [Option<f64>; DRIVES],

    heater_pwm: [f64; HEATERS],
    heater_temp: [f64; HEATERS],
    sensor_override: [Option<f64>; HEATERS],
    ambient: f64,

    record_steps: bool,
    events: Vec<StepEvent>,
}

impl SimPlatform {
    pub fn new(config: &Config) -> Self {
        let mut slowest = 0;
        for drive in 1..DRIVES {
            if config.drives[drive].max_feedrate < config.drives[slowest].max_feedrate {
                slowest = drive;
            }
        }
        Self {
            drives: config.drives.clone(),
            heaters: config.heaters.clone(),
            z_probe_stop_height: config.motion.z_probe_stop_height,
            slowest,
            now: 0.0,
            interrupt_at: None,
            directions: [true; DRIVES],
            step_counts: [0; DRIVES],
            position_steps: [0; DRIVES],
            low_trigger_mm: [None; DRIVES],
            high_trigger_mm: [None; DRIVES],
            heater_pwm: [0.0; HEATERS],
            heater_temp: [25.0; HEATERS],
            sensor_override: [None; HEATERS],
            ambient: 25.0,
            record_steps: false,
            events: Vec::new(),
        }
    }

    /// Advance the virtual clock without firing the stepping timer.
    pub fn advance(&mut self, dt: f64) {
        self.now += dt;
        self.update_thermal(dt);
    }

    /// If the stepping timer is armed, jump the clock to its fire time and
    /// consume it. The caller is expected to run the interrupt handler,
    /// which re-arms the timer.
    pub fn take_interrupt(&mut self) -> Option<f64> {
        let t = self.interrupt_at.take()?;
        if t > self.now {
            self.update_thermal(t - self.now);
            self.now = t;
        }
        Some(t)
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_at.is_some()
    }

    fn update_thermal(&mut self, dt: f64) {
        // Crude lumped model: PWM heats, ambient cools. Good enough to
        // close the PID loop in the demo.
        for heater in 0..HEATERS {
            let gain = if self.heaters[heater].is_bed { 1.5 } else { 12.0 };
            let loss = 0.02;
            let temp = self.heater_temp[heater];
            self.heater_temp[heater] +=
                (self.heater_pwm[heater] * gain - (temp - self.ambient) * loss) * dt;
        }
    }

    /// Pin a sensor to a fixed reading, overriding the thermal model.
    pub fn override_sensor(&mut self, heater: usize, reading: Option<f64>) {
        self.sensor_override[heater] = reading;
    }

    pub fn heater_pwm(&self, heater: usize) -> f64 {
        self.heater_pwm[heater]
    }

    /// Configure a low endstop that trips at `mm` and below.
    pub fn set_low_trigger(&mut self, drive: usize, mm: Option<f64>) {
        self.low_trigger_mm[drive] = mm;
    }

    pub fn set_high_trigger(&mut self, drive: usize, mm: Option<f64>) {
        self.high_trigger_mm[drive] = mm;
    }

    pub fn step_counts(&self) -> &[u64; DRIVES] {
        &self.step_counts
    }

    pub fn reset_step_counts(&mut self) {
        self.step_counts = [0; DRIVES];
        self.events.clear();
    }

    pub fn position_mm(&self, drive: usize) -> f64 {
        self.position_steps[drive] as f64 / self.drives[drive].steps_per_unit
    }

    /// Teleport a drive; used to line the simulation up with a homed or
    /// manually-set machine position.
    pub fn set_position_mm(&mut self, drive: usize, mm: f64) {
        self.position_steps[drive] = (mm * self.drives[drive].steps_per_unit).round() as i64;
    }

    pub fn record_steps(&mut self, on: bool) {
        self.record_steps = on;
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }
}

impl Platform for SimPlatform {
    fn time(&self) -> f64 {
        self.now
    }

    fn set_interrupt(&mut self, seconds: f64) {
        self.interrupt_at = Some(self.now + seconds);
    }

    fn step(&mut self, drive: usize) {
        self.step_counts[drive] += 1;
        self.position_steps[drive] += if self.directions[drive] { 1 } else { -1 };
        if self.record_steps {
            self.events.push(StepEvent { time: self.now, drive });
        }
    }

    fn set_direction(&mut self, drive: usize, forward: bool) {
        self.directions[drive] = forward;
    }

    fn disable(&mut self, _drive: usize) {}

    fn stopped(&self, drive: usize) -> EndStopHit {
        let position = self.position_mm(drive);
        if let Some(low) = self.low_trigger_mm[drive] {
            if position <= low {
                return EndStopHit::LowHit;
            }
        }
        if let Some(high) = self.high_trigger_mm[drive] {
            if position >= high {
                return EndStopHit::HighHit;
            }
        }
        EndStopHit::NoStop
    }

    fn get_temperature(&self, heater: usize) -> f64 {
        self.sensor_override[heater].unwrap_or(self.heater_temp[heater])
    }

    fn set_heater(&mut self, heater: usize, pwm: f64) {
        self.heater_pwm[heater] = pwm.clamp(0.0, 1.0);
    }

    fn drive_steps_per_unit(&self, drive: usize) -> f64 {
        self.drives[drive].steps_per_unit
    }

    fn max_feedrate(&self, drive: usize) -> f64 {
        self.drives[drive].max_feedrate
    }

    fn acceleration(&self, drive: usize) -> f64 {
        self.drives[drive].acceleration
    }

    fn instant_dv(&self, drive: usize) -> f64 {
        self.drives[drive].instant_dv
    }

    fn home_feedrate(&self, drive: usize) -> f64 {
        self.drives[drive].home_feedrate
    }

    fn axis_length(&self, axis: usize) -> f64 {
        debug_assert!(axis < AXES);
        self.drives[axis].axis_length
    }

    fn slowest_drive(&self) -> usize {
        self.slowest
    }

    fn use_pid(&self, heater: usize) -> bool {
        self.heaters[heater].use_pid
    }

    fn pid_kp(&self, heater: usize) -> f64 {
        self.heaters[heater].kp
    }

    fn pid_ki(&self, heater: usize) -> f64 {
        self.heaters[heater].ki
    }

    fn pid_kd(&self, heater: usize) -> f64 {
        self.heaters[heater].kd
    }

    fn full_pid_band(&self, heater: usize) -> f64 {
        self.heaters[heater].full_band
    }

    fn pid_min(&self, heater: usize) -> f64 {
        self.heaters[heater].i_min
    }

    fn pid_max(&self, heater: usize) -> f64 {
        self.heaters[heater].i_max
    }

    fn d_mix(&self, heater: usize) -> f64 {
        self.heaters[heater].d_mix
    }

    fn heater_is_bed(&self, heater: usize) -> bool {
        self.heaters[heater].is_bed
    }

    fn z_probe(&self) -> i32 {
        0
    }

    fn z_probe_stop_height(&self) -> f64 {
        self.z_probe_stop_height
    }
}

//! Hardware abstraction for the motion and heat cores.
//!
//! [`Platform`] is the only line the cores cross to reach real electronics:
//! the monotonic clock, the one-shot stepping timer, step/direction pins,
//! endstop switches, thermistors and heater PWM. Implementations exist for
//! simulation ([`sim::SimPlatform`]) and, outside this crate, for real
//! boards.

pub mod sim;

pub use sim::SimPlatform;

/// Result of polling a drive's endstop switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStopHit {
    NoStop,
    LowHit,
    HighHit,
}

/// Capabilities the motion and heat cores require from the machine.
///
/// All per-drive and per-heater scalars are fixed after construction; the
/// cores may cache them. Methods that touch pins are called from the timer
/// interrupt context and must not block.
pub trait Platform {
    /// Monotonic time in seconds.
    fn time(&self) -> f64;

    /// Arm the one-shot stepping timer to fire `seconds` from now.
    fn set_interrupt(&mut self, seconds: f64);

    /// Emit one step pulse on a drive.
    fn step(&mut self, drive: usize);

    /// Latch the travel direction of a drive.
    fn set_direction(&mut self, drive: usize, forward: bool);

    /// Release a drive's holding torque.
    fn disable(&mut self, drive: usize);

    /// Poll a drive's endstops.
    fn stopped(&self, drive: usize) -> EndStopHit;

    /// Degrees Celsius at a heater's sensor.
    fn get_temperature(&self, heater: usize) -> f64;

    /// Drive a heater at `pwm` in [0, 1].
    fn set_heater(&mut self, heater: usize, pwm: f64);

    fn drive_steps_per_unit(&self, drive: usize) -> f64;
    fn max_feedrate(&self, drive: usize) -> f64;
    fn acceleration(&self, drive: usize) -> f64;
    fn instant_dv(&self, drive: usize) -> f64;
    fn home_feedrate(&self, drive: usize) -> f64;
    fn axis_length(&self, axis: usize) -> f64;

    /// The drive with the lowest maximum feedrate.
    fn slowest_drive(&self) -> usize;

    fn use_pid(&self, heater: usize) -> bool;
    fn pid_kp(&self, heater: usize) -> f64;
    fn pid_ki(&self, heater: usize) -> f64;
    fn pid_kd(&self, heater: usize) -> f64;
    fn full_pid_band(&self, heater: usize) -> f64;
    fn pid_min(&self, heater: usize) -> f64;
    fn pid_max(&self, heater: usize) -> f64;
    fn d_mix(&self, heater: usize) -> f64;
    /// The warm-up watchdog does not apply to a bed heater.
    fn heater_is_bed(&self, heater: usize) -> bool;

    /// Raw Z-probe reading.
    fn z_probe(&self) -> i32;

    /// Height above the bed at which the Z probe triggers, mm.
    fn z_probe_stop_height(&self) -> f64;
}

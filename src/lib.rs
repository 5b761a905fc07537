//! Motion planning and heater regulation core for a fused-filament
//! printer.
//!
//! The pipeline has two stages: a look-ahead ring that plans entry and
//! exit velocities across queued linear moves, and a DDA ring whose head
//! the stepping-timer interrupt executes as multi-axis Bresenham with a
//! trapezoidal velocity profile. Alongside it run the heater PID loops,
//! the bed and axis compensation transforms, and the tool bindings that
//! tie extruder drives to heaters.
//!
//! Hardware is reached only through the [`hardware::Platform`] trait; a
//! simulated implementation drives the whole core in tests and in the
//! demo binary.

pub mod config;
pub mod hardware;
pub mod heat;
pub mod motion;
pub mod printer;
pub mod tool;

pub use config::{load_config, Config};
pub use printer::Printer;

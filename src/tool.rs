//! Tools: a numbered binding of extruder drives and heaters, with mixing
//! weights and per-heater setpoints. At most one tool is active at a time;
//! activating one pushes its setpoints into [`Heat`] and drops the
//! previously active tool to standby.

use thiserror::Error;

use crate::config::{ABS_ZERO, AXES, DRIVES, HEATERS};
use crate::hardware::Platform;
use crate::heat::Heat;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool number {0} already in use")]
    DuplicateNumber(i32),
    #[error("tool uses more extruder drives than the machine has ({0})")]
    TooManyDrives(usize),
    #[error("tool uses more heaters than the machine has ({0})")]
    TooManyHeaters(usize),
    #[error("mix factors must have one entry per tool drive and a positive sum")]
    BadMix,
    #[error("no tool with number {0}")]
    NoSuchTool(i32),
}

#[derive(Debug)]
pub struct Tool {
    number: i32,
    /// Extruder indices, counted from the first extruder drive.
    drives: Vec<usize>,
    mix: Vec<f64>,
    heaters: Vec<usize>,
    active_temperatures: Vec<f64>,
    standby_temperatures: Vec<f64>,
    active: bool,
    heater_fault: bool,
}

impl Tool {
    pub fn new(number: i32, drives: Vec<usize>, heaters: Vec<usize>) -> Result<Self, ToolError> {
        if drives.len() > DRIVES - AXES {
            return Err(ToolError::TooManyDrives(drives.len()));
        }
        if heaters.len() > HEATERS {
            return Err(ToolError::TooManyHeaters(heaters.len()));
        }
        let mix = if drives.is_empty() {
            Vec::new()
        } else {
            vec![1.0 / drives.len() as f64; drives.len()]
        };
        let heater_count = heaters.len();
        Ok(Self {
            number,
            drives,
            mix,
            heaters,
            active_temperatures: vec![ABS_ZERO; heater_count],
            standby_temperatures: vec![ABS_ZERO; heater_count],
            active: false,
            heater_fault: false,
        })
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mix(&self) -> &[f64] {
        &self.mix
    }

    /// Replace the mix vector, normalising it to sum to one.
    pub fn set_mix(&mut self, mix: &[f64]) -> Result<(), ToolError> {
        if mix.len() != self.drives.len() {
            return Err(ToolError::BadMix);
        }
        let sum: f64 = mix.iter().sum();
        if sum <= 0.0 {
            return Err(ToolError::BadMix);
        }
        self.mix = mix.iter().map(|m| m / sum).collect();
        Ok(())
    }

    /// Split a commanded extrusion length across this tool's drives by
    /// the mix vector, as (global drive index, delta) pairs. The motion
    /// core takes extruder deltas verbatim, so the command source calls
    /// this when it expands a tool move.
    pub fn mix_deltas(&self, total: f64) -> Vec<(usize, f64)> {
        self.drives
            .iter()
            .zip(&self.mix)
            .map(|(&drive, &m)| (AXES + drive, total * m))
            .collect()
    }

    /// The fastest this tool can extrude: the best of its drives.
    pub fn max_feedrate<P: Platform>(&self, platform: &P) -> f64 {
        if self.drives.is_empty() {
            tracing::warn!("Max feedrate requested for tool {} with no drives", self.number);
            return 1.0;
        }
        self.drives
            .iter()
            .map(|&drive| platform.max_feedrate(drive + AXES))
            .fold(0.0, f64::max)
    }

    /// The largest speed jump every drive of this tool tolerates.
    pub fn instant_dv<P: Platform>(&self, platform: &P) -> f64 {
        if self.drives.is_empty() {
            tracing::warn!("Instant Dv requested for tool {} with no drives", self.number);
            return 1.0;
        }
        self.drives
            .iter()
            .map(|&drive| platform.instant_dv(drive + AXES))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn set_variables(&mut self, standby: &[f64], active: &[f64], heat: &mut Heat, now: f64) {
        for (index, &heater) in self.heaters.iter().enumerate() {
            self.active_temperatures[index] = active[index];
            self.standby_temperatures[index] = standby[index];
            heat.set_active_temperature(heater, active[index], now);
            heat.set_standby_temperature(heater, standby[index]);
        }
    }

    pub fn get_variables(&self) -> (Vec<f64>, Vec<f64>) {
        (self.standby_temperatures.clone(), self.active_temperatures.clone())
    }

    fn activate(&mut self, heat: &mut Heat, now: f64) {
        if self.active {
            return;
        }
        for (index, &heater) in self.heaters.iter().enumerate() {
            heat.set_active_temperature(heater, self.active_temperatures[index], now);
            heat.set_standby_temperature(heater, self.standby_temperatures[index]);
            heat.activate(heater, now);
        }
        self.active = true;
    }

    fn standby(&mut self, heat: &mut Heat) {
        if !self.active {
            return;
        }
        for (index, &heater) in self.heaters.iter().enumerate() {
            heat.set_standby_temperature(heater, self.standby_temperatures[index]);
            heat.standby(heater);
        }
        self.active = false;
    }

    fn set_temperature_fault(&mut self, dud_heater: usize) {
        if self.heaters.contains(&dud_heater) {
            self.heater_fault = true;
        }
    }

    fn reset_temperature_fault(&mut self, was_dud_heater: usize) {
        if self.heaters.contains(&was_dud_heater) {
            self.heater_fault = false;
        }
    }

    pub fn heater_fault(&self) -> bool {
        self.heater_fault
    }

    fn all_heaters_at_high_temperature(&self, heat: &Heat) -> bool {
        self.heaters
            .iter()
            .all(|&heater| heat.get_temperature(heater) >= heat.hot_enough_to_extrude())
    }

    /// Whether extruding with this tool is allowed right now.
    pub fn can_drive(&self, heat: &Heat, cold_extrude: bool) -> bool {
        if self.heater_fault {
            return false;
        }
        cold_extrude || self.all_heaters_at_high_temperature(heat)
    }
}

/// The machine's tools, in creation order. Numbers are unique.
#[derive(Debug, Default)]
pub struct ToolList {
    tools: Vec<Tool>,
    active: Option<usize>,
}

impl ToolList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Tool) -> Result<(), ToolError> {
        if self.tools.iter().any(|t| t.number() == tool.number()) {
            return Err(ToolError::DuplicateNumber(tool.number()));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, number: i32) -> Option<&Tool> {
        self.tools.iter().find(|t| t.number() == number)
    }

    pub fn get_mut(&mut self, number: i32) -> Option<&mut Tool> {
        self.tools.iter_mut().find(|t| t.number() == number)
    }

    pub fn active_tool(&self) -> Option<&Tool> {
        self.active.map(|index| &self.tools[index])
    }

    /// Make `number` the active tool, standing the previous one by.
    pub fn select(&mut self, number: i32, heat: &mut Heat, now: f64) -> Result<(), ToolError> {
        let index = self
            .tools
            .iter()
            .position(|t| t.number() == number)
            .ok_or(ToolError::NoSuchTool(number))?;
        if let Some(current) = self.active {
            if current != index {
                self.tools[current].standby(heat);
            }
        }
        self.tools[index].activate(heat, now);
        self.active = Some(index);
        tracing::info!("Tool {} selected", number);
        Ok(())
    }

    /// A heater has faulted: disable every tool that uses it.
    pub fn flag_temperature_fault(&mut self, heater: usize) {
        for tool in self.tools.iter_mut() {
            tool.set_temperature_fault(heater);
        }
    }

    pub fn clear_temperature_fault(&mut self, heater: usize) {
        for tool in self.tools.iter_mut() {
            tool.reset_temperature_fault(heater);
        }
    }
}

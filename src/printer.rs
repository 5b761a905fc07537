//! The root object: owns the platform, the command source and every
//! subsystem, and round-robins their ticks from one cooperative loop.
//! Nothing here blocks; the stepping timer interrupt is the only other
//! execution context.

use crate::config::Config;
use crate::hardware::{Platform, SimPlatform};
use crate::heat::Heat;
use crate::motion::{Motion, MoveSource};
use crate::tool::{Tool, ToolError, ToolList};

pub struct Printer<P: Platform, S: MoveSource> {
    platform: P,
    source: S,
    motion: Motion,
    heat: Heat,
    tools: ToolList,
    cold_extrude: bool,
}

impl<P: Platform, S: MoveSource> Printer<P, S> {
    pub fn new(config: &Config, mut platform: P, source: S) -> Self {
        let motion = Motion::new(config, &mut platform);
        let mut heat = Heat::new(config);
        heat.init(&mut platform);
        Self {
            platform,
            source,
            motion,
            heat,
            tools: ToolList::new(),
            cold_extrude: false,
        }
    }

    /// One pass of the cooperative loop. Motion first, then heat; any
    /// heater fault reported this tick disables the tools using it.
    pub fn spin(&mut self) {
        self.motion.spin(&mut self.platform, &mut self.source);
        for heater in self.heat.spin(&mut self.platform) {
            tracing::warn!("Disabling tools that use faulted heater {}", heater);
            self.tools.flag_temperature_fault(heater);
        }
    }

    /// The stepping-timer interrupt entry point.
    pub fn interrupt(&mut self) {
        self.motion.interrupt(&mut self.platform);
    }

    pub fn add_tool(&mut self, tool: Tool) -> Result<(), ToolError> {
        self.tools.add(tool)
    }

    pub fn select_tool(&mut self, number: i32) -> Result<(), ToolError> {
        let now = self.platform.time();
        self.tools.select(number, &mut self.heat, now)
    }

    /// Whether a tool may extrude, honouring faults and the cold-extrusion
    /// override.
    pub fn tool_can_drive(&self, number: i32) -> bool {
        self.tools
            .get(number)
            .map(|tool| tool.can_drive(&self.heat, self.cold_extrude))
            .unwrap_or(false)
    }

    pub fn set_cold_extrude(&mut self, allowed: bool) {
        self.cold_extrude = allowed;
    }

    pub fn cold_extrude(&self) -> bool {
        self.cold_extrude
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn motion(&self) -> &Motion {
        &self.motion
    }

    pub fn motion_mut(&mut self) -> &mut Motion {
        &mut self.motion
    }

    pub fn heat(&self) -> &Heat {
        &self.heat
    }

    pub fn heat_mut(&mut self) -> &mut Heat {
        &mut self.heat
    }

    pub fn tools(&self) -> &ToolList {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolList {
        &mut self.tools
    }

    pub fn exit(&mut self) {
        self.motion.exit(&mut self.platform);
        self.heat.exit(&mut self.platform);
    }
}

impl<S: MoveSource> Printer<SimPlatform, S> {
    /// Drive the loop against the simulated platform, firing the stepping
    /// timer whenever it is due, until motion runs dry. Returns false if
    /// the interrupt budget ran out first.
    pub fn run_until_idle(&mut self, max_interrupts: usize) -> bool {
        for _ in 0..max_interrupts {
            self.spin();
            if self.platform.take_interrupt().is_some() {
                self.interrupt();
            }
            if self.motion.is_idle() && !self.source.have_incoming_data() {
                return true;
            }
        }
        false
    }
}

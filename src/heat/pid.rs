//! Closed-loop control of a single heater, with sensor-fault latching and
//! a warm-up watchdog.

use crate::config::{HeatSettings, ABS_ZERO};
use crate::hardware::Platform;

/// One heater's controller. A heater is born switched off; giving it work
/// (activating it for a tool) switches it on. A latched fault drives the
/// output to zero until it is cleared from outside.
#[derive(Debug)]
pub struct Pid {
    heater: usize,
    temperature: f64,
    last_temperature: f64,
    i_state: f64,
    d_state: f64,
    active_temperature: f64,
    standby_temperature: f64,
    bad_temperature_count: u32,
    temperature_fault: bool,
    /// True: regulate to the active setpoint; false: the standby one.
    active: bool,
    switched_off: bool,
    heating_up: bool,
    time_set_heating: f64,
}

impl Pid {
    pub fn new(heater: usize) -> Self {
        Self {
            heater,
            temperature: ABS_ZERO,
            last_temperature: ABS_ZERO,
            i_state: 0.0,
            d_state: 0.0,
            active_temperature: ABS_ZERO,
            standby_temperature: ABS_ZERO,
            bad_temperature_count: 0,
            temperature_fault: false,
            active: false,
            switched_off: true,
            heating_up: false,
            time_set_heating: 0.0,
        }
    }

    pub fn init<P: Platform>(&mut self, platform: &mut P) {
        platform.set_heater(self.heater, 0.0);
        self.temperature = platform.get_temperature(self.heater);
        self.last_temperature = self.temperature;
        self.active_temperature = ABS_ZERO;
        self.standby_temperature = ABS_ZERO;
        self.i_state = 0.0;
        self.d_state = 0.0;
        self.bad_temperature_count = 0;
        self.temperature_fault = false;
        self.active = false;
        self.switched_off = true;
        self.heating_up = false;
    }

    /// One regulation step. Returns true when this step latched a new
    /// temperature fault, so the caller can propagate it to the tools.
    pub fn spin<P: Platform>(&mut self, platform: &mut P, settings: &HeatSettings) -> bool {
        // Always know our temperature, on or off.
        self.temperature = platform.get_temperature(self.heater);

        // Switched off means nothing is using us, which usually means no
        // thermistor is even connected, so skip the fault checks too.
        if self.temperature_fault || self.switched_off {
            platform.set_heater(self.heater, 0.0);
            return false;
        }

        // Silly-low and silly-high readings mean an open-circuit or a
        // shorted sensor respectively.
        if self.temperature < settings.bad_low_temperature
            || self.temperature > settings.bad_high_temperature
        {
            self.bad_temperature_count += 1;
            if self.bad_temperature_count > settings.max_bad_temperature_count {
                self.latch_fault(platform);
                tracing::error!(
                    "Temperature fault on heater {}, T = {:.1} C",
                    self.heater,
                    self.temperature
                );
                return true;
            }
        } else {
            self.bad_temperature_count = 0;
        }

        // A heater that takes too long to warm up probably has its sensor
        // out of contact with the block.
        if self.heating_up && !platform.heater_is_bed(self.heater) {
            let target = self.setpoint() - settings.temperature_close_enough;
            if self.temperature < target {
                let heating_time = platform.time() - self.time_set_heating;
                if heating_time > settings.time_to_hot {
                    self.latch_fault(platform);
                    tracing::error!(
                        "Heating fault on heater {}, T = {:.1} C; still not at temperature after {:.0} seconds",
                        self.heater,
                        self.temperature,
                        heating_time
                    );
                    return true;
                }
            } else {
                self.heating_up = false;
            }
        }

        let error = self.setpoint() - self.temperature;

        if !platform.use_pid(self.heater) {
            platform.set_heater(self.heater, if error > 0.0 { 1.0 } else { 0.0 });
            return false;
        }

        // Outside the full band the output saturates and the integrator
        // resets.
        let band = platform.full_pid_band(self.heater);
        if error < -band {
            self.i_state = 0.0;
            platform.set_heater(self.heater, 0.0);
            self.last_temperature = self.temperature;
            return false;
        }
        if error > band {
            self.i_state = 0.0;
            platform.set_heater(self.heater, 1.0);
            self.last_temperature = self.temperature;
            return false;
        }

        self.i_state = (self.i_state + error * platform.pid_ki(self.heater))
            .clamp(platform.pid_min(self.heater), platform.pid_max(self.heater));

        let mix = platform.d_mix(self.heater);
        self.d_state = platform.pid_kd(self.heater)
            * (self.temperature - self.last_temperature)
            * (1.0 - mix)
            + mix * self.d_state;

        let result = platform.pid_kp(self.heater) * error + self.i_state - self.d_state;
        self.last_temperature = self.temperature;

        // Legacy RepRap PID parameters produce values in [0, 255] for one
        // byte of PWM; scale down to [0, 1].
        let result = result.clamp(0.0, 255.0) / 255.0;
        platform.set_heater(self.heater, result);
        false
    }

    fn latch_fault<P: Platform>(&mut self, platform: &mut P) {
        platform.set_heater(self.heater, 0.0);
        self.temperature_fault = true;
        self.switched_off = true;
    }

    fn setpoint(&self) -> f64 {
        if self.active {
            self.active_temperature
        } else {
            self.standby_temperature
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn active_temperature(&self) -> f64 {
        self.active_temperature
    }

    pub fn standby_temperature(&self) -> f64 {
        self.standby_temperature
    }

    /// A rising active setpoint re-arms the warm-up watchdog.
    pub fn set_active_temperature(&mut self, temperature: f64, now: f64) {
        if !self.switched_off && self.active && temperature > self.active_temperature {
            self.heating_up = true;
            self.time_set_heating = now;
        }
        self.active_temperature = temperature;
    }

    pub fn set_standby_temperature(&mut self, temperature: f64) {
        self.standby_temperature = temperature;
    }

    /// Regulate to the active setpoint. Switches the heater on.
    pub fn activate(&mut self, now: f64) {
        if self.temperature_fault {
            return;
        }
        self.active = true;
        if self.switched_off {
            self.switched_off = false;
            self.heating_up = true;
            self.time_set_heating = now;
        }
    }

    /// Drop back to the standby setpoint, staying switched on.
    pub fn standby(&mut self) {
        self.active = false;
    }

    pub fn switch_off(&mut self) {
        self.switched_off = true;
    }

    pub fn is_switched_off(&self) -> bool {
        self.switched_off
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn temperature_fault(&self) -> bool {
        self.temperature_fault
    }

    /// External fault clear (an operator decision, never automatic).
    pub fn reset_fault(&mut self) {
        self.temperature_fault = false;
        self.bad_temperature_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hardware::SimPlatform;

    const NOZZLE: usize = 1;
    const BED: usize = 0;

    fn setup(heater: usize) -> (Pid, SimPlatform, HeatSettings) {
        let config = Config::default();
        let mut platform = SimPlatform::new(&config);
        let mut pid = Pid::new(heater);
        pid.init(&mut platform);
        (pid, platform, config.heat.clone())
    }

    #[test]
    fn switched_off_heater_gets_no_power() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.spin(&mut platform, &settings);
        assert_eq!(platform.heater_pwm(NOZZLE), 0.0);
    }

    #[test]
    fn full_band_saturates_and_resets_integrator() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        // 25 C against a 200 C setpoint is far outside the band: full on.
        pid.spin(&mut platform, &settings);
        assert_eq!(platform.heater_pwm(NOZZLE), 1.0);
        assert_eq!(pid.i_state, 0.0);
        // Well above the setpoint (but below the bad-reading threshold):
        // no power.
        platform.override_sensor(NOZZLE, Some(299.0));
        pid.spin(&mut platform, &settings);
        assert_eq!(platform.heater_pwm(NOZZLE), 0.0);
        assert_eq!(pid.i_state, 0.0);
    }

    #[test]
    fn proportional_band_produces_partial_power() {
        let config = Config::default();
        let mut platform = SimPlatform::new(&config);
        // Start the sensor near the setpoint so the first sample carries
        // no derivative kick.
        platform.override_sensor(NOZZLE, Some(195.0));
        let mut pid = Pid::new(NOZZLE);
        pid.init(&mut platform);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        pid.spin(&mut platform, &config.heat);
        let pwm = platform.heater_pwm(NOZZLE);
        assert!(pwm > 0.0 && pwm < 1.0, "pwm {pwm}");
    }

    #[test]
    fn integrator_clamps_at_configured_maximum() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(NOZZLE, Some(195.0));
        for _ in 0..10_000 {
            pid.spin(&mut platform, &settings);
        }
        assert!(pid.i_state <= platform.pid_max(NOZZLE));
        assert!((pid.i_state - platform.pid_max(NOZZLE)).abs() < 1e-9);
    }

    #[test]
    fn bang_bang_heater_is_all_or_nothing() {
        let (mut pid, mut platform, settings) = setup(BED);
        pid.set_active_temperature(60.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(BED, Some(55.0));
        pid.spin(&mut platform, &settings);
        assert_eq!(platform.heater_pwm(BED), 1.0);
        platform.override_sensor(BED, Some(65.0));
        pid.spin(&mut platform, &settings);
        assert_eq!(platform.heater_pwm(BED), 0.0);
    }

    #[test]
    fn bad_sensor_latches_fault_after_limit() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(NOZZLE, Some(-50.0));
        let mut latched = 0;
        for sample in 1..=8 {
            if pid.spin(&mut platform, &settings) {
                latched = sample;
            }
        }
        // Six bad samples are tolerated; the seventh latches.
        assert_eq!(latched, 7);
        assert!(pid.temperature_fault());
        assert_eq!(platform.heater_pwm(NOZZLE), 0.0);
        // A good reading afterwards changes nothing: the latch holds.
        platform.override_sensor(NOZZLE, Some(25.0));
        pid.spin(&mut platform, &settings);
        assert!(pid.temperature_fault());
        assert_eq!(platform.heater_pwm(NOZZLE), 0.0);
    }

    #[test]
    fn recovering_sensor_resets_bad_count() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        for _ in 0..5 {
            platform.override_sensor(NOZZLE, Some(-50.0));
            pid.spin(&mut platform, &settings);
        }
        platform.override_sensor(NOZZLE, Some(25.0));
        pid.spin(&mut platform, &settings);
        assert_eq!(pid.bad_temperature_count, 0);
        assert!(!pid.temperature_fault());
    }

    #[test]
    fn warm_up_watchdog_faults_a_cold_heater() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(NOZZLE, Some(25.0));
        pid.spin(&mut platform, &settings);
        assert!(!pid.temperature_fault());
        platform.advance(settings.time_to_hot + 1.0);
        let latched = pid.spin(&mut platform, &settings);
        assert!(latched);
        assert!(pid.temperature_fault());
        assert_eq!(platform.heater_pwm(NOZZLE), 0.0);
    }

    #[test]
    fn warm_up_watchdog_ignores_the_bed() {
        let (mut pid, mut platform, settings) = setup(BED);
        pid.set_active_temperature(60.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(BED, Some(25.0));
        platform.advance(settings.time_to_hot + 1.0);
        assert!(!pid.spin(&mut platform, &settings));
        assert!(!pid.temperature_fault());
    }

    #[test]
    fn reaching_temperature_disarms_the_watchdog() {
        let (mut pid, mut platform, settings) = setup(NOZZLE);
        pid.set_active_temperature(200.0, 0.0);
        pid.activate(0.0);
        platform.override_sensor(NOZZLE, Some(199.0));
        pid.spin(&mut platform, &settings);
        platform.advance(settings.time_to_hot + 1.0);
        platform.override_sensor(NOZZLE, Some(199.0));
        assert!(!pid.spin(&mut platform, &settings));
        assert!(!pid.temperature_fault());
    }
}

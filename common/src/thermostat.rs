use crate::config::{ThermostatConfig, ThermostatKind};

pub const THERMOSTAT_FIRST_READ_MS: u64 = 3_000;
pub const THERMOSTAT_NUDGE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterCoolerState {
    Off,
    Idle,
    Heating,
    Cooling,
}

impl HeaterCoolerState {
    pub fn code(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::Idle => 1,
            Self::Heating => 2,
            Self::Cooling => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    #[default]
    Auto,
    Heat,
    Cool,
}

impl TargetMode {
    pub fn code(self) -> i32 {
        match self {
            Self::Auto => 0,
            Self::Heat => 1,
            Self::Cool => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Auto),
            1 => Some(Self::Heat),
            2 => Some(Self::Cool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatEvent {
    TotalOff,
    HeaterIdle,
    CoolerIdle,
    HeaterOn,
    CoolerOn,
    SensorError,
}

impl ThermostatEvent {
    pub fn code(self) -> u8 {
        match self {
            Self::TotalOff => 0,
            Self::HeaterIdle => 1,
            Self::CoolerIdle => 2,
            Self::HeaterOn => 3,
            Self::CoolerOn => 4,
            Self::SensorError => 5,
        }
    }
}

/// Hysteresis controller behind a HeaterCooler service.
#[derive(Debug, Clone)]
pub struct Thermostat {
    kind: ThermostatKind,
    min_temp: f32,
    max_temp: f32,
    deadband: f32,

    active: bool,
    target_mode: TargetMode,
    heating_threshold: f32,
    cooling_threshold: f32,

    temperature: Option<f32>,
    humidity: Option<f32>,
    state: HeaterCoolerState,
}

impl Thermostat {
    pub fn new(config: &ThermostatConfig) -> Self {
        let target_mode = match config.kind {
            ThermostatKind::Heater => TargetMode::Heat,
            ThermostatKind::Cooler => TargetMode::Cool,
            ThermostatKind::HeaterCooler => TargetMode::Auto,
        };
        Self {
            kind: config.kind,
            min_temp: config.min_temp,
            max_temp: config.max_temp,
            deadband: config.deadband,
            active: false,
            target_mode,
            heating_threshold: config.heating_threshold,
            cooling_threshold: config.cooling_threshold,
            temperature: None,
            humidity: None,
            state: HeaterCoolerState::Off,
        }
    }

    pub fn kind(&self) -> ThermostatKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> HeaterCoolerState {
        self.state
    }

    pub fn target_mode(&self) -> TargetMode {
        self.target_mode
    }

    pub fn heating_threshold(&self) -> f32 {
        self.heating_threshold
    }

    pub fn cooling_threshold(&self) -> f32 {
        self.cooling_threshold
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn humidity(&self) -> Option<f32> {
        self.humidity
    }

    pub fn temp_range(&self) -> (f32, f32) {
        (self.min_temp, self.max_temp)
    }

    /// Single-purpose kinds ignore mode requests and stay on their own mode.
    pub fn effective_mode(&self) -> TargetMode {
        match self.kind {
            ThermostatKind::Heater => TargetMode::Heat,
            ThermostatKind::Cooler => TargetMode::Cool,
            ThermostatKind::HeaterCooler => self.target_mode,
        }
    }

    pub fn set_active(&mut self, active: bool) -> bool {
        let changed = self.active != active;
        self.active = active;
        changed
    }

    pub fn set_target_mode(&mut self, mode: TargetMode) -> bool {
        let changed = self.target_mode != mode;
        self.target_mode = mode;
        changed
    }

    pub fn set_heating_threshold(&mut self, value: f32) -> bool {
        let value = value.clamp(self.min_temp, self.max_temp);
        let changed = (self.heating_threshold - value).abs() > f32::EPSILON;
        self.heating_threshold = value;
        changed
    }

    pub fn set_cooling_threshold(&mut self, value: f32) -> bool {
        let value = value.clamp(self.min_temp, self.max_temp);
        let changed = (self.cooling_threshold - value).abs() > f32::EPSILON;
        self.cooling_threshold = value;
        changed
    }

    /// Moves whichever thresholds the current mode uses by `delta`.
    /// Returns true for each threshold that changed, as (heating, cooling).
    pub fn nudge(&mut self, delta: f32) -> (bool, bool) {
        match self.effective_mode() {
            TargetMode::Heat => (
                self.set_heating_threshold(self.heating_threshold + delta),
                false,
            ),
            TargetMode::Cool => (
                false,
                self.set_cooling_threshold(self.cooling_threshold + delta),
            ),
            TargetMode::Auto => (
                self.set_heating_threshold(self.heating_threshold + delta),
                self.set_cooling_threshold(self.cooling_threshold + delta),
            ),
        }
    }

    pub fn update_reading(&mut self, temperature: f32, humidity: Option<f32>) {
        self.temperature = Some(temperature);
        if humidity.is_some() {
            self.humidity = humidity;
        }
    }

    /// Called once the consecutive read failures reach the configured threshold.
    pub fn sensor_lost(&mut self) -> Option<ThermostatEvent> {
        self.temperature = None;
        self.humidity = None;
        self.state = HeaterCoolerState::Off;
        Some(ThermostatEvent::SensorError)
    }

    /// Recomputes the current state from the latest reading.
    pub fn evaluate(&mut self) -> Option<ThermostatEvent> {
        if !self.active {
            return self.transition(HeaterCoolerState::Off, ThermostatEvent::TotalOff);
        }
        let temp = self.temperature?;

        let heat_start = self.heating_threshold - self.deadband;
        let cool_start = self.cooling_threshold + self.deadband;

        match self.effective_mode() {
            TargetMode::Heat => match self.state {
                HeaterCoolerState::Heating if temp >= self.heating_threshold => {
                    self.transition(HeaterCoolerState::Idle, ThermostatEvent::HeaterIdle)
                }
                HeaterCoolerState::Heating => None,
                _ if temp < heat_start => {
                    self.transition(HeaterCoolerState::Heating, ThermostatEvent::HeaterOn)
                }
                _ => self.transition(HeaterCoolerState::Idle, ThermostatEvent::HeaterIdle),
            },
            TargetMode::Cool => match self.state {
                HeaterCoolerState::Cooling if temp <= self.cooling_threshold => {
                    self.transition(HeaterCoolerState::Idle, ThermostatEvent::CoolerIdle)
                }
                HeaterCoolerState::Cooling => None,
                _ if temp > cool_start => {
                    self.transition(HeaterCoolerState::Cooling, ThermostatEvent::CoolerOn)
                }
                _ => self.transition(HeaterCoolerState::Idle, ThermostatEvent::CoolerIdle),
            },
            TargetMode::Auto => {
                let midpoint = (self.heating_threshold + self.cooling_threshold) / 2.0;
                match self.state {
                    HeaterCoolerState::Heating if temp >= midpoint => {
                        self.transition(HeaterCoolerState::Idle, ThermostatEvent::HeaterIdle)
                    }
                    HeaterCoolerState::Cooling if temp <= midpoint => {
                        self.transition(HeaterCoolerState::Idle, ThermostatEvent::CoolerIdle)
                    }
                    HeaterCoolerState::Heating | HeaterCoolerState::Cooling => None,
                    _ if temp < heat_start => {
                        self.transition(HeaterCoolerState::Heating, ThermostatEvent::HeaterOn)
                    }
                    _ if temp > cool_start => {
                        self.transition(HeaterCoolerState::Cooling, ThermostatEvent::CoolerOn)
                    }
                    _ => self.transition(HeaterCoolerState::Idle, ThermostatEvent::HeaterIdle),
                }
            }
        }
    }

    fn transition(
        &mut self,
        next: HeaterCoolerState,
        event: ThermostatEvent,
    ) -> Option<ThermostatEvent> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn heater(deadband: f32) -> Thermostat {
        let mut thermostat = Thermostat::new(&ThermostatConfig {
            deadband,
            ..ThermostatConfig::default()
        });
        thermostat.set_active(true);
        thermostat
    }

    #[test]
    fn heats_below_deadband_and_idles_at_threshold() {
        let mut thermostat = heater(1.0);

        thermostat.update_reading(19.5, None);
        assert_eq!(
            thermostat.evaluate(),
            Some(ThermostatEvent::HeaterIdle),
            "inside the deadband the heater stays idle"
        );

        thermostat.update_reading(18.9, None);
        assert_eq!(thermostat.evaluate(), Some(ThermostatEvent::HeaterOn));
        assert_eq!(thermostat.state(), HeaterCoolerState::Heating);

        thermostat.update_reading(19.9, None);
        assert_eq!(thermostat.evaluate(), None);

        thermostat.update_reading(20.0, None);
        assert_eq!(thermostat.evaluate(), Some(ThermostatEvent::HeaterIdle));
    }

    #[test]
    fn inactive_forces_total_off_once() {
        let mut thermostat = heater(0.0);
        thermostat.update_reading(15.0, None);
        thermostat.evaluate();

        thermostat.set_active(false);
        assert_eq!(thermostat.evaluate(), Some(ThermostatEvent::TotalOff));
        assert_eq!(thermostat.evaluate(), None);
        assert_eq!(thermostat.state(), HeaterCoolerState::Off);
    }

    #[test]
    fn auto_mode_stops_at_midpoint() {
        let mut thermostat = Thermostat::new(&ThermostatConfig {
            kind: ThermostatKind::HeaterCooler,
            ..ThermostatConfig::default()
        });
        thermostat.set_active(true);

        thermostat.update_reading(26.0, None);
        assert_eq!(thermostat.evaluate(), Some(ThermostatEvent::CoolerOn));

        thermostat.update_reading(23.0, None);
        assert_eq!(thermostat.evaluate(), None);

        thermostat.update_reading(22.5, None);
        assert_eq!(thermostat.evaluate(), Some(ThermostatEvent::CoolerIdle));
    }

    #[test]
    fn single_purpose_kind_ignores_mode() {
        let mut thermostat = heater(0.0);
        thermostat.set_target_mode(TargetMode::Cool);
        assert_eq!(thermostat.effective_mode(), TargetMode::Heat);
    }

    #[test]
    fn nudge_is_clamped_to_range() {
        let mut thermostat = heater(0.0);
        thermostat.set_heating_threshold(37.8);

        assert_eq!(thermostat.nudge(THERMOSTAT_NUDGE), (true, false));
        assert_eq!(thermostat.heating_threshold(), 38.0);
        assert_eq!(thermostat.nudge(THERMOSTAT_NUDGE), (false, false));
    }

    #[test]
    fn sensor_loss_clears_reading() {
        let mut thermostat = heater(0.0);
        thermostat.update_reading(15.0, Some(40.0));
        thermostat.evaluate();

        assert_eq!(thermostat.sensor_lost(), Some(ThermostatEvent::SensorError));
        assert_eq!(thermostat.state(), HeaterCoolerState::Off);
        assert_eq!(thermostat.temperature(), None);
        assert_eq!(thermostat.evaluate(), None);
    }
}

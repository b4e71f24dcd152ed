use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    actions::{ActionList, WildcardAction},
    driver::DriverFamily,
    error::ConfigError,
    types::{AccType, PressKind},
};

pub const DEFAULT_SETUP_MODE_TOGGLE_COUNT: u8 = 8;

pub const INIT_STATE_FIXED_INPUT: u8 = 4;
pub const INIT_STATE_LAST: u8 = 5;
pub const INIT_STATE_INV_LAST: u8 = 6;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HaaConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub accessories: Vec<AccessoryConfig>,
}

impl HaaConfig {
    /// Parses the flashed JSON blob. An empty accessory list is fatal.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.general.sanitize();
        for (index, accessory) in self.accessories.iter_mut().enumerate() {
            if accessory.accessory.is_none() {
                accessory.accessory = Some(u8::try_from(index + 1).unwrap_or(u8::MAX));
            }
            accessory.sanitize();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accessories.is_empty() {
            return Err(ConfigError::NoAccessories);
        }
        self.general.light_driver.validate()?;

        let mut seen = HashSet::new();
        for accessory in &self.accessories {
            let number = accessory.number();
            if !seen.insert(number) {
                return Err(ConfigError::InvalidField {
                    accessory: number,
                    reason: "duplicate accessory number".to_string(),
                });
            }
            if let Some(state) = accessory.initial_state {
                if state > INIT_STATE_INV_LAST {
                    return Err(ConfigError::InvalidField {
                        accessory: number,
                        reason: format!("initial_state {state} is out of range"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub device_name: String,
    pub log_output: bool,
    pub status_led: Option<StatusLedConfig>,
    pub setup_mode_toggle_count: u8,
    pub allowed_setup_mode_time_s: u32,
    pub ota_repo: Option<String>,
    pub light_driver: LightDriverConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: "haa".to_string(),
            log_output: true,
            status_led: None,
            setup_mode_toggle_count: DEFAULT_SETUP_MODE_TOGGLE_COUNT,
            allowed_setup_mode_time_s: 0,
            ota_repo: None,
            light_driver: LightDriverConfig::default(),
        }
    }
}

impl GeneralConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.device_name.trim();
        self.device_name = if trimmed.is_empty() {
            "haa".to_string()
        } else {
            trimmed.to_string()
        };
        if self
            .ota_repo
            .as_deref()
            .is_some_and(|repo| repo.trim().is_empty())
        {
            self.ota_repo = None;
        }
        self.light_driver.sanitize();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusLedConfig {
    pub gpio: u8,
    #[serde(default = "default_true")]
    pub inverted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightDriverConfig {
    pub family: DriverFamily,
    pub frequency_hz: u16,
    pub num_chips: u8,
    pub data_gpio: Option<u8>,
    pub clock_gpio: Option<u8>,
}

impl Default for LightDriverConfig {
    fn default() -> Self {
        Self {
            family: DriverFamily::Pwm,
            frequency_hz: 1_000,
            num_chips: 1,
            data_gpio: None,
            clock_gpio: None,
        }
    }
}

impl LightDriverConfig {
    pub fn sanitize(&mut self) {
        self.frequency_hz = self.frequency_hz.clamp(100, 40_000);
        if self.num_chips == 0 {
            self.num_chips = 1;
        }
    }

    /// Chip and pixel families need their serial lines.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.family, self.data_gpio, self.clock_gpio) {
            (DriverFamily::Pwm, ..) => Ok(()),
            (DriverFamily::Ws2812, Some(_), _) => Ok(()),
            (DriverFamily::My9291 | DriverFamily::My9231, Some(data), Some(clock))
                if data != clock =>
            {
                Ok(())
            }
            (family, ..) => Err(ConfigError::LightDriver(format!(
                "{family:?} needs data_gpio{}",
                if family == DriverFamily::Ws2812 {
                    ""
                } else {
                    " and a distinct clock_gpio"
                }
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    #[default]
    Toggle,
    On,
    Off,
    Press,
    SecondToggle,
    Open,
    Close,
    Stop,
    Opened,
    Closed,
    Opening,
    Closing,
    Obstruction,
    ObstructionCleared,
    TempUp,
    TempDown,
    BrightnessUp,
    BrightnessDown,
    Autodimmer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InputBinding {
    pub gpio: u8,
    #[serde(default)]
    pub role: InputRole,
    #[serde(default)]
    pub press: PressKind,
    #[serde(default = "default_true")]
    pub pull_up: bool,
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    pub security: bool,
    pub child: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryConfig {
    #[serde(rename = "type")]
    pub acc_type: AccType,
    #[serde(default)]
    pub accessory: Option<u8>,
    #[serde(default)]
    pub initial_state: Option<u8>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub actions: BTreeMap<u8, ActionList>,
    #[serde(default)]
    pub wildcard_actions: BTreeMap<u8, Vec<WildcardAction>>,
    #[serde(default)]
    pub auto_off_s: f32,
    #[serde(default)]
    pub kill_switches: KillSwitchConfig,
    #[serde(default)]
    pub valve: ValveConfig,
    #[serde(default)]
    pub thermostat: ThermostatConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub lightbulb: LightbulbConfig,
    #[serde(default)]
    pub garage: GarageConfig,
    #[serde(default)]
    pub cover: WindowCoverConfig,
    #[serde(default)]
    pub zoning: ZoningConfig,
    #[serde(default)]
    pub tv: TvConfig,
}

impl AccessoryConfig {
    pub fn number(&self) -> u8 {
        self.accessory.unwrap_or_default()
    }

    pub fn has_input(&self, role: InputRole) -> bool {
        self.inputs.iter().any(|input| input.role == role)
    }

    pub fn sanitize(&mut self) {
        if !self.auto_off_s.is_finite() || self.auto_off_s < 0.0 {
            self.auto_off_s = 0.0;
        }
        self.valve.sanitize();
        self.thermostat.sanitize();
        self.sensor.sanitize();
        self.lightbulb.sanitize();
        self.garage.sanitize();
        self.cover.sanitize();
        self.wildcard_actions.retain(|index, _| *index < 4);
        for entries in self.wildcard_actions.values_mut() {
            entries.sort_by(|a, b| a.value.total_cmp(&b.value));
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    pub max_duration_s: Option<u32>,
}

impl ValveConfig {
    pub const DEFAULT_MAX_DURATION_S: u32 = 3_600;

    pub fn sanitize(&mut self) {
        if self.max_duration_s == Some(0) {
            self.max_duration_s = Some(Self::DEFAULT_MAX_DURATION_S);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatKind {
    #[default]
    Heater,
    Cooler,
    HeaterCooler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatConfig {
    pub kind: ThermostatKind,
    pub min_temp: f32,
    pub max_temp: f32,
    pub deadband: f32,
    pub heating_threshold: f32,
    pub cooling_threshold: f32,
    pub humidity: bool,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            kind: ThermostatKind::Heater,
            min_temp: 10.0,
            max_temp: 38.0,
            deadband: 0.0,
            heating_threshold: 20.0,
            cooling_threshold: 25.0,
            humidity: false,
        }
    }
}

impl ThermostatConfig {
    pub fn sanitize(&mut self) {
        if self.max_temp <= self.min_temp {
            self.min_temp = 10.0;
            self.max_temp = 38.0;
        }
        self.deadband = self.deadband.clamp(0.0, 10.0);
        self.heating_threshold = self.heating_threshold.clamp(self.min_temp, self.max_temp);
        self.cooling_threshold = self.cooling_threshold.clamp(self.min_temp, self.max_temp);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub poll_period_s: u32,
    pub temperature_offset: f32,
    pub humidity_offset: f32,
    pub error_threshold: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            poll_period_s: 30,
            temperature_offset: 0.0,
            humidity_offset: 0.0,
            error_threshold: 3,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        self.poll_period_s = self.poll_period_s.clamp(1, 3_600);
        if self.error_threshold == 0 {
            self.error_threshold = 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightbulbConfig {
    pub r: Option<u8>,
    pub g: Option<u8>,
    pub b: Option<u8>,
    pub w: Option<u8>,
    pub cw: Option<u8>,
    pub ww: Option<u8>,
    pub factor_r: f32,
    pub factor_g: f32,
    pub factor_b: f32,
    pub factor_w: f32,
    pub step: u16,
    pub autodimmer_delay_ms: u64,
    pub autodimmer_step: u8,
}

impl Default for LightbulbConfig {
    fn default() -> Self {
        Self {
            r: None,
            g: None,
            b: None,
            w: None,
            cw: None,
            ww: None,
            factor_r: 1.0,
            factor_g: 1.0,
            factor_b: 1.0,
            factor_w: 1.0,
            step: 1_024,
            autodimmer_delay_ms: 1_000,
            autodimmer_step: 20,
        }
    }
}

impl LightbulbConfig {
    pub fn sanitize(&mut self) {
        for factor in [
            &mut self.factor_r,
            &mut self.factor_g,
            &mut self.factor_b,
            &mut self.factor_w,
        ] {
            if !factor.is_finite() || *factor < 0.0 {
                *factor = 1.0;
            }
        }
        if self.step == 0 {
            self.step = 1_024;
        }
        self.autodimmer_step = self.autodimmer_step.min(100);
        self.autodimmer_delay_ms = self.autodimmer_delay_ms.max(50);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GarageConfig {
    pub open_time_s: f32,
    pub close_time_s: f32,
    pub margin_s: f32,
}

impl Default for GarageConfig {
    fn default() -> Self {
        Self {
            open_time_s: 30.0,
            close_time_s: 0.0,
            margin_s: 0.0,
        }
    }
}

impl GarageConfig {
    pub fn sanitize(&mut self) {
        if self.open_time_s.is_nan() || self.open_time_s <= 0.0 {
            self.open_time_s = 30.0;
        }
        if self.close_time_s.is_nan() || self.close_time_s <= 0.0 {
            self.close_time_s = self.open_time_s;
        }
        self.margin_s = self.margin_s.clamp(0.0, self.open_time_s / 2.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowCoverConfig {
    pub open_time_s: f32,
    pub close_time_s: f32,
    pub correction: f32,
}

impl Default for WindowCoverConfig {
    fn default() -> Self {
        Self {
            open_time_s: 15.0,
            close_time_s: 15.0,
            correction: 0.0,
        }
    }
}

impl WindowCoverConfig {
    pub fn sanitize(&mut self) {
        if self.open_time_s.is_nan() || self.open_time_s <= 0.0 {
            self.open_time_s = 15.0;
        }
        if self.close_time_s.is_nan() || self.close_time_s <= 0.0 {
            self.close_time_s = 15.0;
        }
        self.correction = self.correction.clamp(0.0, 50.0);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoningConfig {
    pub thermostats: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TvConfig {
    pub inputs: u8,
}

impl Default for TvConfig {
    fn default() -> Self {
        Self { inputs: 1 }
    }
}

fn default_true() -> bool {
    true
}

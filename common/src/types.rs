use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, lightbulb::PwmFrame, store::StoredValue};

/// Index of a characteristic in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChId(pub usize);

/// Index of an accessory group in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
}

impl Value {
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::Int(value) => value != 0,
            Self::Float(value) => value != 0.0,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Bool(value) => i32::from(value),
            Self::Int(value) => value,
            Self::Float(value) => value.round() as i32,
        }
    }

    pub fn as_f32(self) -> f32 {
        match self {
            Self::Bool(value) => f32::from(u8::from(value)),
            Self::Int(value) => value as f32,
            Self::Float(value) => value,
        }
    }

    /// Converts `self` to the variant of `existing`, so writes never change a
    /// characteristic's format.
    pub fn coerce_like(self, existing: Value) -> Value {
        match existing {
            Self::Bool(_) => Self::Bool(self.as_bool()),
            Self::Int(_) => Self::Int(self.as_i32()),
            Self::Float(_) => Self::Float(self.as_f32()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AccType {
    Switch,
    Outlet,
    Button,
    Lock,
    ContactSensor,
    OccupancySensor,
    LeakSensor,
    SmokeSensor,
    CarbonMonoxideSensor,
    CarbonDioxideSensor,
    FilterChangeSensor,
    MotionSensor,
    DoubleLock,
    WaterValve,
    Thermostat,
    TemperatureSensor,
    HumiditySensor,
    TempHumSensor,
    AirZoning,
    Lightbulb,
    GarageDoor,
    WindowCover,
    Tv,
    Fan,
    PowerMonitor,
}

impl AccType {
    pub fn code(self) -> u8 {
        match self {
            Self::Switch => 1,
            Self::Outlet => 2,
            Self::Button => 3,
            Self::Lock => 4,
            Self::ContactSensor => 5,
            Self::OccupancySensor => 6,
            Self::LeakSensor => 7,
            Self::SmokeSensor => 8,
            Self::CarbonMonoxideSensor => 9,
            Self::CarbonDioxideSensor => 10,
            Self::FilterChangeSensor => 11,
            Self::MotionSensor => 12,
            Self::DoubleLock => 15,
            Self::WaterValve => 20,
            Self::Thermostat => 21,
            Self::TemperatureSensor => 22,
            Self::HumiditySensor => 23,
            Self::TempHumSensor => 24,
            Self::AirZoning => 25,
            Self::Lightbulb => 30,
            Self::GarageDoor => 40,
            Self::WindowCover => 45,
            Self::Tv => 50,
            Self::Fan => 65,
            Self::PowerMonitor => 75,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Outlet => "outlet",
            Self::Button => "button",
            Self::Lock => "lock",
            Self::ContactSensor => "contact_sensor",
            Self::OccupancySensor => "occupancy_sensor",
            Self::LeakSensor => "leak_sensor",
            Self::SmokeSensor => "smoke_sensor",
            Self::CarbonMonoxideSensor => "carbon_monoxide_sensor",
            Self::CarbonDioxideSensor => "carbon_dioxide_sensor",
            Self::FilterChangeSensor => "filter_change_sensor",
            Self::MotionSensor => "motion_sensor",
            Self::DoubleLock => "double_lock",
            Self::WaterValve => "water_valve",
            Self::Thermostat => "thermostat",
            Self::TemperatureSensor => "temperature_sensor",
            Self::HumiditySensor => "humidity_sensor",
            Self::TempHumSensor => "temp_hum_sensor",
            Self::AirZoning => "air_zoning",
            Self::Lightbulb => "lightbulb",
            Self::GarageDoor => "garage_door",
            Self::WindowCover => "window_cover",
            Self::Tv => "tv",
            Self::Fan => "fan",
            Self::PowerMonitor => "power_monitor",
        }
    }

    pub fn is_binary_sensor(self) -> bool {
        matches!(
            self,
            Self::ContactSensor
                | Self::OccupancySensor
                | Self::LeakSensor
                | Self::SmokeSensor
                | Self::CarbonMonoxideSensor
                | Self::CarbonDioxideSensor
                | Self::FilterChangeSensor
                | Self::MotionSensor
        )
    }

    /// Types whose primary state is a plain on/off value.
    pub fn is_on_off(self) -> bool {
        matches!(self, Self::Switch | Self::Outlet | Self::Fan)
    }
}

impl TryFrom<u8> for AccType {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let acc_type = match code {
            1 => Self::Switch,
            2 => Self::Outlet,
            3 => Self::Button,
            4 => Self::Lock,
            5 => Self::ContactSensor,
            6 => Self::OccupancySensor,
            7 => Self::LeakSensor,
            8 => Self::SmokeSensor,
            9 => Self::CarbonMonoxideSensor,
            10 => Self::CarbonDioxideSensor,
            11 => Self::FilterChangeSensor,
            12 => Self::MotionSensor,
            15 => Self::DoubleLock,
            20 => Self::WaterValve,
            21 => Self::Thermostat,
            22 => Self::TemperatureSensor,
            23 => Self::HumiditySensor,
            24 => Self::TempHumSensor,
            25 => Self::AirZoning,
            30 => Self::Lightbulb,
            40 => Self::GarageDoor,
            45 => Self::WindowCover,
            50 => Self::Tv,
            65 => Self::Fan,
            75 => Self::PowerMonitor,
            other => return Err(ConfigError::UnknownType(other)),
        };
        Ok(acc_type)
    }
}

impl From<AccType> for u8 {
    fn from(acc_type: AccType) -> Self {
        acc_type.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressKind {
    #[default]
    Single,
    Double,
    Long,
}

impl PressKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Single => 0,
            Self::Double => 1,
            Self::Long => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Single),
            1 => Some(Self::Double),
            2 => Some(Self::Long),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "single" | "0" => Some(Self::Single),
            "double" | "1" => Some(Self::Double),
            "long" | "2" => Some(Self::Long),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SystemAction {
    Reboot,
    SetupMode,
    Ota,
}

impl TryFrom<u8> for SystemAction {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Reboot),
            1 => Ok(Self::SetupMode),
            2 => Ok(Self::Ota),
            other => Err(ConfigError::UnknownSystemAction(other)),
        }
    }
}

impl From<SystemAction> for u8 {
    fn from(action: SystemAction) -> Self {
        match action {
            SystemAction::Reboot => 0,
            SystemAction::SetupMode => 1,
            SystemAction::Ota => 2,
        }
    }
}

/// Side effect requested by the registry. The runtime executes these in order.
#[derive(Debug)]
pub enum Effect {
    Notify {
        ch: ChId,
        accessory: u8,
        slot: u8,
        value: Value,
    },
    GpioWrite {
        gpio: u8,
        level: bool,
    },
    PwmWrite(PwmFrame),
    SaveStates(Vec<(u16, StoredValue)>),
    System(SystemAction),
    LedBlink(u8),
}

impl Effect {
    pub fn is_notify_for(&self, target: ChId) -> bool {
        matches!(self, Self::Notify { ch, .. } if *ch == target)
    }
}

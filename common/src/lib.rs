pub mod actions;
pub mod characteristic;
pub mod color;
pub mod config;
pub mod driver;
pub mod error;
pub mod garage;
pub mod input;
pub mod lightbulb;
pub mod my92xx;
pub mod pixels;
pub mod registry;
pub mod sensor;
pub mod store;
pub mod thermostat;
pub mod timers;
pub mod topics;
pub mod types;
pub mod window_cover;

pub use config::{AccessoryConfig, GeneralConfig, HaaConfig, InputBinding, InputRole};
pub use driver::{DriverFamily, DriverInterface, DutySink};
pub use error::{ConfigError, StoreError};
pub use input::{ButtonDecoder, InputReader, NoInputs};
pub use lightbulb::{PwmFrame, PwmGate};
pub use my92xx::{My92xxChain, SerialPins};
pub use pixels::{PixelStrip, PixelWriter};
pub use registry::{AccessorySnapshot, Registry};
pub use sensor::{SensorProbe, SensorReading};
pub use store::{MemoryStore, StateStore, StoredValue};
pub use topics::*;
pub use types::{AccType, ChId, Effect, PressKind, SystemAction, Value};

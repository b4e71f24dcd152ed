use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config has no accessories")]
    NoAccessories,
    #[error("unknown accessory type {0}")]
    UnknownType(u8),
    #[error("unknown system action {0}")]
    UnknownSystemAction(u8),
    #[error("light driver: {0}")]
    LightDriver(String),
    #[error("accessory {accessory}: {reason}")]
    InvalidField { accessory: u8, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

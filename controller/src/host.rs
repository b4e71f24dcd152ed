use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::{Arc, Mutex as StdMutex, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use haa_common::{
    button_filter, parse_inbound, sensor_filter, set_filter, state_topic,
    store::key_name, ConfigError, DriverInterface, DutySink, Effect, HaaConfig, Inbound,
    NoInputs, PressKind, Registry, SensorProbe, SensorReading, StateStore, StoreError,
    StoredValue, SystemAction, Value,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const CONTROL_PERIOD_MS: u64 = 10;

type Readings = Arc<StdMutex<HashMap<u8, SensorReading>>>;

#[derive(Clone)]
struct AppState {
    registry: Arc<Mutex<Registry>>,
    driver: Arc<StdMutex<DriverInterface>>,
    store: Arc<StdMutex<FileStore>>,
    readings: Readings,
    mqtt: AsyncClient,
    device: Arc<str>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    value: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    setup: bool,
    #[serde(default)]
    states: BTreeMap<String, StoredValue>,
}

/// Persisted accessory state kept in one JSON file.
struct FileStore {
    path: PathBuf,
    contents: StoreFile,
}

/// Sensor probe fed by the latest reading published over MQTT. A poll with no
/// fresh reading counts as a failed read.
struct MqttProbe {
    accessory: u8,
    readings: Readings,
}

/// Light channels have no hardware on the host; duty updates are traced.
struct TraceSink;

pub async fn run() -> anyhow::Result<()> {
    let data_dir = std::env::var("HAA_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.haa"));
    let config_path = std::env::var("HAA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("config.json"));

    let parsed = load_config(&config_path).await;
    let log_output = parsed
        .as_ref()
        .map(|config| config.general.log_output)
        .unwrap_or(true);
    let filter = if log_output {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new("off")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut store = FileStore::open(&data_dir)
        .with_context(|| format!("failed to open state store in {}", data_dir.display()))?;
    if store.setup_flag() {
        warn!("setup mode flag was set; setup mode is not available on the host, clearing it");
        store.set_setup_flag(false)?;
    }

    let config = match parsed {
        Ok(config) => config,
        Err(err) => {
            if matches!(
                err.downcast_ref::<ConfigError>(),
                Some(ConfigError::NoAccessories)
            ) {
                warn!("configuration has no accessories, requesting setup mode");
                store.set_setup_flag(true)?;
                return Ok(());
            }
            return Err(err);
        }
    };

    let (mut registry, boot_effects) = Registry::build(&config, &store, &NoInputs, monotonic_ms())
        .context("failed to build accessories")?;
    let device: Arc<str> = Arc::from(registry.device_name());

    let readings: Readings = Arc::new(StdMutex::new(HashMap::new()));
    for accessory in &config.accessories {
        let probe = MqttProbe {
            accessory: accessory.number(),
            readings: readings.clone(),
        };
        if registry.attach_probe(accessory.number(), Box::new(probe)) {
            debug!("accessory {} reads its sensor from mqtt", accessory.number());
        }
    }

    let driver_config = &config.general.light_driver;
    let driver = DriverInterface::new(
        driver_config.family,
        usize::from(driver_config.num_chips),
        Some(Box::new(TraceSink)),
    );
    if registry.duty_len() > driver.duty_len() {
        warn!(
            "light channels need {} duty slots, driver provides {}",
            registry.duty_len(),
            driver.duty_len()
        );
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let mut mqtt_options = MqttOptions::new(format!("haa-{device}"), mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or_default();
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    info!(
        "{} accessories ready on device {device}",
        registry.len()
    );

    let app_state = AppState {
        registry: Arc::new(Mutex::new(registry)),
        driver: Arc::new(StdMutex::new(driver)),
        store: Arc::new(StdMutex::new(store)),
        readings,
        mqtt,
        device,
    };

    subscribe_topics(&app_state).await?;
    execute_effects(&app_state, boot_effects).await;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/api/accessories", get(handle_get_accessories))
        .route("/api/accessories/{aid}/{slot}", put(handle_put_characteristic))
        .route("/api/buttons/{gpio}/{press}", post(handle_post_button))
        .with_state(app_state);

    let port = std::env::var("HAA_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http server at {addr}"))?;

    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn load_config(path: &FsPath) -> anyhow::Result<HaaConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Ok(HaaConfig::from_json(&raw)?)
}

async fn subscribe_topics(app_state: &AppState) -> anyhow::Result<()> {
    let device = app_state.device.as_ref();
    for topic in [set_filter(device), sensor_filter(device), button_filter(device)] {
        app_state.mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_PERIOD_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let effects = {
                let mut registry = app_state.registry.lock().await;
                registry.tick(monotonic_ms())
            };
            if !effects.is_empty() {
                execute_effects(&app_state, effects).await;
            }
        }
    });
}

async fn execute_effects(app_state: &AppState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Notify {
                accessory,
                slot,
                value,
                ..
            } => {
                let topic = state_topic(&app_state.device, accessory, slot);
                match serde_json::to_vec(&value) {
                    Ok(body) => {
                        if let Err(err) = app_state
                            .mqtt
                            .publish(topic, QoS::AtLeastOnce, true, body)
                            .await
                        {
                            warn!("state publish failed: {err}");
                        }
                    }
                    Err(err) => warn!("state serialization failed: {err}"),
                }
            }
            Effect::GpioWrite { gpio, level } => info!("gpio {gpio} set {}", u8::from(level)),
            Effect::PwmWrite(frame) => {
                let driver = app_state.driver.clone();
                let written = tokio::task::spawn_blocking(move || match driver.lock() {
                    Ok(mut driver) => driver.set_all(frame.duty()),
                    Err(_) => warn!("light driver lock poisoned, frame dropped"),
                })
                .await;
                if let Err(err) = written {
                    warn!("light frame write failed: {err}");
                }
            }
            Effect::SaveStates(entries) => {
                let store = app_state.store.clone();
                let saved = tokio::task::spawn_blocking(move || match store.lock() {
                    Ok(mut store) => store.save(&entries),
                    Err(_) => Err(StoreError::Backend("store lock poisoned".to_string())),
                })
                .await;
                match saved {
                    Ok(Ok(())) => debug!("states saved"),
                    Ok(Err(err)) => warn!("failed to save states: {err}"),
                    Err(err) => warn!("state save task failed: {err}"),
                }
            }
            Effect::System(action) => run_system_action(app_state, action),
            Effect::LedBlink(gpio) => debug!("status led {gpio} blink"),
        }
    }
}

fn run_system_action(app_state: &AppState, action: SystemAction) {
    match action {
        SystemAction::Reboot => {
            info!("reboot requested, exiting");
            std::process::exit(0);
        }
        SystemAction::SetupMode => {
            let flagged = match app_state.store.lock() {
                Ok(mut store) => store.set_setup_flag(true),
                Err(_) => Err(StoreError::Backend("store lock poisoned".to_string())),
            };
            if let Err(err) = flagged {
                warn!("failed to persist setup flag: {err}");
                return;
            }
            info!("setup mode requested, exiting");
            std::process::exit(0);
        }
        SystemAction::Ota => warn!("ota update is only available in ESP32 builds"),
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some(inbound) = parse_inbound(&app_state.device, topic) else {
        return Ok(());
    };

    match inbound {
        Inbound::Set { accessory, slot } => {
            let value: Value = serde_json::from_str(message.trim())
                .with_context(|| format!("invalid value {message:?} for {topic}"))?;
            let effects = {
                let mut registry = app_state.registry.lock().await;
                registry.set_by_slot(accessory, slot, value, monotonic_ms())
            };
            execute_effects(app_state, effects).await;
        }
        Inbound::Sensor { accessory } => {
            let reading: SensorReading = serde_json::from_str(&message)
                .with_context(|| format!("invalid sensor reading for accessory {accessory}"))?;
            if let Ok(mut readings) = app_state.readings.lock() {
                readings.insert(accessory, reading);
            }
        }
        Inbound::Button { gpio } => {
            let Some(press) = PressKind::parse(message.trim()) else {
                warn!("unknown press {message:?} on gpio {gpio}");
                return Ok(());
            };
            let effects = {
                let mut registry = app_state.registry.lock().await;
                registry.button_event(gpio, press, monotonic_ms())
            };
            execute_effects(app_state, effects).await;
        }
    }

    Ok(())
}

async fn handle_get_accessories(State(state): State<AppState>) -> impl IntoResponse {
    let accessories = state.registry.lock().await.accessories();
    Json(accessories)
}

async fn handle_put_characteristic(
    State(state): State<AppState>,
    Path((aid, slot)): Path<(u8, u8)>,
    Json(request): Json<SetRequest>,
) -> impl IntoResponse {
    let effects = {
        let mut registry = state.registry.lock().await;
        if registry.find_ch(aid, slot).is_none() {
            return error_response(StatusCode::NOT_FOUND, "Unknown accessory or slot");
        }
        registry.set_by_slot(aid, slot, request.value, monotonic_ms())
    };
    execute_effects(&state, effects).await;
    handle_get_accessories(State(state)).await.into_response()
}

async fn handle_post_button(
    State(state): State<AppState>,
    Path((gpio, press)): Path<(u8, String)>,
) -> impl IntoResponse {
    let Some(press) = PressKind::parse(&press) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid press. Use 'single', 'double' or 'long'",
        );
    };
    let effects = {
        let mut registry = state.registry.lock().await;
        registry.button_event(gpio, press, monotonic_ms())
    };
    execute_effects(&state, effects).await;
    StatusCode::NO_CONTENT.into_response()
}

impl FileStore {
    fn open(data_dir: &FsPath) -> anyhow::Result<Self> {
        let path = data_dir.join("states.json");
        let contents = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<StoreFile>(&raw)
                .with_context(|| format!("corrupt state file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => StoreFile::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, contents })
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&self.contents)?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn load(&self, key: u16) -> Option<StoredValue> {
        self.contents.states.get(&key_name(key)).copied()
    }

    fn save(&mut self, entries: &[(u16, StoredValue)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.contents.states.insert(key_name(*key), *value);
        }
        self.flush()
    }

    fn setup_flag(&self) -> bool {
        self.contents.setup
    }

    fn set_setup_flag(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.contents.setup = enabled;
        self.flush()
    }
}

impl SensorProbe for MqttProbe {
    fn read(&mut self) -> Option<SensorReading> {
        self.readings.lock().ok()?.remove(&self.accessory)
    }
}

impl DutySink for TraceSink {
    fn set_channel(&mut self, chip: usize, channel: usize, duty: u16) {
        tracing::trace!("light chip {chip} channel {channel} duty {duty}");
    }

    fn update(&mut self) {}
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

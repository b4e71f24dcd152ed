use core::convert::TryInto;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Input, Level, Output, PinDriver, Pull},
    ledc::{
        config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, CHANNEL0, CHANNEL1,
        CHANNEL2, CHANNEL3, CHANNEL4, CHANNEL5, CHANNEL6, CHANNEL7, TIMER0,
    },
    rmt::{self, config::TransmitConfig, PinState, Pulse, TxRmtDriver, VariableLengthSignal},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use haa_common::{
    button_filter, config::LightDriverConfig, parse_inbound, sensor_filter, set_filter,
    state_topic, store::key_name, ButtonDecoder, ConfigError, DriverFamily, DriverInterface,
    DutySink, Effect, HaaConfig, Inbound, InputReader, My92xxChain, PixelStrip, PixelWriter,
    PressKind, Registry, SensorProbe, SensorReading, SerialPins, StateStore, StoreError,
    StoredValue, SystemAction, Value,
};

const NVS_NAMESPACE: &str = "haa";
const NVS_CONFIG_KEY: &str = "config";
const NVS_NETWORK_KEY: &str = "network";
const NVS_SETUP_KEY: &str = "setup";
const NVS_OTA_KEY: &str = "ota";
const MAX_CONFIG_BYTES: usize = 16 * 1024;
const MAX_NETWORK_BYTES: usize = 1024;
const MAX_STATE_BYTES: usize = 64;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const CONTROL_PERIOD_MS: u64 = 10;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_JOIN_ATTEMPTS: u32 = 4;
const WIFI_JOIN_BACKOFF_MS: u64 = 2_000;
const LED_BLINK_MS: u64 = 30;
const RESTART_DELAY_MS: u64 = 100;

type Readings = Arc<Mutex<HashMap<u8, SensorReading>>>;

#[derive(Clone)]
struct SharedState {
    registry: Arc<Mutex<Registry>>,
    outputs: Arc<Mutex<Outputs>>,
    store: NvsStore,
    readings: Readings,
    mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    mqtt_connected: Arc<AtomicBool>,
    device: Arc<str>,
}

/// Everything the effect executor drives.
struct Outputs {
    pins: HashMap<u8, PinDriver<'static, AnyOutputPin, Output>>,
    driver: DriverInterface,
    status_led: Option<StatusLed>,
}

struct StatusLed {
    gpio: u8,
    pin: PinDriver<'static, AnyOutputPin, Output>,
    inverted: bool,
    off_at_ms: Option<u64>,
}

struct InputPin {
    pin: PinDriver<'static, AnyIOPin, Input>,
    pressed_high: bool,
    decoder: ButtonDecoder,
}

/// Input pins keyed by GPIO, one driver per pin regardless of how many
/// accessories listen to it.
#[derive(Default)]
struct InputBank {
    pins: HashMap<u8, InputPin>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NetworkSettings {
    wifi_ssid: String,
    wifi_pass: String,
    mqtt_host: String,
    mqtt_port: Option<u16>,
    mqtt_user: String,
    mqtt_pass: String,
}

struct MqttProbe {
    accessory: u8,
    readings: Readings,
}

/// LEDC channels bound in duty-array order.
struct LedcSink {
    channels: Vec<Option<LedcDriver<'static>>>,
}

/// Bit-banged DI/DCKI lines of a MY92xx chain.
struct GpioSerial {
    di: PinDriver<'static, AnyOutputPin, Output>,
    dcki: PinDriver<'static, AnyOutputPin, Output>,
}

/// WS2812 data line on an RMT channel, one high/low pulse pair per bit.
struct RmtPixels {
    tx: TxRmtDriver<'static>,
    zero: (Pulse, Pulse),
    one: (Pulse, Pulse),
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    if store.setup_flag() {
        warn!("setup mode flag was set; this build has no setup portal, clearing it");
        store.set_setup_flag(false)?;
    }
    if store.flag(NVS_OTA_KEY) {
        warn!("ota flag was set; this build has no installer, clearing it");
        store.set_flag(NVS_OTA_KEY, false)?;
    }

    let config = match store.load_config() {
        Ok(config) => config,
        Err(err) => {
            if matches!(
                err.downcast_ref::<ConfigError>(),
                Some(ConfigError::NoAccessories)
            ) {
                warn!("configuration has no accessories, requesting setup mode");
                store.set_setup_flag(true)?;
            } else {
                warn!("no usable configuration: {err:#}");
            }
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    if !config.general.log_output {
        log::set_max_level(log::LevelFilter::Off);
    }

    let mut inputs = InputBank::default();
    for accessory in &config.accessories {
        for binding in &accessory.inputs {
            if inputs.pins.contains_key(&binding.gpio) {
                continue;
            }
            match init_input(binding.gpio, binding.pull_up) {
                Ok(pin) => {
                    inputs.pins.insert(
                        binding.gpio,
                        InputPin {
                            pin,
                            pressed_high: binding.pull_up == binding.inverted,
                            decoder: ButtonDecoder::new(),
                        },
                    );
                }
                Err(err) => warn!("input GPIO{} unavailable: {err:#}", binding.gpio),
            }
        }
    }

    let (mut registry, boot_effects) = Registry::build(&config, &store, &inputs, monotonic_ms())
        .context("failed to build accessories")?;
    let device: Arc<str> = Arc::from(registry.device_name());

    let readings: Readings = Arc::new(Mutex::new(HashMap::new()));
    for accessory in &config.accessories {
        let probe = MqttProbe {
            accessory: accessory.number(),
            readings: readings.clone(),
        };
        if registry.attach_probe(accessory.number(), Box::new(probe)) {
            debug!("accessory {} reads its sensor from mqtt", accessory.number());
        }
    }

    let sink = init_light_sink(&config.general.light_driver, registry.pwm_gpios());
    let driver = DriverInterface::new(
        config.general.light_driver.family,
        usize::from(config.general.light_driver.num_chips),
        sink,
    );

    let status_led = config
        .general
        .status_led
        .as_ref()
        .and_then(|led| init_status_led(led.gpio, led.inverted));

    let Peripherals { modem, .. } = Peripherals::take()?;
    let network = store.load_network().unwrap_or_else(|err| {
        warn!("failed to load network settings from NVS: {err:#}");
        NetworkSettings::default()
    });
    let wifi = if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing; running local control only");
        None
    } else {
        match connect_wifi(modem, sys_loop, nvs_partition, &network) {
            Ok(wifi) => Some(wifi),
            Err(err) => {
                warn!("wifi unavailable, running local control only: {err:#}");
                None
            }
        }
    };

    let mqtt = match (&wifi, network.mqtt_host.trim().is_empty()) {
        (Some(_), false) => match create_mqtt_client(&network, &device) {
            Ok(pair) => Some(pair),
            Err(err) => {
                warn!("mqtt client unavailable: {err:#}");
                None
            }
        },
        _ => None,
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    info!("{} accessories ready on device {device}", registry.len());

    let state = SharedState {
        registry: Arc::new(Mutex::new(registry)),
        outputs: Arc::new(Mutex::new(Outputs {
            pins: HashMap::new(),
            driver,
            status_led,
        })),
        store,
        readings,
        mqtt: mqtt
            .as_ref()
            .map(|(client, _)| client.clone()),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        device,
    };

    execute_effects(&state, boot_effects, monotonic_ms());

    if let Some((_, conn)) = mqtt {
        spawn_mqtt_receiver(state.clone(), conn)?;
    }
    spawn_control_loop(state, inputs)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkSettings,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;

    let mut last_err = None;
    for attempt in 1..=WIFI_JOIN_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("joined `{}`", network.wifi_ssid);
                last_err = None;
                break;
            }
            Err(err) => {
                let backoff_ms = WIFI_JOIN_BACKOFF_MS * u64::from(attempt);
                warn!(
                    "join {attempt}/{WIFI_JOIN_ATTEMPTS} failed ({err:#}), next try in {backoff_ms} ms"
                );
                last_err = Some(err);
                if attempt < WIFI_JOIN_ATTEMPTS {
                    let _ = wifi.disconnect();
                    thread::sleep(Duration::from_millis(backoff_ms));
                }
            }
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!("could not join `{}`: {err:#}", network.wifi_ssid));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkSettings,
    device: &str,
) -> anyhow::Result<(Arc<Mutex<EspMqttClient<'static>>>, EspMqttConnection)> {
    let url = format!(
        "mqtt://{}:{}",
        network.mqtt_host,
        network.mqtt_port.unwrap_or(1883)
    );
    let client_id = format!("haa-{device}");

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    let (client, conn) = EspMqttClient::new(url.as_str(), &conf)?;
    Ok((Arc::new(Mutex::new(client)), conn))
}

fn subscribe_topics(state: &SharedState) -> anyhow::Result<()> {
    let Some(mqtt) = &state.mqtt else {
        return Ok(());
    };
    let device = state.device.as_ref();
    let mut client = lock(mqtt);
    for topic in [set_filter(device), sensor_filter(device), button_filter(device)] {
        client.subscribe(&topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        info!("mqtt connected");
                        if let Err(err) = subscribe_topics(&state) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!("mqtt disconnected");
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Ok(message) = core::str::from_utf8(data) {
                            if let Err(err) = handle_mqtt_message(&state, topic, message) {
                                warn!("mqtt message handling failed: {err:#}");
                            }
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) -> anyhow::Result<()> {
    let Some(inbound) = parse_inbound(&state.device, topic) else {
        return Ok(());
    };

    match inbound {
        Inbound::Set { accessory, slot } => {
            let value: Value = serde_json::from_str(message.trim())
                .with_context(|| format!("invalid value {message:?} for {topic}"))?;
            let now_ms = monotonic_ms();
            let effects = lock(&state.registry).set_by_slot(accessory, slot, value, now_ms);
            execute_effects(state, effects, now_ms);
        }
        Inbound::Sensor { accessory } => {
            let reading: SensorReading = serde_json::from_str(message)
                .with_context(|| format!("invalid sensor reading for accessory {accessory}"))?;
            lock(&state.readings).insert(accessory, reading);
        }
        Inbound::Button { gpio } => {
            let Some(press) = PressKind::parse(message.trim()) else {
                warn!("unknown press {message:?} on gpio {gpio}");
                return Ok(());
            };
            let now_ms = monotonic_ms();
            let effects = lock(&state.registry).button_event(gpio, press, now_ms);
            execute_effects(state, effects, now_ms);
        }
    }

    Ok(())
}

fn spawn_control_loop(state: SharedState, mut inputs: InputBank) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = watch_current_task() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                let presses = inputs.poll(now_ms);
                let effects = {
                    let mut registry = lock(&state.registry);
                    let mut effects = Vec::new();
                    for (gpio, press) in presses {
                        effects.extend(registry.button_event(gpio, press, now_ms));
                    }
                    effects.extend(registry.tick(now_ms));
                    effects
                };
                if !effects.is_empty() {
                    execute_effects(&state, effects, now_ms);
                }
                lock(&state.outputs).expire_status_led(now_ms);

                thread::sleep(Duration::from_millis(CONTROL_PERIOD_MS));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn execute_effects(state: &SharedState, effects: Vec<Effect>, now_ms: u64) {
    for effect in effects {
        match effect {
            Effect::Notify {
                accessory,
                slot,
                value,
                ..
            } => publish_value(state, accessory, slot, value),
            Effect::GpioWrite { gpio, level } => lock(&state.outputs).write_gpio(gpio, level),
            Effect::PwmWrite(frame) => lock(&state.outputs).driver.set_all(frame.duty()),
            Effect::SaveStates(entries) => {
                let mut store = state.store.clone();
                match store.save(&entries) {
                    Ok(()) => debug!("{} states saved", entries.len()),
                    Err(err) => warn!("failed to save states: {err}"),
                }
            }
            Effect::System(action) => run_system_action(state, action),
            Effect::LedBlink(gpio) => lock(&state.outputs).blink_status_led(gpio, now_ms),
        }
    }
}

fn publish_value(state: &SharedState, accessory: u8, slot: u8, value: Value) {
    let Some(mqtt) = &state.mqtt else {
        debug!("accessory {accessory} slot {slot} is now {value:?}");
        return;
    };
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return;
    }
    let topic = state_topic(&state.device, accessory, slot);
    let payload = match serde_json::to_vec(&value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("state serialization failed: {err}");
            return;
        }
    };
    if let Err(err) = lock(mqtt).enqueue(&topic, QoS::AtLeastOnce, true, &payload) {
        warn!("state publish failed: {err:?}");
    }
}

fn run_system_action(state: &SharedState, action: SystemAction) {
    let mut store = state.store.clone();
    let flagged = match action {
        SystemAction::Reboot => Ok(()),
        SystemAction::SetupMode => store.set_setup_flag(true),
        SystemAction::Ota => store.set_flag(NVS_OTA_KEY, true),
    };
    if let Err(err) = flagged {
        warn!("failed to persist {action:?} request: {err}");
        return;
    }
    info!("{action:?} requested, restarting");
    thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

impl Outputs {
    fn write_gpio(&mut self, gpio: u8, level: bool) {
        if !self.pins.contains_key(&gpio) {
            match unsafe { PinDriver::output(AnyOutputPin::new(i32::from(gpio))) } {
                Ok(pin) => {
                    self.pins.insert(gpio, pin);
                }
                Err(err) => {
                    warn!("output GPIO{gpio} unavailable: {err}");
                    return;
                }
            }
        }
        let Some(pin) = self.pins.get_mut(&gpio) else {
            return;
        };
        if let Err(err) = pin.set_level(Level::from(level)) {
            warn!("failed to drive GPIO{gpio}: {err}");
        }
    }

    fn blink_status_led(&mut self, gpio: u8, now_ms: u64) {
        let Some(led) = self.status_led.as_mut().filter(|led| led.gpio == gpio) else {
            return;
        };
        if led.set(true).is_ok() {
            led.off_at_ms = Some(now_ms + LED_BLINK_MS);
        }
    }

    fn expire_status_led(&mut self, now_ms: u64) {
        let Some(led) = self.status_led.as_mut() else {
            return;
        };
        if led.off_at_ms.is_some_and(|off_at| now_ms >= off_at) {
            led.off_at_ms = None;
            let _ = led.set(false);
        }
    }
}

impl StatusLed {
    fn set(&mut self, lit: bool) -> anyhow::Result<()> {
        self.pin
            .set_level(Level::from(lit != self.inverted))
            .map_err(|err| {
                warn!("failed to drive status LED: {err}");
                anyhow!("{err}")
            })
    }
}

impl InputBank {
    fn poll(&mut self, now_ms: u64) -> Vec<(u8, PressKind)> {
        self.pins
            .iter_mut()
            .filter_map(|(gpio, input)| {
                let pressed = input.pin.is_high() == input.pressed_high;
                input
                    .decoder
                    .sample(pressed, now_ms)
                    .map(|press| (*gpio, press))
            })
            .collect()
    }
}

impl InputReader for InputBank {
    fn level(&self, gpio: u8) -> Option<bool> {
        self.pins.get(&gpio).map(|input| input.pin.is_high())
    }
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn read_str(&self, key: &str, capacity: usize) -> anyhow::Result<Option<String>> {
        let _guard = lock(&self.lock);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; capacity];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn load_config(&self) -> anyhow::Result<HaaConfig> {
        let raw = self
            .read_str(NVS_CONFIG_KEY, MAX_CONFIG_BYTES)?
            .ok_or_else(|| anyhow!("no configuration stored in NVS"))?;
        Ok(HaaConfig::from_json(&raw)?)
    }

    fn load_network(&self) -> anyhow::Result<NetworkSettings> {
        match self.read_str(NVS_NETWORK_KEY, MAX_NETWORK_BYTES)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(NetworkSettings::default()),
        }
    }

    fn flag(&self, key: &str) -> bool {
        let _guard = lock(&self.lock);
        self.open()
            .ok()
            .and_then(|nvs| nvs.get_u8(key).ok().flatten())
            .is_some_and(|value| value != 0)
    }

    fn set_flag(&self, key: &str, enabled: bool) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = self.open().map_err(backend)?;
        nvs.set_u8(key, u8::from(enabled)).map_err(backend)?;
        Ok(())
    }
}

impl StateStore for NvsStore {
    fn load(&self, key: u16) -> Option<StoredValue> {
        let raw = self.read_str(&key_name(key), MAX_STATE_BYTES).ok()??;
        serde_json::from_str(&raw).ok()
    }

    fn save(&mut self, entries: &[(u16, StoredValue)]) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = self.open().map_err(backend)?;
        for (key, value) in entries {
            let payload = serde_json::to_string(value)?;
            nvs.set_str(&key_name(*key), &payload).map_err(backend)?;
        }
        Ok(())
    }

    fn setup_flag(&self) -> bool {
        self.flag(NVS_SETUP_KEY)
    }

    fn set_setup_flag(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.set_flag(NVS_SETUP_KEY, enabled)
    }
}

impl SensorProbe for MqttProbe {
    fn read(&mut self) -> Option<SensorReading> {
        lock(&self.readings).remove(&self.accessory)
    }
}

impl DutySink for LedcSink {
    fn set_channel(&mut self, _chip: usize, channel: usize, duty: u16) {
        let Some(Some(driver)) = self.channels.get_mut(channel) else {
            return;
        };
        let scaled = u64::from(duty) * u64::from(driver.get_max_duty()) / u64::from(u16::MAX);
        if let Err(err) = driver.set_duty(scaled.try_into().unwrap_or(u32::MAX)) {
            warn!("failed to set LEDC channel {channel} duty: {err}");
        }
    }

    fn update(&mut self) {}
}

impl SerialPins for GpioSerial {
    fn set_di(&mut self, high: bool) {
        let _ = self.di.set_level(Level::from(high));
    }

    fn set_dcki(&mut self, high: bool) {
        let _ = self.dcki.set_level(Level::from(high));
    }

    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }
}

impl PixelWriter for RmtPixels {
    fn write(&mut self, grb: &[u8]) {
        let mut pulses = Vec::with_capacity(grb.len() * 16);
        for byte in grb {
            for bit in (0..8).rev() {
                let (high, low) = if (byte >> bit) & 1 == 1 {
                    &self.one
                } else {
                    &self.zero
                };
                pulses.push(high);
                pulses.push(low);
            }
        }

        let mut signal = VariableLengthSignal::with_capacity(pulses.len());
        if let Err(err) = signal.push(pulses) {
            warn!("failed to encode pixel frame: {err}");
            return;
        }
        if let Err(err) = self.tx.start_blocking(&signal) {
            warn!("pixel frame transmit failed: {err}");
        }
    }
}

fn init_light_sink(config: &LightDriverConfig, gpios: &[u8]) -> Option<Box<dyn DutySink>> {
    let num_chips = usize::from(config.num_chips);
    let sink = match (config.family, config.data_gpio, config.clock_gpio) {
        (DriverFamily::Pwm, ..) if gpios.is_empty() => return None,
        (DriverFamily::Pwm, ..) => init_pwm_sink(config.frequency_hz, gpios),
        (DriverFamily::My9291 | DriverFamily::My9231, Some(data), Some(clock)) => {
            init_serial_pins(data, clock).map(|pins| {
                info!(
                    "{:?} chain of {num_chips} on DI GPIO{data}, DCKI GPIO{clock}",
                    config.family
                );
                Box::new(My92xxChain::new(pins, config.family, num_chips)) as Box<dyn DutySink>
            })
        }
        (DriverFamily::Ws2812, Some(data), _) => init_rmt_pixels(data).map(|writer| {
            info!("{num_chips} pixels on GPIO{data}");
            Box::new(PixelStrip::new(writer, num_chips)) as Box<dyn DutySink>
        }),
        (family, ..) => Err(anyhow!("{family:?} is missing its data or clock GPIO")),
    };

    sink.map_err(|err| warn!("light driver unavailable, lights stay dark: {err:#}"))
        .ok()
}

fn init_pwm_sink(frequency_hz: u16, gpios: &[u8]) -> anyhow::Result<Box<dyn DutySink>> {
    let timer = LedcTimerDriver::new(
        unsafe { TIMER0::new() },
        &TimerConfig::new()
            .frequency(u32::from(frequency_hz).Hz())
            .resolution(Resolution::Bits13),
    )
    .context("LEDC timer unavailable")?;
    // Channels borrow the timer for the program lifetime.
    let timer: &'static LedcTimerDriver<'static, TIMER0> = Box::leak(Box::new(timer));

    let channels = gpios
        .iter()
        .enumerate()
        .map(|(index, gpio)| {
            let pin = unsafe { AnyOutputPin::new(i32::from(*gpio)) };
            match ledc_channel(index, timer, pin) {
                Ok(driver) => Some(driver),
                Err(err) => {
                    warn!("PWM output on GPIO{gpio} unavailable: {err:#}");
                    None
                }
            }
        })
        .collect();

    info!("PWM lights on GPIOs {gpios:?} at {frequency_hz} Hz");
    Ok(Box::new(LedcSink { channels }))
}

fn init_serial_pins(data: u8, clock: u8) -> anyhow::Result<GpioSerial> {
    let di = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(data))) }
        .with_context(|| format!("DI GPIO{data} unavailable"))?;
    let dcki = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(clock))) }
        .with_context(|| format!("DCKI GPIO{clock} unavailable"))?;
    Ok(GpioSerial { di, dcki })
}

fn init_rmt_pixels(data: u8) -> anyhow::Result<RmtPixels> {
    let config = TransmitConfig::new().clock_divider(1);
    let tx = TxRmtDriver::new(
        unsafe { rmt::CHANNEL0::new() },
        unsafe { AnyOutputPin::new(i32::from(data)) },
        &config,
    )
    .context("failed to init RMT pixel driver")?;

    let ticks_hz = tx.counter_clock()?;
    let pulse = |level, ns| {
        Pulse::new_with_duration(ticks_hz, level, &Duration::from_nanos(ns))
            .context("invalid WS2812 pulse timing")
    };
    Ok(RmtPixels {
        zero: (pulse(PinState::High, 350)?, pulse(PinState::Low, 800)?),
        one: (pulse(PinState::High, 700)?, pulse(PinState::Low, 600)?),
        tx,
    })
}

fn ledc_channel(
    index: usize,
    timer: &'static LedcTimerDriver<'static, TIMER0>,
    pin: AnyOutputPin,
) -> anyhow::Result<LedcDriver<'static>> {
    let driver = unsafe {
        match index {
            0 => LedcDriver::new(CHANNEL0::new(), timer, pin)?,
            1 => LedcDriver::new(CHANNEL1::new(), timer, pin)?,
            2 => LedcDriver::new(CHANNEL2::new(), timer, pin)?,
            3 => LedcDriver::new(CHANNEL3::new(), timer, pin)?,
            4 => LedcDriver::new(CHANNEL4::new(), timer, pin)?,
            5 => LedcDriver::new(CHANNEL5::new(), timer, pin)?,
            6 => LedcDriver::new(CHANNEL6::new(), timer, pin)?,
            7 => LedcDriver::new(CHANNEL7::new(), timer, pin)?,
            _ => return Err(anyhow!("no LEDC channel left for output {index}")),
        }
    };
    Ok(driver)
}

fn init_input(gpio: u8, pull_up: bool) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut pin = unsafe { PinDriver::input(AnyIOPin::new(i32::from(gpio))) }?;
    pin.set_pull(if pull_up { Pull::Up } else { Pull::Floating })?;
    Ok(pin)
}

fn init_status_led(gpio: u8, inverted: bool) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(gpio))) };
    match driver {
        Ok(pin) => {
            let mut led = StatusLed {
                gpio,
                pin,
                inverted,
                off_at_ms: None,
            };
            let _ = led.set(false);
            Some(led)
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{gpio}: {err}");
            None
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    wdt_result("init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })
}

/// Subscribes the calling task; it must then call [`feed_watchdog`] every loop.
fn watch_current_task() -> anyhow::Result<()> {
    wdt_result("add", unsafe {
        esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
    })
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

/// An already configured watchdog counts as success.
fn wdt_result(step: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        rc => Err(anyhow!("task watchdog {step} returned {rc}")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Milliseconds since boot from the high resolution timer.
fn monotonic_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros / 1000).unwrap_or_default()
}

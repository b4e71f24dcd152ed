use std::collections::HashMap;

use crate::{
    actions::{ActionTable, WildcardTable},
    config::{
        AccessoryConfig, HaaConfig, InputRole, INIT_STATE_FIXED_INPUT, INIT_STATE_INV_LAST,
        INIT_STATE_LAST,
    },
    driver::ChannelAllocator,
    error::ConfigError,
    garage::{DoorState, GarageDoor},
    input::InputReader,
    lightbulb::{LightbulbEngine, LightbulbGroup, LightKind},
    sensor::SensorPoll,
    store::{state_key, StateStore, StoreKind, SLOT_CHILD_KILL_SWITCH, SLOT_SECURITY_KILL_SWITCH},
    thermostat::{TargetMode, Thermostat, THERMOSTAT_FIRST_READ_MS},
    timers::{Scheduler, TimerKey, TimerSlot},
    types::{AccType, ChId, Effect, GroupId, Value},
    window_cover::WindowCover,
};

use super::{ChGroup, GroupState, Registry, MAX_CHANNELS};

/// Persistence context for one accessory under construction.
struct Restore<'a> {
    store: &'a dyn StateStore,
    accessory: u8,
    enabled: bool,
}

impl Registry {
    /// Builds every accessory from `config`, restores persisted state and
    /// applies initial states. Boot-time effects are returned alongside.
    pub fn build(
        config: &HaaConfig,
        store: &dyn StateStore,
        inputs: &dyn InputReader,
        now_ms: u64,
    ) -> Result<(Self, Vec<Effect>), ConfigError> {
        config.validate()?;

        let driver = &config.general.light_driver;
        let mut allocator = ChannelAllocator::new(driver.family, usize::from(driver.num_chips));
        let mut registry = Self {
            general: config.general.clone(),
            groups: Vec::with_capacity(config.accessories.len()),
            chars: Default::default(),
            by_accessory: HashMap::new(),
            input_map: HashMap::new(),
            lights: LightbulbEngine::new(allocator.duty_len()),
            pwm_gpios: Vec::new(),
            scheduler: Scheduler::new(),
            last_states: Default::default(),
            probes: HashMap::new(),
            setup_counter: i32::MIN,
            boot_ms: now_ms,
            now_ms,
            depth: 0,
            effects: Vec::new(),
        };

        for accessory in &config.accessories {
            registry.setup_counter = i32::MIN;
            registry.add_accessory(accessory, store, inputs, &mut allocator)?;
        }
        registry.check_zoning()?;
        registry.refresh_zoning();

        registry.pwm_gpios = allocator.pwm_gpios().to_vec();
        registry.setup_counter = 0;
        log::info!(
            "registry built: {} accessories, {} characteristics, {} persisted",
            registry.groups.len(),
            registry.chars.len(),
            registry.last_states.len()
        );

        let effects = registry.take_effects();
        Ok((registry, effects))
    }

    fn add_accessory(
        &mut self,
        config: &AccessoryConfig,
        store: &dyn StateStore,
        inputs: &dyn InputReader,
        allocator: &mut ChannelAllocator,
    ) -> Result<(), ConfigError> {
        let gid = GroupId(self.groups.len());
        let accessory = config.number();
        self.groups.push(ChGroup {
            accessory,
            acc_type: config.acc_type,
            chs: [None; MAX_CHANNELS],
            ch_sec: None,
            ch_child: None,
            state: GroupState::Basic,
            actions: ActionTable::new(config.actions.clone()),
            wildcards: WildcardTable::new(config.wildcard_actions.clone()),
            auto_off_ms: (config.auto_off_s * 1_000.0).round() as u64,
        });
        self.by_accessory.insert(accessory, gid);

        let restore = Restore {
            store,
            accessory,
            enabled: matches!(
                config.initial_state,
                Some(INIT_STATE_LAST | INIT_STATE_INV_LAST)
            ),
        };

        self.add_kill_switches(gid, config, &restore);
        for binding in &config.inputs {
            self.input_map
                .entry(binding.gpio)
                .or_default()
                .push((gid, *binding));
        }

        match config.acc_type {
            AccType::Switch | AccType::Outlet => {
                let on = self.add_ch(gid, 0, "On", Value::Bool(false), None);
                if config.acc_type == AccType::Outlet {
                    self.add_ch(gid, 1, "OutletInUse", Value::Bool(false), None);
                }
                let saved = self.persist(on, 0, StoreKind::Bool, &restore);
                self.boot_primary(gid, 0, config, saved, inputs);
            }
            AccType::Fan => {
                let active = self.add_ch(gid, 0, "Active", Value::Int(0), Some((0.0, 1.0)));
                let speed = self.add_ch(
                    gid,
                    1,
                    "RotationSpeed",
                    Value::Float(100.0),
                    Some((0.0, 100.0)),
                );
                if let Some(value) = self.persist(speed, 1, StoreKind::FloatX100, &restore) {
                    self.set_slot(gid, 1, value);
                }
                let saved = self.persist(active, 0, StoreKind::Int8, &restore);
                self.boot_primary(gid, 0, config, saved, inputs);
            }
            AccType::Button => {
                self.add_ch(
                    gid,
                    0,
                    "ProgrammableSwitchEvent",
                    Value::Int(0),
                    Some((0.0, 2.0)),
                );
            }
            AccType::Lock | AccType::DoubleLock => {
                let bases: &[u8] = if config.acc_type == AccType::Lock {
                    &[0]
                } else {
                    &[0, 2]
                };
                let mut targets = Vec::with_capacity(bases.len());
                for base in bases {
                    self.add_ch(gid, *base, "LockCurrentState", Value::Int(1), Some((0.0, 3.0)));
                    let target =
                        self.add_ch(gid, base + 1, "LockTargetState", Value::Int(1), Some((0.0, 1.0)));
                    targets.push((target, base + 1));
                }
                for (target, slot) in targets {
                    let saved = self.persist(target, slot, StoreKind::Int8, &restore);
                    self.boot_primary(gid, slot, config, saved, inputs);
                }
            }
            acc_type if acc_type.is_binary_sensor() => {
                let initial = if acc_type == AccType::MotionSensor {
                    Value::Bool(false)
                } else {
                    Value::Int(0)
                };
                self.add_ch(gid, 0, sensor_name(acc_type), initial, Some((0.0, 1.0)));
                self.boot_primary(gid, 0, config, None, inputs);
            }
            AccType::WaterValve => {
                let active = self.add_ch(gid, 0, "Active", Value::Int(0), Some((0.0, 1.0)));
                self.add_ch(gid, 1, "InUse", Value::Int(0), Some((0.0, 1.0)));
                let max_duration_s = config.valve.max_duration_s;
                if let Some(max) = max_duration_s {
                    let range = Some((0.0, max as f32));
                    let initial = Value::Int(i32::try_from(max.min(900)).unwrap_or(900));
                    let duration = self.add_ch(gid, 2, "SetDuration", initial, range);
                    self.add_ch(gid, 3, "RemainingDuration", Value::Int(0), range);
                    let always = Restore {
                        enabled: true,
                        ..restore
                    };
                    if let Some(value) = self.persist(duration, 2, StoreKind::Int32, &always) {
                        self.set_slot(gid, 2, value);
                    }
                }
                self.groups[gid.0].state = GroupState::Valve { max_duration_s };
                let saved = self.persist(active, 0, StoreKind::Int8, &restore);
                self.boot_primary(gid, 0, config, saved, inputs);
            }
            AccType::Thermostat => self.add_thermostat(gid, config, &restore, inputs),
            AccType::TemperatureSensor
            | AccType::HumiditySensor
            | AccType::TempHumSensor
            | AccType::PowerMonitor => self.add_sensor(gid, config),
            AccType::AirZoning => {
                self.add_ch(
                    gid,
                    0,
                    "CurrentHeaterCoolerState",
                    Value::Int(0),
                    Some((0.0, 3.0)),
                );
                self.groups[gid.0].state = GroupState::Zoning {
                    members: config.zoning.thermostats.clone(),
                };
            }
            AccType::Lightbulb => self.add_lightbulb(gid, config, &restore, inputs, allocator),
            AccType::GarageDoor => self.add_garage(gid, config, &restore),
            AccType::WindowCover => self.add_cover(gid, config, &restore),
            AccType::Tv => {
                let inputs_count = config.tv.inputs.max(1);
                let active = self.add_ch(gid, 0, "Active", Value::Int(0), Some((0.0, 1.0)));
                let input = self.add_ch(
                    gid,
                    1,
                    "ActiveIdentifier",
                    Value::Int(1),
                    Some((1.0, f32::from(inputs_count))),
                );
                self.add_ch(gid, 2, "Mute", Value::Bool(false), None);
                self.add_ch(gid, 3, "RemoteKey", Value::Int(0), Some((0.0, 16.0)));
                self.add_ch(gid, 4, "VolumeSelector", Value::Int(0), Some((0.0, 1.0)));
                self.groups[gid.0].state = GroupState::Tv {
                    inputs: inputs_count,
                };
                if let Some(value) = self.persist(input, 1, StoreKind::Int8, &restore) {
                    self.set_slot(gid, 1, value);
                }
                let saved = self.persist(active, 0, StoreKind::Int8, &restore);
                self.boot_primary(gid, 0, config, saved, inputs);
            }
            _ => return Err(ConfigError::UnknownType(config.acc_type.code())),
        }

        log::debug!(
            "accessory {accessory} built as {}",
            config.acc_type.as_str()
        );
        Ok(())
    }

    fn add_ch(
        &mut self,
        gid: GroupId,
        slot: u8,
        name: &'static str,
        value: Value,
        range: Option<(f32, f32)>,
    ) -> ChId {
        let ch = self.chars.add_ranged(gid, slot, name, value, range);
        if let Some(entry) = self.groups[gid.0].chs.get_mut(usize::from(slot)) {
            *entry = Some(ch);
        }
        ch
    }

    /// Registers `ch` for write-back when last-state restore is enabled and
    /// returns the stored value, if any.
    fn persist(
        &mut self,
        ch: ChId,
        slot: u8,
        kind: StoreKind,
        restore: &Restore<'_>,
    ) -> Option<Value> {
        if !restore.enabled {
            return None;
        }
        let key = state_key(restore.accessory, slot);
        let saved = restore.store.load(key);
        self.last_states.register(ch, key, kind, saved);
        saved.map(|value| value.to_value())
    }

    fn add_kill_switches(&mut self, gid: GroupId, config: &AccessoryConfig, restore: &Restore<'_>) {
        let always = Restore {
            enabled: true,
            store: restore.store,
            accessory: restore.accessory,
        };
        if config.kill_switches.security {
            let ch = self.chars.add(
                gid,
                SLOT_SECURITY_KILL_SWITCH,
                "SecuritySwitch",
                Value::Bool(true),
            );
            if let Some(value) = self.persist(ch, SLOT_SECURITY_KILL_SWITCH, StoreKind::Bool, &always)
            {
                self.chars.set(ch, value);
            }
            self.groups[gid.0].ch_sec = Some(ch);
        }
        if config.kill_switches.child {
            let ch = self
                .chars
                .add(gid, SLOT_CHILD_KILL_SWITCH, "ChildLock", Value::Bool(true));
            if let Some(value) = self.persist(ch, SLOT_CHILD_KILL_SWITCH, StoreKind::Bool, &always) {
                self.chars.set(ch, value);
            }
            self.groups[gid.0].ch_child = Some(ch);
        }
    }

    /// Applies the initial state of a two-state slot through the setter so its
    /// boot actions fire.
    fn boot_primary(
        &mut self,
        gid: GroupId,
        slot: u8,
        config: &AccessoryConfig,
        saved: Option<Value>,
        inputs: &dyn InputReader,
    ) {
        let Some(desired) = initial_bool(config, saved, inputs) else {
            return;
        };
        let Some(ch) = self.ch(gid, slot) else {
            return;
        };
        let opposite = Value::Bool(!desired).coerce_like(self.chars.value(ch));
        self.chars.set(ch, opposite);
        self.write(ch, Value::Bool(desired), false);
    }

    fn add_thermostat(
        &mut self,
        gid: GroupId,
        config: &AccessoryConfig,
        restore: &Restore<'_>,
        inputs: &dyn InputReader,
    ) {
        let settings = &config.thermostat;
        let range = Some((settings.min_temp, settings.max_temp));
        self.add_ch(gid, 0, "CurrentTemperature", Value::Float(0.0), Some((-100.0, 200.0)));
        let active = self.add_ch(gid, 1, "Active", Value::Int(0), Some((0.0, 1.0)));
        self.add_ch(gid, 2, "CurrentHeaterCoolerState", Value::Int(0), Some((0.0, 3.0)));
        let mode = self.add_ch(gid, 3, "TargetHeaterCoolerState", Value::Int(0), Some((0.0, 2.0)));
        let heat = self.add_ch(
            gid,
            4,
            "HeatingThresholdTemperature",
            Value::Float(settings.heating_threshold),
            range,
        );
        let cool = self.add_ch(
            gid,
            5,
            "CoolingThresholdTemperature",
            Value::Float(settings.cooling_threshold),
            range,
        );
        if settings.humidity {
            self.add_ch(gid, 6, "CurrentRelativeHumidity", Value::Float(0.0), Some((0.0, 100.0)));
        }

        let mut machine = Thermostat::new(settings);
        if let Some(value) = self.persist(mode, 3, StoreKind::Int8, restore) {
            if let Some(mode) = TargetMode::from_code(value.as_i32()) {
                machine.set_target_mode(mode);
            }
        }
        if let Some(value) = self.persist(heat, 4, StoreKind::FloatX100, restore) {
            machine.set_heating_threshold(value.as_f32());
        }
        if let Some(value) = self.persist(cool, 5, StoreKind::FloatX100, restore) {
            machine.set_cooling_threshold(value.as_f32());
        }
        self.groups[gid.0].state = GroupState::Thermostat {
            machine,
            poll: SensorPoll::new(&config.sensor),
        };
        self.sync_thermostat(gid);
        self.arm_poll(gid);

        let saved = self.persist(active, 1, StoreKind::Int8, restore);
        self.boot_primary(gid, 1, config, saved, inputs);
    }

    fn add_sensor(&mut self, gid: GroupId, config: &AccessoryConfig) {
        let climate = Some((-100.0, 200.0));
        let percent = Some((0.0, 100.0));
        match config.acc_type {
            AccType::TemperatureSensor => {
                self.add_ch(gid, 0, "CurrentTemperature", Value::Float(0.0), climate);
            }
            AccType::HumiditySensor => {
                self.add_ch(gid, 0, "CurrentRelativeHumidity", Value::Float(0.0), percent);
            }
            AccType::TempHumSensor => {
                self.add_ch(gid, 0, "CurrentTemperature", Value::Float(0.0), climate);
                self.add_ch(gid, 1, "CurrentRelativeHumidity", Value::Float(0.0), percent);
            }
            _ => {
                self.add_ch(gid, 0, "Voltage", Value::Float(0.0), None);
                self.add_ch(gid, 1, "Current", Value::Float(0.0), None);
                self.add_ch(gid, 2, "Power", Value::Float(0.0), None);
            }
        }
        self.groups[gid.0].state = GroupState::Sensor {
            poll: SensorPoll::new(&config.sensor),
        };
        self.arm_poll(gid);
    }

    fn arm_poll(&mut self, gid: GroupId) {
        let period_ms = match &self.groups[gid.0].state {
            GroupState::Thermostat { poll, .. } | GroupState::Sensor { poll } => poll.period_ms,
            _ => return,
        };
        self.scheduler.arm_periodic_after(
            TimerKey::Group(gid, TimerSlot::Secondary),
            self.now_ms,
            THERMOSTAT_FIRST_READ_MS,
            period_ms,
        );
    }

    fn add_lightbulb(
        &mut self,
        gid: GroupId,
        config: &AccessoryConfig,
        restore: &Restore<'_>,
        inputs: &dyn InputReader,
        allocator: &mut ChannelAllocator,
    ) {
        let on = self.add_ch(gid, 0, "On", Value::Bool(false), None);
        let light = LightbulbGroup::from_config(
            on,
            gid,
            &config.lightbulb,
            allocator,
            self.general.light_driver.family,
        );
        let kind = light.kind;
        let index = self.lights.add(light);
        self.groups[gid.0].state = GroupState::Lightbulb { index };

        let brightness = self.add_ch(gid, 1, "Brightness", Value::Int(100), Some((0.0, 100.0)));
        let mut extras = Vec::new();
        match kind {
            LightKind::Color { .. } => {
                extras.push((
                    self.add_ch(gid, 2, "Hue", Value::Float(0.0), Some((0.0, 360.0))),
                    2,
                    StoreKind::Int32,
                ));
                extras.push((
                    self.add_ch(gid, 3, "Saturation", Value::Float(0.0), Some((0.0, 100.0))),
                    3,
                    StoreKind::Int8,
                ));
            }
            LightKind::ColorTemperature => {
                extras.push((
                    self.add_ch(
                        gid,
                        2,
                        "ColorTemperature",
                        Value::Int(152),
                        Some((crate::color::COLOR_TEMP_MIN, crate::color::COLOR_TEMP_MAX)),
                    ),
                    2,
                    StoreKind::Int32,
                ));
            }
            LightKind::Dimmable => {}
        }

        if let Some(value) = self.persist(brightness, 1, StoreKind::Int8, restore) {
            self.set_slot(gid, 1, value);
        }
        for (ch, slot, kind) in extras {
            if let Some(value) = self.persist(ch, slot, kind, restore) {
                self.set_slot(gid, slot, value);
            }
        }
        let saved = self.persist(on, 0, StoreKind::Bool, restore);
        self.update_light(gid);
        self.boot_primary(gid, 0, config, saved, inputs);
    }

    fn add_garage(&mut self, gid: GroupId, config: &AccessoryConfig, restore: &Restore<'_>) {
        let current = self.add_ch(gid, 0, "CurrentDoorState", Value::Int(1), Some((0.0, 4.0)));
        self.add_ch(gid, 1, "TargetDoorState", Value::Int(1), Some((0.0, 1.0)));
        self.add_ch(gid, 2, "ObstructionDetected", Value::Bool(false), None);

        let mut door = GarageDoor::new(
            &config.garage,
            config.has_input(InputRole::Opened),
            config.has_input(InputRole::Closed),
        );
        let saved = self
            .persist(current, 0, StoreKind::Int8, restore)
            .and_then(|value| DoorState::from_code(value.as_i32()));
        let literal = match config.initial_state {
            Some(code @ 0..=1) => DoorState::from_code(i32::from(code)),
            _ => None,
        };
        if let Some(state) = saved.or(literal) {
            door.restore(state);
        }
        self.groups[gid.0].state = GroupState::Garage(door);
        self.sync_garage(gid);
    }

    fn add_cover(&mut self, gid: GroupId, config: &AccessoryConfig, restore: &Restore<'_>) {
        let current = self.add_ch(gid, 0, "CurrentPosition", Value::Int(0), Some((0.0, 100.0)));
        self.add_ch(gid, 1, "TargetPosition", Value::Int(0), Some((0.0, 100.0)));
        self.add_ch(gid, 2, "PositionState", Value::Int(2), Some((0.0, 2.0)));
        self.add_ch(gid, 3, "ObstructionDetected", Value::Bool(false), None);

        let mut cover = WindowCover::new(&config.cover);
        if let Some(value) = self.persist(current, 0, StoreKind::Int8, restore) {
            cover.restore(value.as_i32());
        }
        self.groups[gid.0].state = GroupState::Cover(cover);
        self.sync_cover(gid);
    }

    fn check_zoning(&self) -> Result<(), ConfigError> {
        for group in &self.groups {
            let GroupState::Zoning { members } = &group.state else {
                continue;
            };
            for member in members {
                let is_thermostat = self
                    .by_accessory
                    .get(member)
                    .is_some_and(|gid| self.groups[gid.0].acc_type == AccType::Thermostat);
                if !is_thermostat {
                    return Err(ConfigError::InvalidField {
                        accessory: group.accessory,
                        reason: format!("zoning member {member} is not a thermostat"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Desired boot value of a two-state characteristic, if any is configured.
fn initial_bool(
    config: &AccessoryConfig,
    saved: Option<Value>,
    inputs: &dyn InputReader,
) -> Option<bool> {
    match config.initial_state? {
        INIT_STATE_LAST => Some(saved.is_some_and(Value::as_bool)),
        INIT_STATE_INV_LAST => Some(saved.is_some_and(|value| !value.as_bool())),
        INIT_STATE_FIXED_INPUT => Some(fixed_input_level(config, inputs)),
        literal => Some(literal != 0),
    }
}

/// Level of the first on/toggle input, corrected for inversion.
fn fixed_input_level(config: &AccessoryConfig, inputs: &dyn InputReader) -> bool {
    config
        .inputs
        .iter()
        .find(|binding| matches!(binding.role, InputRole::On | InputRole::Toggle))
        .and_then(|binding| {
            inputs
                .level(binding.gpio)
                .map(|level| level != binding.inverted)
        })
        .unwrap_or(false)
}

fn sensor_name(acc_type: AccType) -> &'static str {
    match acc_type {
        AccType::ContactSensor => "ContactSensorState",
        AccType::OccupancySensor => "OccupancyDetected",
        AccType::LeakSensor => "LeakDetected",
        AccType::SmokeSensor => "SmokeDetected",
        AccType::CarbonMonoxideSensor => "CarbonMonoxideDetected",
        AccType::CarbonDioxideSensor => "CarbonDioxideDetected",
        AccType::FilterChangeSensor => "FilterChangeIndication",
        _ => "MotionDetected",
    }
}

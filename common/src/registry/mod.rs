//! Accessory runtime: every characteristic group, its timers and the write
//! path that keeps characteristics, outputs and flash consistent.
//!
//! The registry never touches hardware. Every entry point takes the caller's
//! monotonic clock and returns the [`Effect`]s to execute, in order.

mod builder;
mod dispatch;
mod poll;
mod setters;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use serde::Serialize;

use crate::{
    actions::{ActionTable, WildcardTable},
    characteristic::{Characteristic, Characteristics},
    config::{GeneralConfig, InputBinding},
    garage::GarageDoor,
    lightbulb::LightbulbEngine,
    sensor::{SensorPoll, SensorProbe},
    store::LastStates,
    thermostat::Thermostat,
    timers::{Scheduler, TimerKey, TimerRequest, TimerSlot},
    types::{AccType, ChId, Effect, GroupId, PressKind, SystemAction, Value},
    window_cover::WindowCover,
};

pub const MAX_CHANNELS: usize = 8;
pub const SAVE_STATES_DELAY_MS: u64 = 5_000;
pub const SETUP_TOGGLE_WINDOW_MS: u64 = 1_050;
pub const VALVE_PERIOD_MS: u64 = 1_000;
pub const MAX_ACTION_DEPTH: u8 = 8;

/// Type-specific state of a group. Group timers: `Primary` drives motion and
/// countdowns, `Secondary` drives sensor polling.
#[derive(Debug)]
pub enum GroupState {
    Basic,
    Valve {
        max_duration_s: Option<u32>,
    },
    Thermostat {
        machine: Thermostat,
        poll: SensorPoll,
    },
    Sensor {
        poll: SensorPoll,
    },
    Lightbulb {
        index: usize,
    },
    Garage(GarageDoor),
    Cover(WindowCover),
    Zoning {
        members: Vec<u8>,
    },
    Tv {
        inputs: u8,
    },
}

#[derive(Debug)]
pub struct ChGroup {
    pub accessory: u8,
    pub acc_type: AccType,
    pub chs: [Option<ChId>; MAX_CHANNELS],
    pub ch_sec: Option<ChId>,
    pub ch_child: Option<ChId>,
    pub state: GroupState,
    actions: ActionTable,
    wildcards: WildcardTable,
    auto_off_ms: u64,
}

/// Serializable view of one accessory for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct AccessorySnapshot {
    pub accessory: u8,
    #[serde(rename = "type")]
    pub acc_type: AccType,
    pub kind: &'static str,
    pub characteristics: Vec<Characteristic>,
}

pub struct Registry {
    general: GeneralConfig,
    groups: Vec<ChGroup>,
    chars: Characteristics,
    by_accessory: HashMap<u8, GroupId>,
    input_map: HashMap<u8, Vec<(GroupId, InputBinding)>>,
    lights: LightbulbEngine,
    pwm_gpios: Vec<u8>,
    scheduler: Scheduler,
    last_states: LastStates,
    probes: HashMap<GroupId, Box<dyn SensorProbe>>,
    setup_counter: i32,
    boot_ms: u64,
    now_ms: u64,
    depth: u8,
    effects: Vec<Effect>,
}

impl Registry {
    pub fn general(&self) -> &GeneralConfig {
        &self.general
    }

    pub fn device_name(&self) -> &str {
        &self.general.device_name
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// GPIOs allocated to PWM light channels, in channel order.
    pub fn pwm_gpios(&self) -> &[u8] {
        &self.pwm_gpios
    }

    pub fn duty_len(&self) -> usize {
        self.lights.duty().len()
    }

    pub fn find_ch(&self, accessory: u8, slot: u8) -> Option<ChId> {
        let gid = *self.by_accessory.get(&accessory)?;
        let group = self.groups.get(gid.0)?;
        match slot {
            crate::store::SLOT_SECURITY_KILL_SWITCH => group.ch_sec,
            crate::store::SLOT_CHILD_KILL_SWITCH => group.ch_child,
            _ => group.chs.get(usize::from(slot)).copied().flatten(),
        }
    }

    pub fn value(&self, ch: ChId) -> Option<Value> {
        self.chars.get(ch).map(|item| item.value)
    }

    pub fn input_bindings(&self) -> impl Iterator<Item = &InputBinding> {
        self.input_map
            .values()
            .flat_map(|bindings| bindings.iter().map(|(_, binding)| binding))
    }

    pub fn accessories(&self) -> Vec<AccessorySnapshot> {
        self.groups
            .iter()
            .map(|group| AccessorySnapshot {
                accessory: group.accessory,
                acc_type: group.acc_type,
                kind: group.acc_type.as_str(),
                characteristics: group
                    .chs
                    .iter()
                    .flatten()
                    .chain(group.ch_sec.iter())
                    .chain(group.ch_child.iter())
                    .filter_map(|ch| self.chars.get(*ch).cloned())
                    .collect(),
            })
            .collect()
    }

    /// Attaches the reading source polled for a sensor or thermostat accessory.
    pub fn attach_probe(&mut self, accessory: u8, probe: Box<dyn SensorProbe>) -> bool {
        let Some(gid) = self.by_accessory.get(&accessory).copied() else {
            return false;
        };
        let polled = matches!(
            self.groups[gid.0].state,
            GroupState::Thermostat { .. } | GroupState::Sensor { .. }
        );
        if polled {
            self.probes.insert(gid, probe);
        }
        polled
    }

    /// Write from the network side.
    pub fn set_characteristic(&mut self, ch: ChId, value: Value, now_ms: u64) -> Vec<Effect> {
        self.now_ms = now_ms;
        self.write(ch, value, true);
        self.take_effects()
    }

    pub fn set_by_slot(&mut self, accessory: u8, slot: u8, value: Value, now_ms: u64) -> Vec<Effect> {
        match self.find_ch(accessory, slot) {
            Some(ch) => self.set_characteristic(ch, value, now_ms),
            None => {
                log::warn!("accessory {accessory} has no characteristic in slot {slot}");
                Vec::new()
            }
        }
    }

    /// Decoded press on a physical input.
    pub fn button_event(&mut self, gpio: u8, press: PressKind, now_ms: u64) -> Vec<Effect> {
        self.now_ms = now_ms;
        let bindings = self.input_map.get(&gpio).cloned().unwrap_or_default();
        for (gid, binding) in bindings {
            let any_press = binding.role == crate::config::InputRole::Press;
            if binding.press != press && !any_press {
                continue;
            }
            if !self.child_allows(gid) {
                log::info!(
                    "accessory {} input on gpio {gpio} blocked by child lock",
                    self.groups[gid.0].accessory
                );
                continue;
            }
            self.handle_input(gid, binding.role, press);
        }
        self.take_effects()
    }

    /// Runs every timer and deferred task due at `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Effect> {
        self.now_ms = now_ms;
        while let Some(fired) = self.scheduler.next_due(now_ms) {
            self.on_fired(fired);
        }
        self.take_effects()
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn group(&self, gid: GroupId) -> &ChGroup {
        &self.groups[gid.0]
    }

    fn ch(&self, gid: GroupId, slot: u8) -> Option<ChId> {
        self.groups
            .get(gid.0)
            .and_then(|group| group.chs.get(usize::from(slot)).copied().flatten())
    }

    fn value_at(&self, gid: GroupId, slot: u8) -> Value {
        self.ch(gid, slot)
            .map(|ch| self.chars.value(ch))
            .unwrap_or(Value::Int(0))
    }

    /// Raw store with clamping and no side effects.
    fn set_slot(&mut self, gid: GroupId, slot: u8, value: Value) -> bool {
        let Some(ch) = self.ch(gid, slot) else {
            return false;
        };
        let Some(item) = self.chars.get(ch) else {
            return false;
        };
        let value = item.clamp(value.coerce_like(item.value));
        self.chars.set(ch, value)
    }

    fn security_allows(&self, gid: GroupId) -> bool {
        self.group(gid)
            .ch_sec
            .is_none_or(|ch| self.chars.value(ch).as_bool())
    }

    fn child_allows(&self, gid: GroupId) -> bool {
        self.group(gid)
            .ch_child
            .is_none_or(|ch| self.chars.value(ch).as_bool())
    }

    fn notify_ch(&mut self, ch: ChId) {
        let Some(item) = self.chars.get(ch) else {
            return;
        };
        let accessory = self.groups[item.group.0].accessory;
        self.effects.push(Effect::Notify {
            ch,
            accessory,
            slot: item.slot,
            value: item.value,
        });
    }

    /// Notifies ch0..ch6, stopping at the first empty slot.
    fn notify_group(&mut self, gid: GroupId) {
        let chain: Vec<ChId> = self.groups[gid.0]
            .chs
            .iter()
            .take(MAX_CHANNELS - 1)
            .map_while(|ch| *ch)
            .collect();
        for ch in chain {
            self.notify_ch(ch);
        }
    }

    /// Bookkeeping after an accepted change.
    fn commit(&mut self, gid: GroupId, toggle: bool) {
        if toggle {
            self.count_toggle();
        }
        self.arm_save();
        if self.setup_counter >= 0 {
            if let Some(led) = self.general.status_led {
                self.effects.push(Effect::LedBlink(led.gpio));
            }
        }
        self.notify_group(gid);
    }

    fn arm_save(&mut self) {
        if !self.last_states.is_empty() {
            self.scheduler
                .arm_once(TimerKey::SaveStates, self.now_ms, SAVE_STATES_DELAY_MS);
        }
    }

    fn count_toggle(&mut self) {
        if self.setup_counter < 0 {
            return;
        }
        self.setup_counter += 1;
        self.scheduler
            .arm_once(TimerKey::SetupToggle, self.now_ms, SETUP_TOGGLE_WINDOW_MS);

        let threshold = i32::from(self.general.setup_mode_toggle_count);
        if threshold > 0 && self.setup_counter == threshold && self.setup_window_open() {
            log::warn!("setup mode requested after {threshold} toggles");
            self.effects.push(Effect::System(SystemAction::SetupMode));
        }
    }

    fn setup_window_open(&self) -> bool {
        let allowed_s = self.general.allowed_setup_mode_time_s;
        allowed_s == 0 || self.now_ms.saturating_sub(self.boot_ms) <= u64::from(allowed_s) * 1_000
    }

    fn schedule_auto_off(&mut self, gid: GroupId, ch: ChId, value: Value) {
        let delay_ms = self.group(gid).auto_off_ms;
        if delay_ms > 0 {
            self.scheduler.defer(
                self.now_ms,
                delay_ms,
                crate::timers::Deferred::AutoOff { ch, value },
            );
        }
    }

    fn apply_timer(&mut self, gid: GroupId, request: TimerRequest, period_ms: u64) {
        let key = TimerKey::Group(gid, TimerSlot::Primary);
        match request {
            TimerRequest::Start => self.scheduler.arm_periodic(key, self.now_ms, period_ms),
            TimerRequest::Stop => self.scheduler.disarm(key),
            TimerRequest::Keep => {}
        }
    }
}

use crate::{
    config::InputRole,
    garage::{DoorSensor, GARAGE_POLL_PERIOD_MS, TARGET_CLOSED, TARGET_OPEN},
    lightbulb::{LightState, RGBW_PERIOD_MS},
    store::{SLOT_CHILD_KILL_SWITCH, SLOT_SECURITY_KILL_SWITCH},
    thermostat::{TargetMode, ThermostatEvent, THERMOSTAT_NUDGE},
    timers::{TimerKey, TimerSlot},
    types::{AccType, ChId, GroupId, PressKind, Value},
    window_cover::{CoverStep, Motion, WINDOW_COVER_POLL_PERIOD_MS},
};

use super::{GroupState, Registry, VALVE_PERIOD_MS};

const BRIGHTNESS_BUTTON_STEP: i32 = 10;

impl Registry {
    /// Full write path. `checked` writes honour the security kill switch.
    pub(super) fn write(&mut self, ch: ChId, value: Value, checked: bool) {
        let Some(item) = self.chars.get(ch) else {
            log::warn!("write to unknown characteristic {}", ch.0);
            return;
        };
        let gid = item.group;
        let slot = item.slot;
        let value = item.clamp(value.coerce_like(item.value));

        if slot == SLOT_SECURITY_KILL_SWITCH || slot == SLOT_CHILD_KILL_SWITCH {
            if self.chars.set(ch, value) {
                log::info!(
                    "accessory {} {} set to {}",
                    self.group(gid).accessory,
                    if slot == SLOT_SECURITY_KILL_SWITCH {
                        "security switch"
                    } else {
                        "child lock"
                    },
                    value.as_bool()
                );
                self.arm_save();
            }
            self.notify_ch(ch);
            return;
        }

        if checked && !self.security_allows(gid) {
            log::info!(
                "accessory {} write rejected by security switch",
                self.group(gid).accessory
            );
            self.notify_group(gid);
            return;
        }

        self.apply(gid, slot, value);
    }

    fn write_slot(&mut self, gid: GroupId, slot: u8, value: Value, checked: bool) {
        if let Some(ch) = self.ch(gid, slot) {
            self.write(ch, value, checked);
        }
    }

    fn toggle_slot(&mut self, gid: GroupId, slot: u8) {
        let next = !self.value_at(gid, slot).as_bool();
        self.write_slot(gid, slot, Value::Bool(next), true);
    }

    fn apply(&mut self, gid: GroupId, slot: u8, value: Value) {
        match self.group(gid).acc_type {
            AccType::Switch | AccType::Outlet | AccType::Fan if slot == 0 => {
                self.set_on_off(gid, value)
            }
            AccType::Fan if slot == 1 => self.set_fan_speed(gid, value),
            AccType::Button => self.press_button(gid, value.as_i32()),
            AccType::Lock if slot == 1 => self.set_lock(gid, 1, value, 0),
            AccType::DoubleLock if slot == 1 => self.set_lock(gid, 1, value, 0),
            AccType::DoubleLock if slot == 3 => self.set_lock(gid, 3, value, 2),
            acc_type if acc_type.is_binary_sensor() && slot == 0 => self.set_sensor(gid, value),
            AccType::WaterValve if slot == 0 => self.set_valve(gid, value),
            AccType::WaterValve if slot == 2 => {
                if self.set_slot(gid, 2, value) {
                    self.commit(gid, false);
                } else {
                    self.notify_group(gid);
                }
            }
            AccType::Thermostat => self.set_thermostat(gid, slot, value),
            AccType::Lightbulb => self.set_lightbulb(gid, slot, value),
            AccType::GarageDoor if slot == 1 => self.set_garage_target(gid, value.as_i32()),
            AccType::WindowCover if slot == 1 => self.set_cover_target(gid, value.as_i32()),
            AccType::Tv => self.set_tv(gid, slot, value),
            _ => self.notify_group(gid),
        }
    }

    fn set_on_off(&mut self, gid: GroupId, value: Value) {
        let on = value.as_bool();
        if !self.set_slot(gid, 0, value) {
            self.notify_group(gid);
            return;
        }
        if self.group(gid).acc_type == AccType::Outlet {
            self.set_slot(gid, 1, Value::Bool(on));
        }
        self.do_actions(gid, u8::from(on));
        if on {
            if let Some(ch) = self.ch(gid, 0) {
                self.schedule_auto_off(gid, ch, Value::Bool(false));
            }
        }
        self.commit(gid, true);
    }

    fn set_fan_speed(&mut self, gid: GroupId, value: Value) {
        if !self.set_slot(gid, 1, value) {
            self.notify_group(gid);
            return;
        }
        self.run_wildcard(gid, 0, value.as_f32());
        self.commit(gid, false);
    }

    pub(super) fn press_button(&mut self, gid: GroupId, code: i32) {
        let Some(press) = PressKind::from_code(code) else {
            log::warn!(
                "accessory {} ignores press code {code}",
                self.group(gid).accessory
            );
            return;
        };
        if let Some(ch) = self.ch(gid, 0) {
            self.chars.set(ch, Value::Int(i32::from(press.code())));
            self.do_actions(gid, press.code());
            self.notify_ch(ch);
        }
    }

    fn set_lock(&mut self, gid: GroupId, target_slot: u8, value: Value, event_base: u8) {
        if !self.set_slot(gid, target_slot, value) {
            self.notify_group(gid);
            return;
        }
        let target = self.value_at(gid, target_slot);
        self.set_slot(gid, target_slot - 1, target);
        let secured = target.as_i32() == 1;
        self.do_actions(gid, event_base + u8::from(secured));
        if !secured {
            if let Some(ch) = self.ch(gid, target_slot) {
                self.schedule_auto_off(gid, ch, Value::Int(1));
            }
        }
        self.commit(gid, true);
    }

    fn set_sensor(&mut self, gid: GroupId, value: Value) {
        let active = value.as_bool();
        if !self.set_slot(gid, 0, value) {
            self.notify_group(gid);
            return;
        }
        self.do_actions(gid, u8::from(active));
        if active {
            if let Some(ch) = self.ch(gid, 0) {
                let idle = Value::Bool(false).coerce_like(self.chars.value(ch));
                self.schedule_auto_off(gid, ch, idle);
            }
        }
        self.commit(gid, false);
    }

    fn set_valve(&mut self, gid: GroupId, value: Value) {
        let open = value.as_bool();
        if !self.set_slot(gid, 0, value) {
            self.notify_group(gid);
            return;
        }
        self.set_slot(gid, 1, Value::Int(i32::from(open)));

        let countdown = TimerKey::Group(gid, TimerSlot::Primary);
        let has_duration = matches!(
            self.group(gid).state,
            GroupState::Valve {
                max_duration_s: Some(_)
            }
        );
        if has_duration {
            if open {
                let duration = self.value_at(gid, 2).as_i32();
                self.set_slot(gid, 3, Value::Int(duration));
                if duration > 0 {
                    self.scheduler
                        .arm_periodic(countdown, self.now_ms, VALVE_PERIOD_MS);
                }
            } else {
                self.set_slot(gid, 3, Value::Int(0));
                self.scheduler.disarm(countdown);
            }
        }

        self.do_actions(gid, u8::from(open));
        if open {
            if let Some(ch) = self.ch(gid, 0) {
                self.schedule_auto_off(gid, ch, Value::Int(0));
            }
        }
        self.commit(gid, true);
    }

    fn set_thermostat(&mut self, gid: GroupId, slot: u8, value: Value) {
        let GroupState::Thermostat { machine, .. } = &mut self.groups[gid.0].state else {
            return;
        };
        let (changed, toggle) = match slot {
            1 => (machine.set_active(value.as_bool()), true),
            3 => match TargetMode::from_code(value.as_i32()) {
                Some(mode) => (machine.set_target_mode(mode), true),
                None => (false, false),
            },
            4 => (machine.set_heating_threshold(value.as_f32()), false),
            5 => (machine.set_cooling_threshold(value.as_f32()), false),
            _ => (false, false),
        };
        if !changed {
            self.notify_group(gid);
            return;
        }
        self.sync_thermostat(gid);
        self.evaluate_thermostat(gid);
        self.commit(gid, toggle);
    }

    /// Mirrors the machine's settings into its characteristics.
    pub(super) fn sync_thermostat(&mut self, gid: GroupId) {
        let GroupState::Thermostat { machine, .. } = &self.groups[gid.0].state else {
            return;
        };
        let active = i32::from(machine.is_active());
        let state = machine.state().code();
        let mode = machine.target_mode().code();
        let heat = machine.heating_threshold();
        let cool = machine.cooling_threshold();
        self.set_slot(gid, 1, Value::Int(active));
        self.set_slot(gid, 2, Value::Int(state));
        self.set_slot(gid, 3, Value::Int(mode));
        self.set_slot(gid, 4, Value::Float(heat));
        self.set_slot(gid, 5, Value::Float(cool));
    }

    pub(super) fn evaluate_thermostat(&mut self, gid: GroupId) {
        let GroupState::Thermostat { machine, .. } = &mut self.groups[gid.0].state else {
            return;
        };
        if let Some(event) = machine.evaluate() {
            self.thermostat_event(gid, event);
        }
    }

    pub(super) fn thermostat_event(&mut self, gid: GroupId, event: ThermostatEvent) {
        let state = match &self.groups[gid.0].state {
            GroupState::Thermostat { machine, .. } => machine.state().code(),
            _ => return,
        };
        log::info!(
            "thermostat {} event {:?}",
            self.group(gid).accessory,
            event
        );
        self.set_slot(gid, 2, Value::Int(state));
        self.do_actions(gid, event.code());
        self.refresh_zoning();
    }

    fn nudge_thermostat(&mut self, gid: GroupId, delta: f32) {
        let GroupState::Thermostat { machine, .. } = &mut self.groups[gid.0].state else {
            return;
        };
        let (heat, cool) = machine.nudge(delta);
        if !(heat || cool) {
            self.notify_group(gid);
            return;
        }
        self.sync_thermostat(gid);
        self.evaluate_thermostat(gid);
        self.commit(gid, false);
    }

    fn set_lightbulb(&mut self, gid: GroupId, slot: u8, value: Value) {
        if !self.set_slot(gid, slot, value) {
            self.notify_group(gid);
            return;
        }
        match slot {
            0 => {
                let on = value.as_bool();
                if on && self.value_at(gid, 1).as_i32() == 0 {
                    self.set_slot(gid, 1, Value::Int(100));
                }
                if !on {
                    self.stop_autodimmer(gid);
                }
                self.do_actions(gid, u8::from(on));
                if on {
                    if let Some(ch) = self.ch(gid, 0) {
                        self.schedule_auto_off(gid, ch, Value::Bool(false));
                    }
                }
                self.update_light(gid);
                self.commit(gid, true);
            }
            1 => {
                self.run_wildcard(gid, 0, value.as_f32());
                self.update_light(gid);
                self.commit(gid, false);
            }
            _ => {
                self.update_light(gid);
                self.commit(gid, false);
            }
        }
    }

    /// Recomputes duty targets and makes sure the slew timer runs.
    pub(super) fn update_light(&mut self, gid: GroupId) {
        let GroupState::Lightbulb { index } = self.group(gid).state else {
            return;
        };
        let color_temp = self
            .lights
            .group(index)
            .is_some_and(|light| light.kind == crate::lightbulb::LightKind::ColorTemperature);
        let state = LightState {
            on: self.value_at(gid, 0).as_bool(),
            brightness: self.value_at(gid, 1).as_f32(),
            hue: if color_temp {
                0.0
            } else {
                self.value_at(gid, 2).as_f32()
            },
            saturation: if color_temp {
                0.0
            } else {
                self.value_at(gid, 3).as_f32()
            },
            color_temp: if color_temp {
                self.value_at(gid, 2).as_f32()
            } else {
                0.0
            },
        };
        self.lights.set_state(index, &state);
        if !self.scheduler.is_armed(TimerKey::PwmSlew) {
            self.scheduler
                .arm_periodic(TimerKey::PwmSlew, self.now_ms, RGBW_PERIOD_MS);
        }
    }

    fn step_brightness(&mut self, gid: GroupId, up: bool) {
        let GroupState::Lightbulb { index } = self.group(gid).state else {
            return;
        };
        let step = self
            .lights
            .group(index)
            .map(|light| i32::from(light.autodimmer.step))
            .filter(|step| *step > 0)
            .unwrap_or(BRIGHTNESS_BUTTON_STEP);
        let current = self.value_at(gid, 1).as_i32();
        let next = if up { current + step } else { current - step }.clamp(1, 100);
        self.write_slot(gid, 1, Value::Int(next), true);
    }

    fn set_garage_target(&mut self, gid: GroupId, target: i32) {
        let GroupState::Garage(door) = &mut self.groups[gid.0].state else {
            return;
        };
        let target = if target == TARGET_OPEN {
            TARGET_OPEN
        } else {
            TARGET_CLOSED
        };
        if target == door.target() && door.state() != crate::garage::DoorState::Stopped {
            self.notify_group(gid);
            return;
        }
        let step = door.request(target);
        self.sync_garage(gid);
        self.apply_timer(gid, step.timer, GARAGE_POLL_PERIOD_MS);
        if let Some(event) = step.event {
            self.do_actions(gid, event.code());
        }
        if target == TARGET_OPEN {
            if let Some(ch) = self.ch(gid, 1) {
                self.schedule_auto_off(gid, ch, Value::Int(TARGET_CLOSED));
            }
        }
        self.commit(gid, true);
    }

    pub(super) fn sync_garage(&mut self, gid: GroupId) {
        let GroupState::Garage(door) = &self.groups[gid.0].state else {
            return;
        };
        let (state, target, obstruction) = (door.state().code(), door.target(), door.obstruction());
        self.set_slot(gid, 0, Value::Int(state));
        self.set_slot(gid, 1, Value::Int(target));
        self.set_slot(gid, 2, Value::Bool(obstruction));
    }

    pub(super) fn stop_garage(&mut self, gid: GroupId) {
        let GroupState::Garage(door) = &mut self.groups[gid.0].state else {
            return;
        };
        let step = door.stop();
        let Some(event) = step.event else {
            self.notify_group(gid);
            return;
        };
        self.sync_garage(gid);
        self.apply_timer(gid, step.timer, GARAGE_POLL_PERIOD_MS);
        self.do_actions(gid, event.code());
        self.commit(gid, false);
    }

    pub(super) fn garage_obstruction(&mut self, gid: GroupId, obstruction: bool) {
        let GroupState::Garage(door) = &mut self.groups[gid.0].state else {
            return;
        };
        let Some(event) = door.set_obstruction(obstruction) else {
            return;
        };
        self.sync_garage(gid);
        self.do_actions(gid, event.code());
        self.commit(gid, false);
    }

    fn garage_sensor(&mut self, gid: GroupId, report: DoorSensor) {
        let GroupState::Garage(door) = &mut self.groups[gid.0].state else {
            return;
        };
        let timer = door.sensor(report);
        self.apply_timer(gid, timer, GARAGE_POLL_PERIOD_MS);
        self.sync_garage(gid);
        self.commit(gid, false);
    }

    fn set_cover_target(&mut self, gid: GroupId, target: i32) {
        let GroupState::Cover(cover) = &mut self.groups[gid.0].state else {
            return;
        };
        if target == cover.target() {
            self.notify_group(gid);
            return;
        }
        let step = cover.request(target);
        self.finish_cover_step(gid, step);
        self.commit(gid, true);
    }

    pub(super) fn stop_cover(&mut self, gid: GroupId) {
        let GroupState::Cover(cover) = &mut self.groups[gid.0].state else {
            return;
        };
        let step = cover.stop();
        if step.event.is_none() {
            self.notify_group(gid);
            return;
        }
        self.finish_cover_step(gid, step);
        self.commit(gid, false);
    }

    pub(super) fn cover_obstruction(&mut self, gid: GroupId, obstruction: bool) {
        let GroupState::Cover(cover) = &mut self.groups[gid.0].state else {
            return;
        };
        let step = cover.set_obstruction(obstruction);
        if step.event.is_none() {
            return;
        }
        self.finish_cover_step(gid, step);
        self.commit(gid, false);
    }

    /// Mirrors the cover into its characteristics, applies the timer request
    /// and runs the step's actions.
    pub(super) fn finish_cover_step(&mut self, gid: GroupId, step: CoverStep) {
        self.sync_cover(gid);
        self.apply_timer(gid, step.timer, WINDOW_COVER_POLL_PERIOD_MS);
        if let Some(event) = step.event {
            self.do_actions(gid, event.code());
        }
    }

    pub(super) fn sync_cover(&mut self, gid: GroupId) {
        let GroupState::Cover(cover) = &self.groups[gid.0].state else {
            return;
        };
        let (current, target, motion, obstruction) = (
            cover.current(),
            cover.target(),
            cover.motion().code(),
            cover.obstruction(),
        );
        self.set_slot(gid, 0, Value::Int(current));
        self.set_slot(gid, 1, Value::Int(target));
        self.set_slot(gid, 2, Value::Int(motion));
        self.set_slot(gid, 3, Value::Bool(obstruction));
    }

    fn toggle_cover(&mut self, gid: GroupId) {
        let GroupState::Cover(cover) = &self.groups[gid.0].state else {
            return;
        };
        if cover.motion() != Motion::Stopped {
            self.stop_cover(gid);
            return;
        }
        let target = if cover.current() > 0 { 0 } else { 100 };
        self.write_slot(gid, 1, Value::Int(target), true);
    }

    fn set_tv(&mut self, gid: GroupId, slot: u8, value: Value) {
        match slot {
            0 => {
                let on = value.as_bool();
                if !self.set_slot(gid, 0, value) {
                    self.notify_group(gid);
                    return;
                }
                self.do_actions(gid, u8::from(on));
                self.commit(gid, true);
            }
            1 | 2 => {
                if !self.set_slot(gid, slot, value) {
                    self.notify_group(gid);
                    return;
                }
                let event = if slot == 1 {
                    30u8.saturating_add(u8::try_from(value.as_i32()).unwrap_or(u8::MAX))
                } else {
                    2 + u8::from(value.as_bool())
                };
                self.do_actions(gid, event);
                self.commit(gid, false);
            }
            3 | 4 => {
                self.set_slot(gid, slot, value);
                let code = u8::try_from(value.as_i32()).unwrap_or_default();
                let event = if slot == 3 {
                    code.saturating_add(10)
                } else {
                    code.saturating_add(4)
                };
                self.do_actions(gid, event);
                self.notify_group(gid);
            }
            _ => self.notify_group(gid),
        }
    }

    /// Applies a bound input to its group. The child lock is checked by the caller.
    pub(super) fn handle_input(&mut self, gid: GroupId, role: InputRole, press: PressKind) {
        let acc_type = self.group(gid).acc_type;
        match (acc_type, role) {
            (AccType::Button, _) => self.press_button(gid, i32::from(press.code())),
            (AccType::Lightbulb, InputRole::Autodimmer) => self.autodimmer_press(gid),
            (AccType::Lightbulb, InputRole::BrightnessUp) => self.step_brightness(gid, true),
            (AccType::Lightbulb, InputRole::BrightnessDown) => self.step_brightness(gid, false),
            (AccType::Thermostat, InputRole::TempUp) => self.nudge_thermostat(gid, THERMOSTAT_NUDGE),
            (AccType::Thermostat, InputRole::TempDown) => {
                self.nudge_thermostat(gid, -THERMOSTAT_NUDGE)
            }
            (AccType::GarageDoor, InputRole::Open) => {
                self.write_slot(gid, 1, Value::Int(TARGET_OPEN), true)
            }
            (AccType::GarageDoor, InputRole::Close) => {
                self.write_slot(gid, 1, Value::Int(TARGET_CLOSED), true)
            }
            (AccType::GarageDoor, InputRole::Toggle) => {
                let next = 1 - self.value_at(gid, 1).as_i32().clamp(0, 1);
                self.write_slot(gid, 1, Value::Int(next), true);
            }
            (AccType::GarageDoor, InputRole::Stop) => self.stop_garage(gid),
            (AccType::GarageDoor, InputRole::Opened) => self.garage_sensor(gid, DoorSensor::Opened),
            (AccType::GarageDoor, InputRole::Closed) => self.garage_sensor(gid, DoorSensor::Closed),
            (AccType::GarageDoor, InputRole::Opening) => {
                self.garage_sensor(gid, DoorSensor::Opening)
            }
            (AccType::GarageDoor, InputRole::Closing) => {
                self.garage_sensor(gid, DoorSensor::Closing)
            }
            (AccType::GarageDoor, InputRole::Obstruction) => self.garage_obstruction(gid, true),
            (AccType::GarageDoor, InputRole::ObstructionCleared) => {
                self.garage_obstruction(gid, false)
            }
            (AccType::WindowCover, InputRole::Open) => {
                self.write_slot(gid, 1, Value::Int(100), true)
            }
            (AccType::WindowCover, InputRole::Close) => {
                self.write_slot(gid, 1, Value::Int(0), true)
            }
            (AccType::WindowCover, InputRole::Stop) => self.stop_cover(gid),
            (AccType::WindowCover, InputRole::Toggle) => self.toggle_cover(gid),
            (AccType::WindowCover, InputRole::Obstruction) => self.cover_obstruction(gid, true),
            (AccType::WindowCover, InputRole::ObstructionCleared) => {
                self.cover_obstruction(gid, false)
            }
            (AccType::DoubleLock, InputRole::SecondToggle) => self.toggle_slot(gid, 3),
            (_, InputRole::Toggle) => {
                if let Some(slot) = primary_slot(acc_type) {
                    self.toggle_slot(gid, slot);
                }
            }
            (_, InputRole::On | InputRole::Off) => {
                if let Some(slot) = primary_slot(acc_type) {
                    let on = role == InputRole::On;
                    self.write_slot(gid, slot, Value::Bool(on), true);
                }
            }
            _ => log::debug!(
                "input role {role:?} has no meaning for {}",
                acc_type.as_str()
            ),
        }
    }
}

/// Slot that On/Off/Toggle inputs drive.
pub(super) fn primary_slot(acc_type: AccType) -> Option<u8> {
    match acc_type {
        AccType::Lock | AccType::DoubleLock | AccType::Thermostat => Some(1),
        AccType::Switch
        | AccType::Outlet
        | AccType::Fan
        | AccType::WaterValve
        | AccType::Lightbulb
        | AccType::Tv => Some(0),
        other if other.is_binary_sensor() => Some(0),
        _ => None,
    }
}

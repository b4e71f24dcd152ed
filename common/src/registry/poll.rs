use crate::{
    garage::{GarageEvent, GARAGE_POLL_PERIOD_MS},
    lightbulb::{SlewOutcome, AUTODIMMER_WINDOW_MS},
    sensor::SensorReading,
    timers::{Deferred, Fired, TimerKey, TimerSlot},
    types::{AccType, Effect, GroupId, Value},
    window_cover::{CoverEvent, WINDOW_COVER_POLL_PERIOD_MS},
};

use super::{GroupState, Registry};

impl Registry {
    pub(super) fn on_fired(&mut self, fired: Fired) {
        match fired {
            Fired::Timer(TimerKey::Group(gid, TimerSlot::Primary)) => self.primary_timer(gid),
            Fired::Timer(TimerKey::Group(gid, TimerSlot::Secondary)) => self.poll_sensor(gid),
            Fired::Timer(TimerKey::PwmSlew) => self.slew(),
            Fired::Timer(TimerKey::AutodimmerWindow(gid)) => {
                if let Some(light) = self.light_mut(gid) {
                    light.autodimmer.start();
                }
                self.autodimmer_step(gid);
            }
            Fired::Timer(TimerKey::Autodimmer(gid)) => self.autodimmer_step(gid),
            Fired::Timer(TimerKey::SaveStates) => self.save_states(),
            Fired::Timer(TimerKey::SetupToggle) => {
                if self.setup_counter > 0 {
                    log::debug!("setup toggle counter reset at {}", self.setup_counter);
                }
                self.setup_counter = 0;
            }
            Fired::Deferred(Deferred::GpioRevert { gpio, level }) => {
                self.effects.push(Effect::GpioWrite { gpio, level });
            }
            Fired::Deferred(Deferred::AutoOff { ch, value }) => self.write(ch, value, false),
        }
    }

    fn primary_timer(&mut self, gid: GroupId) {
        match self.groups[gid.0].acc_type {
            AccType::GarageDoor => self.garage_tick(gid),
            AccType::WindowCover => self.cover_tick(gid),
            AccType::WaterValve => self.valve_tick(gid),
            _ => self
                .scheduler
                .disarm(TimerKey::Group(gid, TimerSlot::Primary)),
        }
    }

    fn garage_tick(&mut self, gid: GroupId) {
        let GroupState::Garage(door) = &mut self.groups[gid.0].state else {
            return;
        };
        let step = door.tick();
        self.apply_timer(gid, step.timer, GARAGE_POLL_PERIOD_MS);
        let Some(event) = step.event else {
            return;
        };
        if event == GarageEvent::Obstruction {
            log::warn!(
                "garage {} overran its end sensor",
                self.groups[gid.0].accessory
            );
        }
        self.sync_garage(gid);
        self.do_actions(gid, event.code());
        self.commit(gid, false);
    }

    fn cover_tick(&mut self, gid: GroupId) {
        let GroupState::Cover(cover) = &mut self.groups[gid.0].state else {
            return;
        };
        let before = cover.current();
        let step = cover.tick();
        let moved = cover.current() != before;

        match step.event {
            Some(event) => {
                self.finish_cover_step(gid, step);
                if event == CoverEvent::Reached {
                    self.commit(gid, false);
                }
            }
            None => {
                self.apply_timer(gid, step.timer, WINDOW_COVER_POLL_PERIOD_MS);
                if moved {
                    self.sync_cover(gid);
                    if let Some(ch) = self.ch(gid, 0) {
                        self.notify_ch(ch);
                    }
                }
            }
        }
    }

    fn valve_tick(&mut self, gid: GroupId) {
        let remaining = self.value_at(gid, 3).as_i32() - 1;
        self.set_slot(gid, 3, Value::Int(remaining.max(0)));
        if let Some(ch) = self.ch(gid, 3) {
            self.notify_ch(ch);
        }
        if remaining <= 0 {
            self.scheduler
                .disarm(TimerKey::Group(gid, TimerSlot::Primary));
            log::info!(
                "valve {} duration elapsed",
                self.groups[gid.0].accessory
            );
            if let Some(ch) = self.ch(gid, 0) {
                self.write(ch, Value::Int(0), false);
            }
        }
    }

    fn poll_sensor(&mut self, gid: GroupId) {
        let reading = self.probes.get_mut(&gid).and_then(|probe| probe.read());
        let accessory = self.groups[gid.0].accessory;

        let reading = match &mut self.groups[gid.0].state {
            GroupState::Thermostat { poll, .. } | GroupState::Sensor { poll } => match reading {
                Some(reading) => {
                    poll.record_success();
                    Some(poll.adjust(reading))
                }
                None => {
                    let reached = poll.record_failure();
                    log::debug!("accessory {accessory} sensor read failed ({})", poll.errors());
                    if !reached {
                        return;
                    }
                    None
                }
            },
            _ => return,
        };

        match reading {
            Some(reading) => self.apply_reading(gid, reading),
            None => self.sensor_lost(gid),
        }
    }

    fn sensor_lost(&mut self, gid: GroupId) {
        let accessory = self.groups[gid.0].accessory;
        log::warn!("accessory {accessory} sensor failed repeatedly");
        let GroupState::Thermostat { machine, .. } = &mut self.groups[gid.0].state else {
            return;
        };
        if let Some(event) = machine.sensor_lost() {
            self.thermostat_event(gid, event);
        }
        self.notify_group(gid);
    }

    fn apply_reading(&mut self, gid: GroupId, reading: SensorReading) {
        let acc_type = self.groups[gid.0].acc_type;
        match (acc_type, reading) {
            (
                AccType::Thermostat,
                SensorReading::Climate {
                    temperature,
                    humidity,
                },
            ) => {
                if let GroupState::Thermostat { machine, .. } = &mut self.groups[gid.0].state {
                    machine.update_reading(temperature, humidity);
                }
                self.set_slot(gid, 0, Value::Float(round_tenth(temperature)));
                if let Some(humidity) = humidity {
                    self.set_slot(gid, 6, Value::Float(humidity.round()));
                    self.run_wildcard(gid, 1, humidity);
                }
                self.run_wildcard(gid, 0, temperature);
                self.evaluate_thermostat(gid);
            }
            (
                AccType::TemperatureSensor | AccType::HumiditySensor | AccType::TempHumSensor,
                SensorReading::Climate {
                    temperature,
                    humidity,
                },
            ) => {
                if acc_type != AccType::HumiditySensor {
                    self.set_slot(gid, 0, Value::Float(round_tenth(temperature)));
                    self.run_wildcard(gid, 0, temperature);
                }
                if let Some(humidity) = humidity {
                    let slot = if acc_type == AccType::HumiditySensor { 0 } else { 1 };
                    self.set_slot(gid, slot, Value::Float(humidity.round()));
                    self.run_wildcard(gid, 1, humidity);
                }
            }
            (
                AccType::PowerMonitor,
                SensorReading::Power {
                    voltage,
                    current,
                    power,
                },
            ) => {
                for (slot, reading) in [voltage, current, power].into_iter().enumerate() {
                    let slot = slot as u8;
                    self.set_slot(gid, slot, Value::Float(reading));
                    self.run_wildcard(gid, slot, reading);
                }
            }
            (acc_type, reading) => {
                log::warn!(
                    "{} cannot use reading {reading:?}",
                    acc_type.as_str()
                );
                return;
            }
        }
        self.notify_group(gid);
    }

    fn slew(&mut self) {
        match self.lights.slew_tick() {
            SlewOutcome::Frame { frame, converging } => {
                self.effects.push(Effect::PwmWrite(frame));
                if converging == 0 {
                    self.scheduler.disarm(TimerKey::PwmSlew);
                }
            }
            SlewOutcome::Missed => {}
        }
    }

    fn save_states(&mut self) {
        let chars = &self.chars;
        let dirty = self.last_states.collect_dirty(|ch| chars.value(ch));
        if dirty.is_empty() {
            return;
        }
        log::debug!("saving {} states", dirty.len());
        self.effects.push(Effect::SaveStates(dirty));
    }

    fn light_mut(&mut self, gid: GroupId) -> Option<&mut crate::lightbulb::LightbulbGroup> {
        let GroupState::Lightbulb { index } = self.groups[gid.0].state else {
            return None;
        };
        self.lights.group_mut(index)
    }

    /// Long press on a lightbulb input.
    pub(super) fn autodimmer_press(&mut self, gid: GroupId) {
        let on = self.value_at(gid, 0).as_bool();
        let enabled = self
            .light_mut(gid)
            .is_some_and(|light| light.autodimmer.enabled());
        if !on || !enabled {
            if let Some(ch) = self.ch(gid, 0) {
                self.write(ch, Value::Bool(!on), true);
            }
            return;
        }

        let window = TimerKey::AutodimmerWindow(gid);
        if self.scheduler.is_armed(window) {
            self.scheduler.disarm(window);
            self.stop_autodimmer(gid);
        } else {
            self.scheduler
                .arm_once(window, self.now_ms, AUTODIMMER_WINDOW_MS);
        }
    }

    pub(super) fn stop_autodimmer(&mut self, gid: GroupId) {
        if let Some(light) = self.light_mut(gid) {
            light.autodimmer.stop();
        }
        self.scheduler.disarm(TimerKey::Autodimmer(gid));
    }

    fn autodimmer_step(&mut self, gid: GroupId) {
        if !self.value_at(gid, 0).as_bool() {
            self.stop_autodimmer(gid);
            return;
        }
        let current = self.value_at(gid, 1).as_i32();
        let Some(light) = self.light_mut(gid) else {
            return;
        };
        if light.autodimmer.remaining == 0 {
            return;
        }
        light.autodimmer.remaining -= 1;
        let next = light.autodimmer.next_brightness(current);
        let delay_ms = light.autodimmer.delay_after(next);

        if let Some(ch) = self.ch(gid, 1) {
            self.write(ch, Value::Int(next), true);
        }
        self.scheduler
            .arm_once(TimerKey::Autodimmer(gid), self.now_ms, delay_ms);
    }
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

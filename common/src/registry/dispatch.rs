use crate::{
    actions::{ActionList, KillSwitchCommand, ManagerCommand, ThermostatCommand},
    garage::{TARGET_CLOSED, TARGET_OPEN},
    timers::Deferred,
    types::{AccType, Effect, GroupId, SystemAction, Value},
};

use super::{GroupState, Registry, MAX_ACTION_DEPTH};

const COVER_STOP: i32 = 101;
const COVER_OBSTRUCTION_ON: i32 = -1;
const COVER_OBSTRUCTION_OFF: i32 = -2;

impl Registry {
    /// Runs the action list bound to `event`, following one `copy` redirect.
    pub(super) fn do_actions(&mut self, gid: GroupId, event: u8) {
        let Some(list) = self.groups[gid.0].actions.resolve(event).cloned() else {
            return;
        };
        log::debug!(
            "accessory {} event {event}",
            self.groups[gid.0].accessory
        );
        self.run_list(gid, &list);
    }

    /// Feeds a reading to wildcard index `index` and runs the selected list.
    pub(super) fn run_wildcard(&mut self, gid: GroupId, index: u8, reading: f32) {
        let Some(list) = self.groups[gid.0].wildcards.select(index, reading).cloned() else {
            return;
        };
        log::debug!(
            "accessory {} wildcard {index} fired at {reading}",
            self.groups[gid.0].accessory
        );
        self.run_list(gid, &list);
    }

    fn run_list(&mut self, gid: GroupId, list: &ActionList) {
        if self.depth >= MAX_ACTION_DEPTH {
            log::warn!(
                "accessory {} actions skipped, manager chain too deep",
                self.groups[gid.0].accessory
            );
            return;
        }
        self.depth += 1;

        for output in &list.outputs {
            self.effects.push(Effect::GpioWrite {
                gpio: output.gpio,
                level: output.value,
            });
            if output.revert_after_s > 0.0 {
                let delay_ms = (output.revert_after_s * 1_000.0).round() as u64;
                self.scheduler.defer(
                    self.now_ms,
                    delay_ms,
                    Deferred::GpioRevert {
                        gpio: output.gpio,
                        level: !output.value,
                    },
                );
            }
        }

        for command in &list.manage {
            self.run_manager(*command);
        }

        for action in &list.system {
            match action {
                SystemAction::Ota if self.general.ota_repo.is_none() => {
                    log::warn!("ota requested but no repository is configured");
                }
                action => {
                    log::info!("system action {action:?}");
                    self.effects.push(Effect::System(*action));
                }
            }
        }

        self.depth -= 1;
    }

    fn run_manager(&mut self, command: ManagerCommand) {
        let Some(target) = self.by_accessory.get(&command.accessory).copied() else {
            log::warn!(
                "manager target accessory {} not found",
                command.accessory
            );
            return;
        };

        if let Some(code) = command.kill_switch {
            self.run_kill_switch(target, code);
            return;
        }

        let value = command.value;
        let code = value.round() as i32;
        let acc_type = self.groups[target.0].acc_type;
        match acc_type {
            AccType::Switch | AccType::Outlet | AccType::Fan | AccType::Lightbulb => {
                self.manage_on_off(target, code)
            }
            AccType::Button => self.press_button(target, code),
            AccType::Lock => self.manage_slot(target, 1, Value::Int(code)),
            AccType::DoubleLock => match code {
                0 | 1 => self.manage_slot(target, 1, Value::Int(code)),
                2 | 3 => self.manage_slot(target, 3, Value::Int(code - 2)),
                _ => log::warn!("double lock command {code} out of range"),
            },
            acc_type if acc_type.is_binary_sensor() => {
                self.manage_slot(target, 0, Value::Int(code))
            }
            AccType::WaterValve => self.manage_slot(target, 0, Value::Int(code)),
            AccType::Thermostat => self.manage_thermostat(target, value),
            AccType::GarageDoor => match code {
                0 => self.manage_slot(target, 1, Value::Int(TARGET_OPEN)),
                1 => self.manage_slot(target, 1, Value::Int(TARGET_CLOSED)),
                2 => self.stop_garage(target),
                3 => self.garage_obstruction(target, true),
                4 => self.garage_obstruction(target, false),
                _ => log::warn!("garage command {code} out of range"),
            },
            AccType::WindowCover => match code {
                0..=100 => self.manage_slot(target, 1, Value::Int(code)),
                COVER_STOP => self.stop_cover(target),
                COVER_OBSTRUCTION_ON => self.cover_obstruction(target, true),
                COVER_OBSTRUCTION_OFF => self.cover_obstruction(target, false),
                _ => log::warn!("window cover command {code} out of range"),
            },
            AccType::Tv => self.manage_slot(target, 0, Value::Int(code)),
            other => log::warn!("{} does not accept manager commands", other.as_str()),
        }
    }

    fn manage_slot(&mut self, gid: GroupId, slot: u8, value: Value) {
        if let Some(ch) = self.ch(gid, slot) {
            self.write(ch, value, true);
        }
    }

    fn manage_on_off(&mut self, gid: GroupId, code: i32) {
        let value = match code {
            0 | 1 => code == 1,
            2 => !self.value_at(gid, 0).as_bool(),
            _ => {
                log::warn!("on/off command {code} out of range");
                return;
            }
        };
        self.manage_slot(gid, 0, Value::Bool(value));
    }

    fn manage_thermostat(&mut self, gid: GroupId, value: f32) {
        match ThermostatCommand::decode(value) {
            ThermostatCommand::Power(on) => self.manage_slot(gid, 1, Value::Bool(on)),
            ThermostatCommand::TargetMode(mode) => {
                self.manage_slot(gid, 3, Value::Int(i32::from(mode)))
            }
            ThermostatCommand::HeatingThreshold(temp) => {
                self.manage_slot(gid, 4, Value::Float(temp))
            }
            ThermostatCommand::CoolingThreshold(temp) => {
                self.manage_slot(gid, 5, Value::Float(temp))
            }
        }
    }

    fn run_kill_switch(&mut self, gid: GroupId, code: u8) {
        let Some(command) = KillSwitchCommand::from_code(code) else {
            log::warn!("kill switch command {code} out of range");
            return;
        };
        let group = &self.groups[gid.0];
        let (ch, on) = match command {
            KillSwitchCommand::SecurityOff => (group.ch_sec, false),
            KillSwitchCommand::SecurityOn => (group.ch_sec, true),
            KillSwitchCommand::ChildOff => (group.ch_child, false),
            KillSwitchCommand::ChildOn => (group.ch_child, true),
        };
        match ch {
            Some(ch) => self.write(ch, Value::Bool(on), false),
            None => log::warn!(
                "accessory {} has no kill switch for {command:?}",
                group.accessory
            ),
        }
    }

    /// Recomputes every iAirZoning aggregate from its member thermostats.
    pub(super) fn refresh_zoning(&mut self) {
        let zones: Vec<(GroupId, Vec<u8>)> = self
            .groups
            .iter()
            .enumerate()
            .filter_map(|(index, group)| match &group.state {
                GroupState::Zoning { members } => Some((GroupId(index), members.clone())),
                _ => None,
            })
            .collect();

        for (zone, members) in zones {
            let states: Vec<i32> = members
                .iter()
                .filter_map(|accessory| self.by_accessory.get(accessory))
                .filter_map(|gid| match &self.groups[gid.0].state {
                    GroupState::Thermostat { machine, .. } => Some(machine.state().code()),
                    _ => None,
                })
                .collect();
            let aggregate = [2, 3, 1]
                .into_iter()
                .find(|state| states.contains(state))
                .unwrap_or(0);

            if self.set_slot(zone, 0, Value::Int(aggregate)) {
                self.do_actions(zone, aggregate as u8);
                self.notify_group(zone);
            }
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::SystemAction;

pub const WILDCARD_INDEXES: usize = 4;

/// Actions bound to one logical event of an accessory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionList {
    pub copy: Option<u8>,
    pub outputs: Vec<DigitalOutput>,
    pub manage: Vec<ManagerCommand>,
    pub system: Vec<SystemAction>,
}

impl ActionList {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.manage.is_empty() && self.system.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DigitalOutput {
    pub gpio: u8,
    #[serde(default)]
    pub value: bool,
    #[serde(default)]
    pub revert_after_s: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManagerCommand {
    pub accessory: u8,
    #[serde(default)]
    pub value: f32,
    #[serde(default)]
    pub kill_switch: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchCommand {
    SecurityOff,
    SecurityOn,
    ChildOff,
    ChildOn,
}

impl KillSwitchCommand {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::SecurityOff),
            1 => Some(Self::SecurityOn),
            2 => Some(Self::ChildOff),
            3 => Some(Self::ChildOn),
            _ => None,
        }
    }
}

/// Thermostat sub-command packed into a single manager value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThermostatCommand {
    Power(bool),
    TargetMode(u8),
    HeatingThreshold(f32),
    CoolingThreshold(f32),
}

impl ThermostatCommand {
    pub fn decode(value: f32) -> Self {
        let hundredths = (value * 100.0).round() as i32;
        match hundredths {
            2 => Self::Power(false),
            3 => Self::Power(true),
            4..=6 => Self::TargetMode((hundredths - 4) as u8),
            even if even.rem_euclid(2) == 0 => Self::HeatingThreshold(value),
            _ => Self::CoolingThreshold(value - 0.01),
        }
    }
}

/// Per-accessory event table with one level of `copy` redirection.
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    lists: BTreeMap<u8, ActionList>,
}

impl ActionTable {
    pub fn new(lists: BTreeMap<u8, ActionList>) -> Self {
        Self { lists }
    }

    pub fn resolve(&self, event: u8) -> Option<&ActionList> {
        let list = self.lists.get(&event)?;
        match list.copy {
            Some(target) => Some(self.lists.get(&target).unwrap_or(list)),
            None => Some(list),
        }
    }

    pub fn has_event(&self, event: u8) -> bool {
        self.lists.contains_key(&event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WildcardAction {
    pub value: f32,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub actions: ActionList,
}

/// Threshold-keyed actions fired when a reading crosses into a new band.
#[derive(Debug, Clone, Default)]
pub struct WildcardTable {
    entries: BTreeMap<u8, Vec<WildcardAction>>,
    last_fired: [Option<usize>; WILDCARD_INDEXES],
}

impl WildcardTable {
    pub fn new(mut entries: BTreeMap<u8, Vec<WildcardAction>>) -> Self {
        entries.retain(|index, _| usize::from(*index) < WILDCARD_INDEXES);
        for list in entries.values_mut() {
            list.sort_by(|a, b| a.value.total_cmp(&b.value));
        }
        Self {
            entries,
            last_fired: [None; WILDCARD_INDEXES],
        }
    }

    pub fn select(&mut self, index: u8, reading: f32) -> Option<&ActionList> {
        let entries = self.entries.get(&index)?;
        let last = &mut self.last_fired[usize::from(index)];
        let Some(position) = entries.iter().rposition(|entry| entry.value <= reading) else {
            *last = None;
            return None;
        };

        let entry = &entries[position];
        if *last == Some(position) && !entry.repeat {
            return None;
        }
        *last = Some(position);
        Some(&entry.actions)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn output_list(gpio: u8) -> ActionList {
        ActionList {
            outputs: vec![DigitalOutput {
                gpio,
                value: true,
                revert_after_s: 0.0,
            }],
            ..ActionList::default()
        }
    }

    #[test]
    fn copy_resolves_to_target_list() {
        let mut lists = BTreeMap::new();
        lists.insert(0, output_list(4));
        lists.insert(
            1,
            ActionList {
                copy: Some(0),
                ..ActionList::default()
            },
        );
        let table = ActionTable::new(lists);

        assert_eq!(table.resolve(1), Some(&output_list(4)));
    }

    #[test]
    fn copy_is_followed_one_level_only() {
        let mut lists = BTreeMap::new();
        lists.insert(
            0,
            ActionList {
                copy: Some(2),
                ..output_list(4)
            },
        );
        lists.insert(
            1,
            ActionList {
                copy: Some(0),
                ..ActionList::default()
            },
        );
        lists.insert(2, output_list(9));
        let table = ActionTable::new(lists);

        let resolved = table.resolve(1).unwrap();
        assert_eq!(resolved.outputs[0].gpio, 4);
    }

    #[test]
    fn copy_to_missing_event_keeps_own_list() {
        let mut lists = BTreeMap::new();
        lists.insert(
            3,
            ActionList {
                copy: Some(7),
                ..output_list(2)
            },
        );
        let table = ActionTable::new(lists);

        assert_eq!(table.resolve(3).unwrap().outputs[0].gpio, 2);
        assert!(table.resolve(7).is_none());
    }

    #[test]
    fn thermostat_value_encoding() {
        assert_eq!(ThermostatCommand::decode(0.02), ThermostatCommand::Power(false));
        assert_eq!(ThermostatCommand::decode(0.03), ThermostatCommand::Power(true));
        assert_eq!(ThermostatCommand::decode(0.04), ThermostatCommand::TargetMode(0));
        assert_eq!(ThermostatCommand::decode(0.06), ThermostatCommand::TargetMode(2));
        assert_eq!(
            ThermostatCommand::decode(21.5),
            ThermostatCommand::HeatingThreshold(21.5)
        );
        match ThermostatCommand::decode(24.51) {
            ThermostatCommand::CoolingThreshold(value) => assert!((value - 24.5).abs() < 1e-4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wildcard_fires_once_per_band_unless_repeat() {
        let mut entries = BTreeMap::new();
        entries.insert(
            0,
            vec![
                WildcardAction {
                    value: 30.0,
                    repeat: true,
                    actions: output_list(3),
                },
                WildcardAction {
                    value: 10.0,
                    repeat: false,
                    actions: output_list(1),
                },
            ],
        );
        let mut table = WildcardTable::new(entries);

        assert!(table.select(0, 5.0).is_none());
        assert_eq!(table.select(0, 12.0).unwrap().outputs[0].gpio, 1);
        assert!(table.select(0, 15.0).is_none());
        assert_eq!(table.select(0, 31.0).unwrap().outputs[0].gpio, 3);
        assert_eq!(table.select(0, 32.0).unwrap().outputs[0].gpio, 3);
        assert!(table.select(1, 32.0).is_none());
    }
}

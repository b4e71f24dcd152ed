use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    types::{ChId, Value},
};

pub const SLOT_SECURITY_KILL_SWITCH: u8 = 8;
pub const SLOT_CHILD_KILL_SWITCH: u8 = 9;

/// Flash representation of a persisted characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Bool(bool),
    Int8(i8),
    Int32(i32),
    FloatX100(i32),
}

impl StoredValue {
    pub fn to_value(self) -> Value {
        match self {
            Self::Bool(value) => Value::Bool(value),
            Self::Int8(value) => Value::Int(i32::from(value)),
            Self::Int32(value) => Value::Int(value),
            Self::FloatX100(value) => Value::Float(value as f32 / 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Bool,
    Int8,
    Int32,
    FloatX100,
}

impl StoreKind {
    pub fn encode(self, value: Value) -> StoredValue {
        match self {
            Self::Bool => StoredValue::Bool(value.as_bool()),
            Self::Int8 => StoredValue::Int8(value.as_i32().clamp(-128, 127) as i8),
            Self::Int32 => StoredValue::Int32(value.as_i32()),
            Self::FloatX100 => StoredValue::FloatX100((value.as_f32() * 100.0).round() as i32),
        }
    }
}

pub fn state_key(accessory: u8, slot: u8) -> u16 {
    (u16::from(accessory) + 10) * 10 + u16::from(slot)
}

pub fn key_name(key: u16) -> String {
    key.to_string()
}

pub trait StateStore {
    fn load(&self, key: u16) -> Option<StoredValue>;
    fn save(&mut self, entries: &[(u16, StoredValue)]) -> Result<(), StoreError>;
    fn setup_flag(&self) -> bool;
    fn set_setup_flag(&mut self, enabled: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<u16, StoredValue>,
    setup: bool,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: u16, value: StoredValue) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn write_passes(&self) -> usize {
        self.writes
    }
}

impl StateStore for MemoryStore {
    fn load(&self, key: u16) -> Option<StoredValue> {
        self.values.get(&key).copied()
    }

    fn save(&mut self, entries: &[(u16, StoredValue)]) -> Result<(), StoreError> {
        self.writes += 1;
        for (key, value) in entries {
            self.values.insert(*key, *value);
        }
        Ok(())
    }

    fn setup_flag(&self) -> bool {
        self.setup
    }

    fn set_setup_flag(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.setup = enabled;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LastStateEntry {
    ch: ChId,
    key: u16,
    kind: StoreKind,
    saved: Option<StoredValue>,
}

/// Characteristics restored at boot and written back after changes settle.
#[derive(Debug, Default, Clone)]
pub struct LastStates {
    entries: Vec<LastStateEntry>,
}

impl LastStates {
    pub fn register(&mut self, ch: ChId, key: u16, kind: StoreKind, saved: Option<StoredValue>) {
        self.entries.push(LastStateEntry {
            ch,
            key,
            kind,
            saved,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose encoded value differs from the last write. Marks them clean.
    pub fn collect_dirty(&mut self, current: impl Fn(ChId) -> Value) -> Vec<(u16, StoredValue)> {
        let mut dirty = Vec::new();
        for entry in &mut self.entries {
            let encoded = entry.kind.encode(current(entry.ch));
            if entry.saved != Some(encoded) {
                entry.saved = Some(encoded);
                dirty.push((entry.key, encoded));
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn keys_follow_accessory_and_slot() {
        assert_eq!(state_key(1, 0), 110);
        assert_eq!(state_key(3, 4), 134);
        assert_eq!(state_key(2, SLOT_SECURITY_KILL_SWITCH), 128);
        assert_eq!(key_name(state_key(12, 1)), "221");
    }

    #[test]
    fn float_values_keep_two_decimals() {
        let stored = StoreKind::FloatX100.encode(Value::Float(21.456));
        assert_eq!(stored, StoredValue::FloatX100(2146));
        assert_eq!(stored.to_value(), Value::Float(21.46));
    }

    #[test]
    fn dirty_collection_skips_unchanged_entries() {
        let mut states = LastStates::default();
        states.register(ChId(0), 110, StoreKind::Bool, Some(StoredValue::Bool(false)));
        states.register(ChId(1), 120, StoreKind::Int8, None);

        let values = [Value::Bool(false), Value::Int(3)];
        let dirty = states.collect_dirty(|ch| values[ch.0]);
        assert_eq!(dirty, vec![(120, StoredValue::Int8(3))]);
        assert!(states.collect_dirty(|ch| values[ch.0]).is_empty());
    }
}

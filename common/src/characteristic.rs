use serde::Serialize;

use crate::types::{ChId, GroupId, Value};

/// One externally visible value slot. Each records its owning group so
/// lookups from a write back to the accessory are direct.
#[derive(Debug, Clone, Serialize)]
pub struct Characteristic {
    pub name: &'static str,
    #[serde(skip)]
    pub group: GroupId,
    pub slot: u8,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(f32, f32)>,
}

impl Characteristic {
    pub fn clamp(&self, value: Value) -> Value {
        match (self.range, value) {
            (Some((min, max)), Value::Int(raw)) => {
                Value::Int(raw.clamp(min.round() as i32, max.round() as i32))
            }
            (Some((min, max)), Value::Float(raw)) => Value::Float(raw.clamp(min, max)),
            _ => value,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Characteristics {
    items: Vec<Characteristic>,
}

impl Characteristics {
    pub fn add(&mut self, group: GroupId, slot: u8, name: &'static str, value: Value) -> ChId {
        self.add_ranged(group, slot, name, value, None)
    }

    pub fn add_ranged(
        &mut self,
        group: GroupId,
        slot: u8,
        name: &'static str,
        value: Value,
        range: Option<(f32, f32)>,
    ) -> ChId {
        let id = ChId(self.items.len());
        self.items.push(Characteristic {
            name,
            group,
            slot,
            value,
            range,
        });
        id
    }

    pub fn get(&self, ch: ChId) -> Option<&Characteristic> {
        self.items.get(ch.0)
    }

    pub fn value(&self, ch: ChId) -> Value {
        self.items
            .get(ch.0)
            .map(|item| item.value)
            .unwrap_or(Value::Bool(false))
    }

    /// Stores `value`, returning whether it differed from the previous one.
    pub fn set(&mut self, ch: ChId, value: Value) -> bool {
        match self.items.get_mut(ch.0) {
            Some(item) if item.value != value => {
                item.value = value;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

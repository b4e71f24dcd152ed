pub const TOPIC_ROOT: &str = "haa";
pub const TOPIC_SUFFIX_SET: &str = "set";
pub const TOPIC_SUFFIX_SENSOR: &str = "sensor";
pub const TOPIC_SUFFIX_BUTTON: &str = "button";

/// Characteristic state, published retained: `haa/<device>/<aid>/<slot>`.
pub fn state_topic(device: &str, accessory: u8, slot: u8) -> String {
    format!("{TOPIC_ROOT}/{device}/{accessory}/{slot}")
}

/// `haa/<device>/+/+/set`
pub fn set_filter(device: &str) -> String {
    format!("{TOPIC_ROOT}/{device}/+/+/{TOPIC_SUFFIX_SET}")
}

/// `haa/<device>/+/sensor`
pub fn sensor_filter(device: &str) -> String {
    format!("{TOPIC_ROOT}/{device}/+/{TOPIC_SUFFIX_SENSOR}")
}

/// `haa/<device>/button/<gpio>`
pub fn button_filter(device: &str) -> String {
    format!("{TOPIC_ROOT}/{device}/{TOPIC_SUFFIX_BUTTON}/+")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Set { accessory: u8, slot: u8 },
    Sensor { accessory: u8 },
    Button { gpio: u8 },
}

/// Parses a topic received on one of the subscription filters.
pub fn parse_inbound(device: &str, topic: &str) -> Option<Inbound> {
    let rest = topic
        .strip_prefix(TOPIC_ROOT)?
        .strip_prefix('/')?
        .strip_prefix(device)?
        .strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();

    match parts.as_slice() {
        [accessory, slot, TOPIC_SUFFIX_SET] => Some(Inbound::Set {
            accessory: accessory.parse().ok()?,
            slot: slot.parse().ok()?,
        }),
        [TOPIC_SUFFIX_BUTTON, gpio] => Some(Inbound::Button {
            gpio: gpio.parse().ok()?,
        }),
        [accessory, TOPIC_SUFFIX_SENSOR] => Some(Inbound::Sensor {
            accessory: accessory.parse().ok()?,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builds_state_topic() {
        assert_eq!(state_topic("kitchen", 3, 1), "haa/kitchen/3/1");
    }

    #[test]
    fn parses_inbound_topics() {
        assert_eq!(
            parse_inbound("kitchen", "haa/kitchen/3/1/set"),
            Some(Inbound::Set {
                accessory: 3,
                slot: 1
            })
        );
        assert_eq!(
            parse_inbound("kitchen", "haa/kitchen/2/sensor"),
            Some(Inbound::Sensor { accessory: 2 })
        );
        assert_eq!(
            parse_inbound("kitchen", "haa/kitchen/button/14"),
            Some(Inbound::Button { gpio: 14 })
        );
    }

    #[test]
    fn rejects_foreign_or_malformed_topics() {
        assert_eq!(parse_inbound("kitchen", "haa/garage/3/1/set"), None);
        assert_eq!(parse_inbound("kitchen", "haa/kitchen/x/1/set"), None);
        assert_eq!(parse_inbound("kitchen", "haa/kitchen/3/1"), None);
    }
}

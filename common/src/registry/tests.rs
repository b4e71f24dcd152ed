use std::collections::VecDeque;

use pretty_assertions::assert_eq;

use super::*;
use crate::{
    config::HaaConfig,
    input::{InputReader, NoInputs},
    sensor::SensorReading,
    store::{state_key, MemoryStore, StoredValue},
};

fn build_with(raw: &str, store: &MemoryStore) -> (Registry, Vec<Effect>) {
    let config = HaaConfig::from_json(raw).unwrap();
    Registry::build(&config, store, &NoInputs, 0).unwrap()
}

fn build(raw: &str) -> Registry {
    build_with(raw, &MemoryStore::new()).0
}

fn gpio_writes(effects: &[Effect]) -> Vec<(u8, bool)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::GpioWrite { gpio, level } => Some((*gpio, *level)),
            _ => None,
        })
        .collect()
}

fn notified_slots(effects: &[Effect], accessory: u8) -> Vec<u8> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Notify {
                accessory: notified,
                slot,
                ..
            } if *notified == accessory => Some(*slot),
            _ => None,
        })
        .collect()
}

fn setup_requests(effects: &[Effect]) -> usize {
    effects
        .iter()
        .filter(|effect| matches!(effect, Effect::System(SystemAction::SetupMode)))
        .count()
}

fn value_of(registry: &Registry, accessory: u8, slot: u8) -> Value {
    let ch = registry.find_ch(accessory, slot).unwrap();
    registry.value(ch).unwrap()
}

struct ScriptedProbe(VecDeque<Option<SensorReading>>);

impl SensorProbe for ScriptedProbe {
    fn read(&mut self) -> Option<SensorReading> {
        self.0.pop_front().flatten()
    }
}

const SWITCH_WITH_OUTPUT: &str = r#"{"accessories":[{"type":1,
    "inputs":[{"gpio":0}],
    "actions":{"0":{"outputs":[{"gpio":5,"value":false}]},"1":{"outputs":[{"gpio":5,"value":true}]}}}]}"#;

#[test]
fn repeated_value_only_notifies() {
    let mut registry = build(SWITCH_WITH_OUTPUT);

    let effects = registry.set_by_slot(1, 0, Value::Bool(true), 10);
    assert_eq!(gpio_writes(&effects), vec![(5, true)]);

    let effects = registry.set_by_slot(1, 0, Value::Bool(true), 20);
    assert!(gpio_writes(&effects).is_empty());
    assert_eq!(notified_slots(&effects, 1), vec![0]);
}

#[test]
fn security_switch_rejects_network_writes() {
    let mut registry = build(
        r#"{"accessories":[{"type":1,"kill_switches":{"security":true},
            "actions":{"1":{"outputs":[{"gpio":5,"value":true}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 8, Value::Bool(false), 0);
    assert_eq!(notified_slots(&effects, 1), vec![8]);

    let effects = registry.set_by_slot(1, 0, Value::Bool(true), 10);
    assert!(gpio_writes(&effects).is_empty());
    assert_eq!(notified_slots(&effects, 1), vec![0]);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
}

#[test]
fn child_lock_blocks_physical_inputs() {
    let mut registry = build(
        r#"{"accessories":[{"type":1,"inputs":[{"gpio":0}],"kill_switches":{"child":true}}]}"#,
    );

    registry.button_event(0, PressKind::Single, 0);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));

    registry.set_by_slot(1, 9, Value::Bool(false), 10);
    let effects = registry.button_event(0, PressKind::Single, 20);
    assert!(effects.is_empty());
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
}

#[test]
fn inputs_match_on_press_kind() {
    let mut registry = build(
        r#"{"accessories":[{"type":1,"inputs":[{"gpio":0,"press":"double"}]}]}"#,
    );

    registry.button_event(0, PressKind::Single, 0);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
    registry.button_event(0, PressKind::Double, 10);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
}

#[test]
fn group_notification_covers_every_channel() {
    let mut registry = build(r#"{"accessories":[{"type":21}]}"#);

    let effects = registry.set_by_slot(1, 4, Value::Float(22.0), 0);
    assert_eq!(notified_slots(&effects, 1), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn copied_action_list_runs_target_event() {
    let mut registry = build(
        r#"{"accessories":[{"type":1,
            "actions":{"0":{"outputs":[{"gpio":5,"value":false}]},"1":{"copy":0}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert_eq!(gpio_writes(&effects), vec![(5, false)]);
}

#[test]
fn timed_output_reverts() {
    let mut registry = build(
        r#"{"accessories":[{"type":1,
            "actions":{"1":{"outputs":[{"gpio":5,"value":true,"revert_after_s":0.5}]}}}]}"#,
    );

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert!(registry.tick(499).is_empty());
    assert_eq!(gpio_writes(&registry.tick(500)), vec![(5, false)]);
}

#[test]
fn eighth_quick_toggle_requests_setup_mode() {
    let mut registry = build(SWITCH_WITH_OUTPUT);

    let mut requests = 0;
    for press in 0..10u64 {
        let effects = registry.button_event(0, PressKind::Single, press * 200);
        requests += setup_requests(&effects);
        if press == 7 {
            assert_eq!(requests, 1);
        }
    }
    assert_eq!(requests, 1);
}

#[test]
fn slow_toggles_reset_the_counter() {
    let mut registry = build(SWITCH_WITH_OUTPUT);

    let mut requests = 0;
    for press in 0..7u64 {
        requests += setup_requests(&registry.button_event(0, PressKind::Single, press * 200));
    }
    assert!(registry.setup_counter > 0);
    registry.tick(1_200 + SETUP_TOGGLE_WINDOW_MS + 1);
    assert_eq!(registry.setup_counter, 0);
    let now = 5_000;
    requests += setup_requests(&registry.button_event(0, PressKind::Single, now));
    assert_eq!(requests, 0);
}

#[test]
fn setup_mode_respects_allowed_time() {
    let mut registry = build(
        r#"{"general":{"allowed_setup_mode_time_s":10},"accessories":[{"type":1,"inputs":[{"gpio":0}]}]}"#,
    );

    let start = 20_000;
    let requests: usize = (0..8u64)
        .map(|press| setup_requests(&registry.button_event(0, PressKind::Single, start + press * 100)))
        .sum();
    assert_eq!(requests, 0);
}

#[test]
fn status_led_blinks_on_change() {
    let mut registry = build(
        r#"{"general":{"status_led":{"gpio":2}},"accessories":[{"type":1}]}"#,
    );

    let effects = registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert!(effects.iter().any(|effect| matches!(effect, Effect::LedBlink(2))));
}

#[test]
fn saves_coalesce_into_one_write() {
    let mut registry = build(r#"{"accessories":[{"type":1,"initial_state":5,"inputs":[{"gpio":0}]}]}"#);

    for press in 0..3u64 {
        registry.button_event(0, PressKind::Single, press * 100);
    }
    let saves = |effects: Vec<Effect>| -> Vec<Vec<(u16, StoredValue)>> {
        effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::SaveStates(entries) => Some(entries),
                _ => None,
            })
            .collect()
    };

    assert!(saves(registry.tick(200 + SAVE_STATES_DELAY_MS - 1)).is_empty());
    assert_eq!(
        saves(registry.tick(200 + SAVE_STATES_DELAY_MS)),
        vec![vec![(state_key(1, 0), StoredValue::Bool(true))]]
    );
    assert!(saves(registry.tick(20_000)).is_empty());
}

#[test]
fn last_state_is_restored_through_actions() {
    let store = MemoryStore::new().with_value(state_key(1, 0), StoredValue::Bool(true));
    let (registry, effects) = build_with(
        r#"{"accessories":[{"type":1,"initial_state":5,
            "actions":{"1":{"outputs":[{"gpio":5,"value":true}]}}}]}"#,
        &store,
    );

    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
    assert_eq!(gpio_writes(&effects), vec![(5, true)]);
}

#[test]
fn inverted_last_state_flips_saved_value() {
    let store = MemoryStore::new().with_value(state_key(1, 0), StoredValue::Bool(true));
    let (registry, _) = build_with(r#"{"accessories":[{"type":1,"initial_state":6}]}"#, &store);

    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
}

#[test]
fn boot_toggles_do_not_count_towards_setup_mode() {
    let raw = r#"{"accessories":[
        {"type":1,"initial_state":1},{"type":1,"initial_state":1},{"type":1,"initial_state":1},
        {"type":1,"initial_state":1},{"type":1,"initial_state":1},{"type":1,"initial_state":1},
        {"type":1,"initial_state":1},{"type":1,"initial_state":1},{"type":1,"initial_state":1}]}"#;
    let (_, effects) = build_with(raw, &MemoryStore::new());

    assert_eq!(setup_requests(&effects), 0);
}

#[test]
fn auto_off_returns_switch_to_off() {
    let mut registry = build(r#"{"accessories":[{"type":1,"auto_off_s":1}]}"#);

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    registry.tick(999);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
    registry.tick(1_000);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
}

const CONTACT_WITH_OUTPUT: &str = r#"{"accessories":[{"type":5,"auto_off_s":1,
    "actions":{"0":{"outputs":[{"gpio":5,"value":false}]},"1":{"outputs":[{"gpio":5,"value":true}]}}}]}"#;

#[test]
fn contact_sensor_fires_active_then_idle_actions() {
    let mut registry = build(CONTACT_WITH_OUTPUT);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(0));

    let effects = registry.set_by_slot(1, 0, Value::Int(1), 0);
    assert_eq!(gpio_writes(&effects), vec![(5, true)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(1));

    assert!(gpio_writes(&registry.tick(999)).is_empty());
    let effects = registry.tick(1_000);
    assert_eq!(gpio_writes(&effects), vec![(5, false)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(0));
}

#[test]
fn repeated_sensor_state_fires_no_action() {
    let mut registry = build(CONTACT_WITH_OUTPUT);

    registry.set_by_slot(1, 0, Value::Int(1), 0);
    let effects = registry.set_by_slot(1, 0, Value::Int(1), 100);

    assert!(gpio_writes(&effects).is_empty());
    assert_eq!(notified_slots(&effects, 1), vec![0]);
}

#[test]
fn motion_sensor_auto_off_keeps_bool_state() {
    let mut registry = build(r#"{"accessories":[{"type":12,"auto_off_s":2}]}"#);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
    registry.tick(2_000);
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
}

#[test]
fn garage_reversal_fires_closing_from_moving() {
    let mut registry = build(
        r#"{"accessories":[{"type":40,"garage":{"open_time_s":10},
            "actions":{"2":{"outputs":[{"gpio":12,"value":true}]},"6":{"outputs":[{"gpio":13,"value":true}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 1, Value::Int(0), 0);
    assert_eq!(gpio_writes(&effects), vec![(12, true)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(2));

    for second in 1..=3u64 {
        registry.tick(second * 1_000);
    }
    let effects = registry.set_by_slot(1, 1, Value::Int(1), 3_100);
    assert_eq!(gpio_writes(&effects), vec![(13, true)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(3));

    for second in 4..=14u64 {
        registry.tick(second * 1_000);
    }
    assert_eq!(value_of(&registry, 1, 0), Value::Int(1));
}

#[test]
fn lightbulb_slews_then_stops() {
    let mut registry = build(
        r#"{"accessories":[{"type":30,"lightbulb":{"w":4,"step":40000}}]}"#,
    );
    assert_eq!(registry.pwm_gpios(), &[4]);

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    let frames = |effects: &[Effect]| -> Vec<Vec<u16>> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::PwmWrite(frame) => Some(frame.duty().to_vec()),
                _ => None,
            })
            .collect()
    };

    let first = frames(&registry.tick(10));
    assert_eq!(first, vec![vec![40_000]]);
    let second = frames(&registry.tick(20));
    assert_eq!(second.len(), 1);
    assert!(second[0][0] > 40_000);
    assert!(frames(&registry.tick(30)).is_empty());
}

#[test]
fn manager_drives_thermostat_power_and_threshold() {
    let mut registry = build(
        r#"{"accessories":[
            {"type":1,"actions":{"1":{"manage":[{"accessory":2,"value":0.03},{"accessory":2,"value":22.0}]}}},
            {"type":21}]}"#,
    );

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert_eq!(value_of(&registry, 2, 1), Value::Int(1));
    assert_eq!(value_of(&registry, 2, 4), Value::Float(22.0));
}

#[test]
fn manager_toggles_kill_switch() {
    let mut registry = build(
        r#"{"accessories":[
            {"type":1,"actions":{"1":{"manage":[{"accessory":2,"kill_switch":0}]}}},
            {"type":1,"kill_switches":{"security":true}}]}"#,
    );

    registry.set_by_slot(1, 0, Value::Bool(true), 0);
    assert_eq!(value_of(&registry, 2, 8), Value::Bool(false));
}

#[test]
fn manager_loops_stop_at_depth_limit() {
    let mut registry = build(
        r#"{"accessories":[
            {"type":3,"actions":{"0":{"manage":[{"accessory":2,"value":0}]}}},
            {"type":3,"actions":{"0":{"manage":[{"accessory":1,"value":0}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 0, Value::Int(0), 0);
    assert!(effects.len() <= usize::from(MAX_ACTION_DEPTH) * 2 + 2);
}

#[test]
fn fan_speed_wildcard_fires_once_per_band() {
    let mut registry = build(
        r#"{"accessories":[{"type":65,"wildcard_actions":{"0":[
            {"value":50,"actions":{"outputs":[{"gpio":7,"value":true}]}}]}}]}"#,
    );

    assert!(gpio_writes(&registry.set_by_slot(1, 1, Value::Float(40.0), 0)).is_empty());
    assert_eq!(
        gpio_writes(&registry.set_by_slot(1, 1, Value::Float(60.0), 10)),
        vec![(7, true)]
    );
    assert!(gpio_writes(&registry.set_by_slot(1, 1, Value::Float(70.0), 20)).is_empty());
}

#[test]
fn valve_closes_when_duration_elapses() {
    let mut registry = build(r#"{"accessories":[{"type":20,"valve":{"max_duration_s":3}}]}"#);

    registry.set_by_slot(1, 2, Value::Int(2), 0);
    registry.set_by_slot(1, 0, Value::Int(1), 0);
    assert_eq!(value_of(&registry, 1, 3), Value::Int(2));

    registry.tick(1_000);
    assert_eq!(value_of(&registry, 1, 3), Value::Int(1));
    assert_eq!(value_of(&registry, 1, 0), Value::Int(1));

    registry.tick(2_000);
    assert_eq!(value_of(&registry, 1, 3), Value::Int(0));
    assert_eq!(value_of(&registry, 1, 0), Value::Int(0));
}

#[test]
fn thermostat_heats_below_threshold() {
    let mut registry = build(
        r#"{"accessories":[{"type":21,"actions":{"3":{"outputs":[{"gpio":14,"value":true}]}}}]}"#,
    );
    let probe = ScriptedProbe(VecDeque::from([Some(SensorReading::Climate {
        temperature: 18.04,
        humidity: None,
    })]));
    assert!(registry.attach_probe(1, Box::new(probe)));

    registry.set_by_slot(1, 1, Value::Int(1), 0);
    let effects = registry.tick(3_000);
    assert_eq!(gpio_writes(&effects), vec![(14, true)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Float(18.0));
    assert_eq!(value_of(&registry, 1, 2), Value::Int(2));
}

#[test]
fn repeated_sensor_failures_raise_error_event() {
    let mut registry = build(
        r#"{"accessories":[{"type":21,"sensor":{"poll_period_s":10,"error_threshold":2},
            "actions":{"5":{"outputs":[{"gpio":9,"value":true}]}}}]}"#,
    );
    assert!(registry.attach_probe(1, Box::new(ScriptedProbe(VecDeque::new()))));

    assert!(gpio_writes(&registry.tick(3_000)).is_empty());
    assert_eq!(gpio_writes(&registry.tick(13_000)), vec![(9, true)]);
    assert!(gpio_writes(&registry.tick(23_000)).is_empty());
}

#[test]
fn zoning_follows_member_thermostats() {
    let mut registry = build(
        r#"{"accessories":[{"type":21},{"type":25,"zoning":{"thermostats":[1]}}]}"#,
    );
    let probe = ScriptedProbe(VecDeque::from([Some(SensorReading::Climate {
        temperature: 15.0,
        humidity: None,
    })]));
    registry.attach_probe(1, Box::new(probe));

    registry.set_by_slot(1, 1, Value::Int(1), 0);
    registry.tick(3_000);
    assert_eq!(value_of(&registry, 2, 0), Value::Int(2));
}

#[test]
fn zoning_rejects_non_thermostat_members() {
    let config = HaaConfig::from_json(
        r#"{"accessories":[{"type":1},{"type":25,"zoning":{"thermostats":[1]}}]}"#,
    )
    .unwrap();
    let result = Registry::build(&config, &MemoryStore::new(), &NoInputs, 0);
    assert!(matches!(
        result,
        Err(crate::error::ConfigError::InvalidField { accessory: 2, .. })
    ));
}

#[test]
fn window_cover_reaches_target() {
    let mut registry = build(
        r#"{"accessories":[{"type":45,"cover":{"open_time_s":2,"close_time_s":2},
            "actions":{"1":{"outputs":[{"gpio":3,"value":true}]},"2":{"outputs":[{"gpio":3,"value":false}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 1, Value::Int(100), 0);
    assert_eq!(gpio_writes(&effects), vec![(3, true)]);
    assert_eq!(value_of(&registry, 1, 2), Value::Int(1));

    let mut now = 0;
    let mut stopped = false;
    while now < 5_000 && !stopped {
        now += WINDOW_COVER_TICK_MS;
        stopped = gpio_writes(&registry.tick(now)).contains(&(3, false));
    }
    assert!(stopped);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(100));
    assert_eq!(value_of(&registry, 1, 2), Value::Int(2));
}

const WINDOW_COVER_TICK_MS: u64 = crate::window_cover::WINDOW_COVER_POLL_PERIOD_MS;

#[test]
fn snapshots_list_every_characteristic() {
    let registry = build(
        r#"{"accessories":[{"type":2,"kill_switches":{"security":true,"child":true}}]}"#,
    );

    let snapshot = registry.accessories();
    assert_eq!(snapshot.len(), 1);
    let slots: Vec<u8> = snapshot[0].characteristics.iter().map(|c| c.slot).collect();
    assert_eq!(slots, vec![0, 1, 8, 9]);
    assert_eq!(snapshot[0].kind, "outlet");
}

#[test]
fn lock_mirrors_target_into_current() {
    let mut registry = build(
        r#"{"accessories":[{"type":4,
            "actions":{"0":{"outputs":[{"gpio":5,"value":true}]}}}]}"#,
    );
    assert_eq!(value_of(&registry, 1, 0), Value::Int(1));

    let effects = registry.set_by_slot(1, 1, Value::Int(0), 0);
    assert_eq!(gpio_writes(&effects), vec![(5, true)]);
    assert_eq!(value_of(&registry, 1, 0), Value::Int(0));
}

#[test]
fn second_lock_uses_its_own_events() {
    let mut registry = build(
        r#"{"accessories":[{"type":15,
            "actions":{"0":{"outputs":[{"gpio":5,"value":true}]},
                       "2":{"outputs":[{"gpio":6,"value":true}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 3, Value::Int(0), 0);
    assert_eq!(gpio_writes(&effects), vec![(6, true)]);
    assert_eq!(value_of(&registry, 1, 2), Value::Int(0));
    assert_eq!(value_of(&registry, 1, 0), Value::Int(1));
}

#[test]
fn tv_remote_key_fires_offset_event() {
    let mut registry = build(
        r#"{"accessories":[{"type":50,
            "actions":{"14":{"outputs":[{"gpio":7,"value":true}]}}}]}"#,
    );

    let effects = registry.set_by_slot(1, 3, Value::Int(4), 0);
    assert_eq!(gpio_writes(&effects), vec![(7, true)]);
}

#[test]
fn brightness_buttons_step_and_clamp() {
    let mut registry = build(
        r#"{"accessories":[{"type":30,"lightbulb":{"w":4},
            "inputs":[{"gpio":0,"role":"brightness_up"},{"gpio":1,"role":"brightness_down"}]}]}"#,
    );

    registry.button_event(1, PressKind::Single, 0);
    registry.button_event(1, PressKind::Single, 10);
    assert_eq!(value_of(&registry, 1, 1), Value::Int(60));

    registry.button_event(0, PressKind::Single, 20);
    registry.button_event(0, PressKind::Single, 30);
    registry.button_event(0, PressKind::Single, 40);
    assert_eq!(value_of(&registry, 1, 1), Value::Int(100));
}

struct HighInputs;

impl InputReader for HighInputs {
    fn level(&self, _gpio: u8) -> Option<bool> {
        Some(true)
    }
}

#[test]
fn fixed_input_state_follows_pin_level() {
    let raw = r#"{"accessories":[{"type":1,"initial_state":4,"inputs":[{"gpio":0,"role":"on"}],
        "actions":{"1":{"outputs":[{"gpio":5,"value":true}]}}}]}"#;
    let config = HaaConfig::from_json(raw).unwrap();
    let (registry, effects) =
        Registry::build(&config, &MemoryStore::new(), &HighInputs, 0).unwrap();
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(true));
    assert!(gpio_writes(&effects).contains(&(5, true)));

    let inverted = raw.replace(r#""role":"on""#, r#""role":"on","inverted":true"#);
    let config = HaaConfig::from_json(&inverted).unwrap();
    let (registry, _) = Registry::build(&config, &MemoryStore::new(), &HighInputs, 0).unwrap();
    assert_eq!(value_of(&registry, 1, 0), Value::Bool(false));
}

use std::collections::HashMap;

use crate::types::{ChId, GroupId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Group(GroupId, TimerSlot),
    AutodimmerWindow(GroupId),
    Autodimmer(GroupId),
    PwmSlew,
    SaveStates,
    SetupToggle,
}

/// Work queued without a handle. Once queued it always runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deferred {
    GpioRevert { gpio: u8, level: bool },
    AutoOff { ch: ChId, value: Value },
}

/// What a motion state machine wants done with its group timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Start,
    Stop,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fired {
    Timer(TimerKey),
    Deferred(Deferred),
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    due_ms: u64,
    period_ms: Option<u64>,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    due_ms: u64,
    seq: u64,
    task: Deferred,
}

/// Millisecond timer wheel driven by the caller's clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: HashMap<TimerKey, Timer>,
    pending: Vec<Pending>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_once(&mut self, key: TimerKey, now_ms: u64, delay_ms: u64) {
        let seq = self.next_seq();
        self.timers.insert(
            key,
            Timer {
                due_ms: now_ms.saturating_add(delay_ms),
                period_ms: None,
                seq,
            },
        );
    }

    pub fn arm_periodic(&mut self, key: TimerKey, now_ms: u64, period_ms: u64) {
        self.arm_periodic_after(key, now_ms, period_ms, period_ms);
    }

    pub fn arm_periodic_after(
        &mut self,
        key: TimerKey,
        now_ms: u64,
        first_ms: u64,
        period_ms: u64,
    ) {
        let seq = self.next_seq();
        self.timers.insert(
            key,
            Timer {
                due_ms: now_ms.saturating_add(first_ms),
                period_ms: Some(period_ms.max(1)),
                seq,
            },
        );
    }

    pub fn disarm(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    pub fn defer(&mut self, now_ms: u64, delay_ms: u64, task: Deferred) {
        let seq = self.next_seq();
        self.pending.push(Pending {
            due_ms: now_ms.saturating_add(delay_ms),
            seq,
            task,
        });
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    /// Pops the earliest expired entry. Periodic timers are re-armed one period
    /// later, skipping ahead when the caller fell behind.
    pub fn next_due(&mut self, now_ms: u64) -> Option<Fired> {
        let timer = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.due_ms <= now_ms)
            .min_by_key(|(_, timer)| (timer.due_ms, timer.seq))
            .map(|(key, timer)| (*key, *timer));
        let pending = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due_ms <= now_ms)
            .min_by_key(|(_, entry)| (entry.due_ms, entry.seq))
            .map(|(index, entry)| (index, *entry));

        match (timer, pending) {
            (Some((key, timer)), Some((_, entry)))
                if (timer.due_ms, timer.seq) <= (entry.due_ms, entry.seq) =>
            {
                Some(self.fire_timer(key, timer, now_ms))
            }
            (Some((key, timer)), None) => Some(self.fire_timer(key, timer, now_ms)),
            (_, Some((index, entry))) => {
                self.pending.swap_remove(index);
                Some(Fired::Deferred(entry.task))
            }
            (None, None) => None,
        }
    }

    fn fire_timer(&mut self, key: TimerKey, timer: Timer, now_ms: u64) -> Fired {
        match timer.period_ms {
            Some(period_ms) => {
                let mut due_ms = timer.due_ms.saturating_add(period_ms);
                if due_ms <= now_ms {
                    due_ms = now_ms.saturating_add(period_ms);
                }
                let seq = self.next_seq();
                self.timers.insert(
                    key,
                    Timer {
                        due_ms,
                        period_ms: Some(period_ms),
                        seq,
                    },
                );
            }
            None => {
                self.timers.remove(&key);
            }
        }
        Fired::Timer(key)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn drain(scheduler: &mut Scheduler, now_ms: u64) -> Vec<Fired> {
        let mut fired = Vec::new();
        while let Some(entry) = scheduler.next_due(now_ms) {
            fired.push(entry);
        }
        fired
    }

    #[test]
    fn one_shot_fires_once() {
        let mut scheduler = Scheduler::new();
        scheduler.arm_once(TimerKey::SaveStates, 0, 5_000);

        assert!(drain(&mut scheduler, 4_999).is_empty());
        assert_eq!(
            drain(&mut scheduler, 5_000),
            vec![Fired::Timer(TimerKey::SaveStates)]
        );
        assert!(!scheduler.is_armed(TimerKey::SaveStates));
    }

    #[test]
    fn rearming_pushes_deadline_out() {
        let mut scheduler = Scheduler::new();
        scheduler.arm_once(TimerKey::SaveStates, 0, 5_000);
        scheduler.arm_once(TimerKey::SaveStates, 3_000, 5_000);

        assert!(drain(&mut scheduler, 6_000).is_empty());
        assert_eq!(drain(&mut scheduler, 8_000).len(), 1);
    }

    #[test]
    fn periodic_keeps_firing_until_disarmed() {
        let mut scheduler = Scheduler::new();
        let key = TimerKey::Group(GroupId(0), TimerSlot::Primary);
        scheduler.arm_periodic(key, 0, 250);

        assert_eq!(drain(&mut scheduler, 250), vec![Fired::Timer(key)]);
        assert_eq!(drain(&mut scheduler, 500), vec![Fired::Timer(key)]);
        scheduler.disarm(key);
        assert!(drain(&mut scheduler, 1_000).is_empty());
    }

    #[test]
    fn late_periodic_does_not_burst() {
        let mut scheduler = Scheduler::new();
        scheduler.arm_periodic(TimerKey::PwmSlew, 0, 10);

        assert_eq!(drain(&mut scheduler, 100).len(), 1);
        assert_eq!(drain(&mut scheduler, 105).len(), 0);
        assert_eq!(drain(&mut scheduler, 110).len(), 1);
    }

    #[test]
    fn deferred_tasks_are_independent() {
        let mut scheduler = Scheduler::new();
        let revert = Deferred::GpioRevert {
            gpio: 4,
            level: false,
        };
        scheduler.defer(0, 1_000, revert);
        scheduler.defer(500, 1_000, revert);

        assert_eq!(scheduler.pending_tasks(), 2);
        assert_eq!(drain(&mut scheduler, 1_000), vec![Fired::Deferred(revert)]);
        assert_eq!(drain(&mut scheduler, 1_500), vec![Fired::Deferred(revert)]);
    }

    #[test]
    fn expired_entries_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.arm_once(TimerKey::SetupToggle, 0, 300);
        scheduler.defer(
            0,
            100,
            Deferred::GpioRevert {
                gpio: 1,
                level: true,
            },
        );
        scheduler.arm_once(TimerKey::SaveStates, 0, 200);

        let fired = drain(&mut scheduler, 1_000);
        assert_eq!(
            fired,
            vec![
                Fired::Deferred(Deferred::GpioRevert {
                    gpio: 1,
                    level: true
                }),
                Fired::Timer(TimerKey::SaveStates),
                Fired::Timer(TimerKey::SetupToggle),
            ]
        );
    }
}

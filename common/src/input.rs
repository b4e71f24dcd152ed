use crate::types::PressKind;

pub const DEBOUNCE_MS: u64 = 60;
pub const DOUBLE_PRESS_MS: u64 = 400;
pub const LONG_PRESS_MS: u64 = 450;

/// Reads the current logic level of an input pin.
pub trait InputReader {
    fn level(&self, gpio: u8) -> Option<bool>;
}

/// Reader for builds without physical inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInputs;

impl InputReader for NoInputs {
    fn level(&self, _gpio: u8) -> Option<bool> {
        None
    }
}

/// Turns sampled pin levels into single, double and long presses.
///
/// `level` passed to [`ButtonDecoder::sample`] is already corrected for
/// pull-up and inversion: true means pressed.
#[derive(Debug, Default, Clone)]
pub struct ButtonDecoder {
    stable: bool,
    candidate: Option<(bool, u64)>,
    pressed_at: Option<u64>,
    pending_single: Option<u64>,
}

impl ButtonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, level: bool, now_ms: u64) -> Option<PressKind> {
        if level != self.stable {
            match self.candidate {
                Some((candidate, since)) if candidate == level => {
                    if now_ms.saturating_sub(since) >= DEBOUNCE_MS {
                        self.candidate = None;
                        self.stable = level;
                        if let Some(press) = self.edge(level, now_ms) {
                            return Some(press);
                        }
                    }
                }
                _ => self.candidate = Some((level, now_ms)),
            }
        } else {
            self.candidate = None;
        }

        match self.pending_single {
            Some(released) if now_ms.saturating_sub(released) >= DOUBLE_PRESS_MS => {
                self.pending_single = None;
                Some(PressKind::Single)
            }
            _ => None,
        }
    }

    fn edge(&mut self, pressed: bool, now_ms: u64) -> Option<PressKind> {
        if pressed {
            self.pressed_at = Some(now_ms);
            return None;
        }

        let held = now_ms.saturating_sub(self.pressed_at.take()?);
        if held >= LONG_PRESS_MS {
            self.pending_single = None;
            return Some(PressKind::Long);
        }
        if self.pending_single.take().is_some() {
            return Some(PressKind::Double);
        }
        self.pending_single = Some(now_ms);
        None
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn feed(decoder: &mut ButtonDecoder, samples: &[(bool, u64)]) -> Vec<PressKind> {
        samples
            .iter()
            .filter_map(|(level, now)| decoder.sample(*level, *now))
            .collect()
    }

    #[test]
    fn short_press_resolves_after_double_window() {
        let mut decoder = ButtonDecoder::new();
        let presses = feed(
            &mut decoder,
            &[
                (true, 0),
                (true, 70),
                (false, 200),
                (false, 270),
                (false, 500),
                (false, 700),
            ],
        );
        assert_eq!(presses, vec![PressKind::Single]);
    }

    #[test]
    fn two_short_presses_make_a_double() {
        let mut decoder = ButtonDecoder::new();
        let presses = feed(
            &mut decoder,
            &[
                (true, 0),
                (true, 70),
                (false, 150),
                (false, 220),
                (true, 300),
                (true, 370),
                (false, 450),
                (false, 520),
                (false, 2_000),
            ],
        );
        assert_eq!(presses, vec![PressKind::Double]);
    }

    #[test]
    fn held_press_is_long() {
        let mut decoder = ButtonDecoder::new();
        let presses = feed(
            &mut decoder,
            &[(true, 0), (true, 70), (true, 600), (false, 700), (false, 770)],
        );
        assert_eq!(presses, vec![PressKind::Long]);
    }

    #[test]
    fn glitches_shorter_than_debounce_are_ignored() {
        let mut decoder = ButtonDecoder::new();
        let presses = feed(
            &mut decoder,
            &[(true, 0), (false, 20), (true, 40), (false, 60), (false, 1_000)],
        );
        assert!(presses.is_empty());
    }

    #[test]
    fn no_inputs_reads_nothing() {
        assert_eq!(NoInputs.level(4), None);
    }
}

use std::f32::consts::PI;

pub const PWM_SCALE: u16 = u16::MAX - 1;
pub const COLOR_TEMP_MIN: f32 = 71.0;
pub const COLOR_TEMP_MAX: f32 = 400.0;

const SECTOR_1: f32 = 2.094_39;
const SECTOR_2: f32 = 4.188_787;
const SIXTY_DEGREES: f32 = 1.047_196_7;

/// Channel intensities in 0.0..=1.0 before factors are applied.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorMix {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub w: f32,
}

/// HSI to RGBW. Hue in degrees, saturation and intensity in percent.
/// Without a white channel the white share is spread over red, green and blue.
pub fn hsi_to_rgbw(hue: f32, saturation: f32, intensity: f32, has_white: bool) -> ColorMix {
    let mut h = hue.rem_euclid(360.0) * PI / 180.0;
    let s = (saturation / 100.0).clamp(0.0, 1.0);
    let i = (intensity / 100.0).clamp(0.0, 1.0);

    let sector = if h < SECTOR_1 {
        0
    } else if h < SECTOR_2 {
        h -= SECTOR_1;
        1
    } else {
        h -= SECTOR_2;
        2
    };

    let ratio = h.cos() / (SIXTY_DEGREES - h).cos();
    let lead = s * i / 3.0 * (1.0 + ratio);
    let trail = s * i / 3.0 * (1.0 + (1.0 - ratio));
    let white = (1.0 - s) * i;

    let (r, g, b) = match sector {
        0 => (lead, trail, 0.0),
        1 => (0.0, lead, trail),
        _ => (trail, 0.0, lead),
    };

    if has_white {
        ColorMix { r, g, b, w: white }
    } else {
        let share = white / 3.0;
        ColorMix {
            r: r + share,
            g: g + share,
            b: b + share,
            w: 0.0,
        }
    }
}

/// Splits a colour temperature in mireds into (cool, warm) white levels.
pub fn color_temperature_mix(mireds: f32, intensity: f32) -> (f32, f32) {
    let i = (intensity / 100.0).clamp(0.0, 1.0);
    let t = (mireds.clamp(COLOR_TEMP_MIN, COLOR_TEMP_MAX) - COLOR_TEMP_MIN)
        / (COLOR_TEMP_MAX - COLOR_TEMP_MIN);
    let warm = t.sqrt();
    let cool = (1.0 - t).sqrt();
    let peak = warm.max(cool);
    (cool / peak * i, warm / peak * i)
}

pub fn to_duty(level: f32, factor: f32) -> u16 {
    let scaled = level * factor * f32::from(PWM_SCALE);
    scaled.clamp(0.0, f32::from(PWM_SCALE)).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duty(mix: ColorMix) -> [u16; 4] {
        [
            to_duty(mix.r, 1.0),
            to_duty(mix.g, 1.0),
            to_duty(mix.b, 1.0),
            to_duty(mix.w, 1.0),
        ]
    }

    #[test]
    fn pure_red_at_full_intensity() {
        let [r, g, b, w] = duty(hsi_to_rgbw(0.0, 100.0, 100.0, true));
        assert_eq!(r, PWM_SCALE);
        assert!(g < 10);
        assert_eq!(b, 0);
        assert_eq!(w, 0);
    }

    #[test]
    fn desaturated_rgb_is_balanced_white() {
        for hue in [0.0, 90.0, 180.0, 300.0] {
            let [r, g, b, w] = duty(hsi_to_rgbw(hue, 0.0, 100.0, false));
            assert_eq!(r, g);
            assert_eq!(g, b);
            assert_eq!(w, 0);
            assert!(r > 0);
        }
    }

    #[test]
    fn desaturated_rgbw_uses_white_channel() {
        let [r, g, b, w] = duty(hsi_to_rgbw(45.0, 0.0, 100.0, true));
        assert_eq!((r, g, b), (0, 0, 0));
        assert_eq!(w, PWM_SCALE);
    }

    #[test]
    fn sectors_route_to_expected_channels() {
        let green = hsi_to_rgbw(120.0, 100.0, 100.0, true);
        assert!(green.g > 0.99 && green.r == 0.0);
        let blue = hsi_to_rgbw(240.0, 100.0, 100.0, true);
        assert!(blue.b > 0.99 && blue.g == 0.0);
    }

    #[test]
    fn factor_is_clamped_to_scale() {
        assert_eq!(to_duty(1.0, 1.5), PWM_SCALE);
        assert_eq!(to_duty(0.5, 0.0), 0);
    }

    #[test]
    fn color_temperature_extremes() {
        let (cool, warm) = color_temperature_mix(50.0, 100.0);
        assert_eq!((cool, warm), (1.0, 0.0));
        let (cool, warm) = color_temperature_mix(500.0, 50.0);
        assert_eq!((cool, warm), (0.0, 0.5));
        let (cool, warm) = color_temperature_mix(235.5, 100.0);
        assert!((cool - 1.0).abs() < 1e-3 && (warm - 1.0).abs() < 1e-3);
    }
}

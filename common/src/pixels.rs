use crate::driver::DutySink;

/// Transmits one GRB byte stream to a WS2812 strip.
pub trait PixelWriter: Send {
    fn write(&mut self, grb: &[u8]);
}

/// Buffers RGB pixels and shifts them out in wire order on `update`.
pub struct PixelStrip<W> {
    writer: W,
    pixels: Vec<[u8; 3]>,
}

impl<W: PixelWriter> PixelStrip<W> {
    pub fn new(writer: W, count: usize) -> Self {
        Self {
            writer,
            pixels: vec![[0; 3]; count.max(1)],
        }
    }

    fn grb_bytes(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .flat_map(|[r, g, b]| [*g, *r, *b])
            .collect()
    }
}

impl<W: PixelWriter> DutySink for PixelStrip<W> {
    fn set_channel(&mut self, pixel: usize, channel: usize, duty: u16) {
        let Some(rgb) = self.pixels.get_mut(pixel) else {
            return;
        };
        if let Some(slot) = rgb.get_mut(channel) {
            *slot = u8::try_from(duty).unwrap_or(u8::MAX);
        }
    }

    fn update(&mut self) {
        let bytes = self.grb_bytes();
        self.writer.write(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::driver::{DriverFamily, DriverInterface};

    struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

    impl PixelWriter for Capture {
        fn write(&mut self, grb: &[u8]) {
            self.0.lock().unwrap().push(grb.to_vec());
        }
    }

    #[test]
    fn strip_sends_green_red_blue_per_pixel() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let strip = PixelStrip::new(Capture(frames.clone()), 2);
        let mut driver = DriverInterface::new(DriverFamily::Ws2812, 2, Some(Box::new(strip)));

        driver.set_all(&[65_535, 0, 32_768]);

        assert_eq!(*frames.lock().unwrap(), vec![vec![0, 255, 128, 0, 255, 128]]);
    }

    #[test]
    fn out_of_range_writes_are_ignored() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let mut strip = PixelStrip::new(Capture(frames.clone()), 1);

        strip.set_channel(1, 0, 10);
        strip.set_channel(0, 3, 10);
        strip.set_channel(0, 2, 300);
        strip.update();

        assert_eq!(*frames.lock().unwrap(), vec![vec![0, 0, 255]]);
    }
}

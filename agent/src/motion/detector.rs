use surveil_common::config::MotionConfig;
use surveil_common::frame::{CapturedFrame, FrameError, FrameSample};
use tracing::debug;

/// Fraction of pixels whose RGB channel-sum difference exceeds `pixel_threshold`.
///
/// Returns `None` when the two samples do not share dimensions.
pub fn magnitude(previous: &FrameSample, current: &FrameSample, pixel_threshold: u32) -> Option<f64> {
    if !previous.same_dimensions(current) {
        return None;
    }
    let total = current.pixel_count();
    let changed = current
        .pixels()
        .zip(previous.pixels())
        .filter(|(cur, prev)| channel_sum_diff(cur, prev) > pixel_threshold)
        .count();
    Some(changed as f64 / total as f64)
}

fn channel_sum_diff(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.abs_diff(*y) as u32)
        .sum()
}

/// Decode and downscale `frame`, then compare it against `previous`.
///
/// The returned sample replaces `previous` for the next tick. The magnitude
/// is `None` on the first tick.
pub fn sample_and_evaluate(
    frame: &CapturedFrame,
    previous: Option<&FrameSample>,
    sample_width: u32,
    pixel_threshold: u32,
) -> Result<(FrameSample, Option<f64>), FrameError> {
    let sample = frame.sample(sample_width)?;
    let result = previous.and_then(|prev| magnitude(prev, &sample, pixel_threshold));
    Ok((sample, result))
}

/// Frame differencer holding the sample retained from the previous tick.
pub struct MotionDetector {
    previous: Option<FrameSample>,
    sample_width: u32,
    pixel_threshold: u32,
}

impl MotionDetector {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            previous: None,
            sample_width: config.sample_width,
            pixel_threshold: config.pixel_threshold,
        }
    }

    /// Sample `frame` and compare it with the previous tick. The new sample
    /// becomes the baseline regardless of the outcome.
    ///
    /// A frame that fails to decode leaves the baseline untouched.
    pub fn tick(&mut self, frame: &CapturedFrame) -> Result<Option<f64>, FrameError> {
        let (sample, result) = sample_and_evaluate(
            frame,
            self.previous.as_ref(),
            self.sample_width,
            self.pixel_threshold,
        )?;
        match (&self.previous, result) {
            (None, _) => debug!(seq = frame.seq, "first sample, no baseline yet"),
            (Some(prev), None) => debug!(
                prev_width = prev.width(),
                prev_height = prev.height(),
                width = sample.width(),
                height = sample.height(),
                "sample dimensions changed, skipping comparison"
            ),
            (Some(_), Some(_)) => {}
        }
        self.previous = Some(sample);
        Ok(result)
    }

    #[cfg(test)]
    pub fn previous(&self) -> Option<&FrameSample> {
        self.previous.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> FrameSample {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        FrameSample::from_rgb(width, height, data).unwrap()
    }

    fn jpeg_frame(width: u32, height: u32, rgb: [u8; 3], seq: u64) -> CapturedFrame {
        use image::{DynamicImage, Rgb, RgbImage};
        use std::io::Cursor;

        let img = RgbImage::from_pixel(width, height, Rgb(rgb));
        let mut jpeg = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut jpeg, image::ImageFormat::Jpeg)
            .unwrap();
        CapturedFrame::new(jpeg.into_inner(), 0, seq)
    }

    fn detector() -> MotionDetector {
        MotionDetector::new(&MotionConfig::default())
    }

    #[test]
    fn identical_frames_have_zero_magnitude() {
        let a = solid(16, 12, [10, 200, 30]);
        assert_eq!(magnitude(&a, &a.clone(), 60), Some(0.0));
    }

    #[test]
    fn every_pixel_changed_is_full_magnitude() {
        let a = solid(16, 12, [0, 0, 0]);
        let b = solid(16, 12, [30, 30, 1]); // sum 61
        assert_eq!(magnitude(&a, &b, 60), Some(1.0));
    }

    #[test]
    fn threshold_is_strict() {
        let a = solid(4, 4, [0, 0, 0]);
        let b = solid(4, 4, [20, 20, 20]); // sum exactly 60
        assert_eq!(magnitude(&a, &b, 60), Some(0.0));
    }

    #[test]
    fn differences_count_in_both_directions() {
        let a = solid(4, 4, [255, 255, 255]);
        let b = solid(4, 4, [0, 0, 0]);
        assert_eq!(magnitude(&a, &b, 60), Some(1.0));
        assert_eq!(magnitude(&b, &a, 60), Some(1.0));
    }

    #[test]
    fn partial_change_is_fraction_of_pixels() {
        let a = solid(4, 4, [0, 0, 0]);
        let mut data = vec![0u8; 4 * 4 * 3];
        // Change 4 of 16 pixels.
        for px in 0..4 {
            data[px * 3] = 255;
        }
        let b = FrameSample::from_rgb(4, 4, data).unwrap();
        assert_eq!(magnitude(&a, &b, 60), Some(0.25));
    }

    #[test]
    fn magnitude_stays_in_unit_interval() {
        let mut seed: u32 = 0x1234_5678;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed & 0xFF) as u8
        };
        for _ in 0..20 {
            let a: Vec<u8> = (0..8 * 6 * 3).map(|_| next()).collect();
            let b: Vec<u8> = (0..8 * 6 * 3).map(|_| next()).collect();
            let a = FrameSample::from_rgb(8, 6, a).unwrap();
            let b = FrameSample::from_rgb(8, 6, b).unwrap();
            let m = magnitude(&a, &b, 60).unwrap();
            assert!((0.0..=1.0).contains(&m), "magnitude {m} out of range");
        }
    }

    #[test]
    fn dimension_mismatch_yields_none() {
        let a = solid(4, 4, [0, 0, 0]);
        let b = solid(4, 3, [255, 255, 255]);
        assert_eq!(magnitude(&a, &b, 60), None);
    }

    #[test]
    fn first_tick_has_no_magnitude_but_is_retained() {
        let mut d = detector();
        assert_eq!(d.tick(&jpeg_frame(64, 48, [1, 2, 3], 0)).unwrap(), None);
        let kept = d.previous().unwrap();
        assert_eq!((kept.width(), kept.height()), (160, 120));
    }

    #[test]
    fn baseline_replaced_every_tick() {
        let mut d = detector();
        let black = jpeg_frame(64, 48, [0, 0, 0], 0);
        let white = jpeg_frame(64, 48, [255, 255, 255], 1);

        d.tick(&black).unwrap();
        assert_eq!(d.tick(&white).unwrap(), Some(1.0));
        // Compared against the white frame, not the first black one.
        assert_eq!(d.tick(&white).unwrap(), Some(0.0));
    }

    #[test]
    fn baseline_replaced_after_dimension_change() {
        let mut d = detector();
        d.tick(&jpeg_frame(64, 48, [0, 0, 0], 0)).unwrap();
        // 16:9 source gives a 160x90 sample instead of 160x120.
        assert_eq!(d.tick(&jpeg_frame(64, 36, [0, 0, 0], 1)).unwrap(), None);
        assert_eq!(d.previous().unwrap().height(), 90);
    }

    #[test]
    fn undecodable_frame_keeps_baseline() {
        let mut d = detector();
        d.tick(&jpeg_frame(64, 48, [0, 0, 0], 0)).unwrap();
        assert!(d.tick(&CapturedFrame::new(vec![1, 2, 3], 0, 1)).is_err());
        assert_eq!(d.previous().unwrap().height(), 120);
    }

    #[test]
    fn sample_and_evaluate_without_previous() {
        let frame = jpeg_frame(64, 48, [90, 90, 90], 0);

        let (sample, m) = sample_and_evaluate(&frame, None, 160, 60).unwrap();
        assert_eq!(sample.width(), 160);
        assert_eq!(sample.height(), 120);
        assert_eq!(m, None);

        let (_, m) = sample_and_evaluate(&frame, Some(&sample), 160, 60).unwrap();
        assert_eq!(m, Some(0.0));
    }
}

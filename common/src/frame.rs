use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;

/// A JPEG frame as delivered by the camera, with capture metadata.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub jpeg: Bytes,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl CapturedFrame {
    pub fn new(jpeg: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            jpeg: jpeg.into(),
            captured_at_ms,
            seq,
        }
    }

    /// Decode the JPEG and downscale it to a motion sample `width` pixels wide.
    pub fn sample(&self, width: u32) -> Result<FrameSample, FrameError> {
        let img = ImageReader::new(Cursor::new(&self.jpeg[..]))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        FrameSample::from_image(&img, width)
    }
}

/// Downscaled RGB raster compared between consecutive sampling ticks.
///
/// Pixels are stored row-major, three bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

pub const CHANNELS: usize = 3;

impl FrameSample {
    pub fn from_rgb(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * CHANNELS;
        if width == 0 || height == 0 || rgb.len() != expected {
            return Err(FrameError::BadRaster {
                width,
                height,
                got: rgb.len(),
            });
        }
        Ok(Self { width, height, rgb })
    }

    /// Resize `img` to `width` x `sample_height(..)` with nearest-neighbour filtering.
    pub fn from_image(img: &DynamicImage, width: u32) -> Result<Self, FrameError> {
        let height = sample_height(width, img.width(), img.height())?;
        let rgb = img
            .resize_exact(width, height, FilterType::Nearest)
            .to_rgb8()
            .into_raw();
        Self::from_rgb(width, height, rgb)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn same_dimensions(&self, other: &FrameSample) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Iterate over `[r, g, b]` pixels.
    pub fn pixels(&self) -> impl Iterator<Item = &[u8]> {
        self.rgb.chunks_exact(CHANNELS)
    }
}

/// Height that keeps the source aspect ratio at the given sample width.
/// Never returns less than one row.
pub fn sample_height(width: u32, source_width: u32, source_height: u32) -> Result<u32, FrameError> {
    if source_width == 0 || source_height == 0 {
        return Err(FrameError::EmptySource {
            width: source_width,
            height: source_height,
        });
    }
    let h = (width as f64 * source_height as f64 / source_width as f64).round();
    Ok((h as u32).max(1))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("source frame has no pixels ({width}x{height})")]
    EmptySource { width: u32, height: u32 },
    #[error("raster size mismatch for {width}x{height}: got {got} bytes")]
    BadRaster { width: u32, height: u32, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encode_jpeg(img: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn height_follows_aspect_ratio() {
        assert_eq!(sample_height(160, 640, 480).unwrap(), 120);
        assert_eq!(sample_height(160, 1920, 1080).unwrap(), 90);
        // 160 * 500 / 333 = 240.24
        assert_eq!(sample_height(160, 333, 500).unwrap(), 240);
    }

    #[test]
    fn height_is_at_least_one_row() {
        assert_eq!(sample_height(160, 10_000, 1).unwrap(), 1);
    }

    #[test]
    fn empty_source_rejected() {
        assert!(matches!(
            sample_height(160, 0, 480),
            Err(FrameError::EmptySource { .. })
        ));
    }

    #[test]
    fn raster_size_checked() {
        assert!(FrameSample::from_rgb(2, 2, vec![0; 12]).is_ok());
        assert!(FrameSample::from_rgb(2, 2, vec![0; 11]).is_err());
        assert!(FrameSample::from_rgb(0, 2, vec![]).is_err());
    }

    #[test]
    fn jpeg_frame_is_downscaled() {
        let img = RgbImage::from_pixel(320, 240, Rgb([200, 10, 10]));
        let frame = CapturedFrame::new(encode_jpeg(&img), 1_700_000_000_000, 1);
        let sample = frame.sample(160).unwrap();
        assert_eq!(sample.width(), 160);
        assert_eq!(sample.height(), 120);
        assert_eq!(sample.pixels().count(), 160 * 120);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let frame = CapturedFrame::new(vec![0x00, 0x01, 0x02], 0, 0);
        assert!(matches!(frame.sample(160), Err(FrameError::Decode(_))));
    }
}

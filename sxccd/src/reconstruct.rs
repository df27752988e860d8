/*!
Turns the flat sample stream of a readout into a row-major image.

Most sensors deliver samples in raster order. The MX25C main sensor reads out
two rows at a time through a window that is twice as wide and half as tall as
the one the caller asked for; its samples arrive in 2x2 tile order and are put
back in place here.
*/

use crate::error::{Result, SxError};
use crate::protocol::{ReadWindow, SampleArray};
use tracing::{debug, error};

/// Model byte of the MX25C
pub const MX25C_MODEL: u16 = 0x59;

/// Sample ordering of a sensor readout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorLayout {
    /// One sample per pixel in raster order
    Progressive,
    /// MX25C main sensor: doubled-width/halved-height window, 2x2 tile order
    InterlacedColor,
}

impl SensorLayout {
    pub fn for_model(model: u16, index: u16) -> Self {
        if model == MX25C_MODEL && index == 0 {
            Self::InterlacedColor
        } else {
            Self::Progressive
        }
    }
}

/// Reconstructed image, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    width: usize,
    height: usize,
    bits_per_pixel: u8,
    pixels: Vec<u16>,
}

impl ImageBuffer {
    pub fn new(width: usize, height: usize, bits_per_pixel: u8) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            pixels: vec![0; width * height],
        }
    }

    /// Wrap existing row-major pixels
    pub fn from_pixels(width: usize, height: usize, bits_per_pixel: u8, pixels: Vec<u16>) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(SxError::argument(format!(
                "{} pixels do not fill a {}x{} image",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            bits_per_pixel,
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.bits_per_pixel
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u16> {
        if x < self.width && y < self.height {
            Some(self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    pub fn row(&self, y: usize) -> Option<&[u16]> {
        if y < self.height {
            Some(&self.pixels[y * self.width..(y + 1) * self.width])
        } else {
            None
        }
    }

    fn set(&mut self, x: usize, y: usize, value: u16) {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = value;
        }
    }
}

struct SampleCursor<'a> {
    samples: &'a SampleArray,
    next: usize,
}

impl SampleCursor<'_> {
    fn take(&mut self) -> Result<u16> {
        match self.samples.get(self.next) {
            Some(value) => {
                self.next += 1;
                // bit depth is checked before any sample is taken
                Ok(value as u16)
            }
            None => Err(undersized(self.samples.len(), self.next + 1)),
        }
    }
}

fn undersized(got: usize, needed: usize) -> SxError {
    error!("Pixel stream too short: got {} samples, needed {}", got, needed);
    SxError::protocol(format!("pixel stream has {} samples, needed {}", got, needed))
}

/// Rebuild the image for `window`, the window as sent to the hardware
pub fn reconstruct(samples: &SampleArray, window: &ReadWindow, layout: SensorLayout) -> Result<ImageBuffer> {
    let bits = samples.bits_per_pixel();
    if bits != 8 && bits != 16 {
        return Err(SxError::UnsupportedBitDepth(bits));
    }

    let expected = window.pixel_count();
    if samples.len() < expected {
        return Err(undersized(samples.len(), expected));
    }

    let mut cursor = SampleCursor { samples, next: 0 };
    let image = match layout {
        SensorLayout::Progressive => {
            let mut image = ImageBuffer::new(window.binned_width(), window.binned_height(), bits);
            for pixel in image.pixels.iter_mut() {
                *pixel = cursor.take()?;
            }
            image
        }
        SensorLayout::InterlacedColor => {
            let mut image = ImageBuffer::new(window.binned_width() / 2, window.binned_height() * 2, bits);
            fill_tiles(&mut image, &mut cursor)?;
            image
        }
    };

    debug!(
        "reconstructed {}x{} image from {} of {} samples ({:?})",
        image.width,
        image.height,
        cursor.next,
        samples.len(),
        layout
    );
    Ok(image)
}

fn fill_tiles(image: &mut ImageBuffer, cursor: &mut SampleCursor<'_>) -> Result<()> {
    let (w, h) = (image.width, image.height);
    for y in (0..h).step_by(2) {
        for x in (0..w).step_by(2) {
            image.set(x, y, cursor.take()?);
            if y + 1 < h {
                image.set(x, y + 1, cursor.take()?);
                if x + 1 < w {
                    image.set(x + 1, y + 1, cursor.take()?);
                }
                // consumed even when x + 1 is past the edge; set() drops it
                image.set(x + 1, y, cursor.take()?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn window(width: u16, height: u16, x_bin: u8, y_bin: u8) -> ReadWindow {
        ReadWindow {
            x_offset: 0,
            y_offset: 0,
            width,
            height,
            x_bin,
            y_bin,
        }
    }

    fn ramp(n: u16) -> SampleArray {
        SampleArray::U16((0..n).collect())
    }

    #[test]
    fn test_progressive_raster_order() {
        let image = reconstruct(&ramp(12), &window(4, 3, 1, 1), SensorLayout::Progressive).unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        for y in 0..3 {
            for x in 0..4 {
                assert_eq!(image.get(x, y), Some((y * 4 + x) as u16));
            }
        }
    }

    #[test]
    fn test_progressive_binned() {
        let samples = SampleArray::U8((0..6).collect());
        let image = reconstruct(&samples, &window(6, 4, 2, 2), SensorLayout::Progressive).unwrap();
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(image.bits_per_pixel(), 8);
        assert_eq!(image.row(1), Some(&[3u16, 4, 5][..]));
    }

    #[test]
    fn test_interlaced_tile_order() {
        // caller asked for 4x4, the hardware saw 8x2
        let image = reconstruct(&ramp(16), &window(8, 2, 1, 1), SensorLayout::InterlacedColor).unwrap();
        assert_eq!((image.width(), image.height()), (4, 4));
        assert_eq!(image.row(0), Some(&[0u16, 3, 4, 7][..]));
        assert_eq!(image.row(1), Some(&[1u16, 2, 5, 6][..]));
        assert_eq!(image.row(2), Some(&[8u16, 11, 12, 15][..]));
        assert_eq!(image.row(3), Some(&[9u16, 10, 13, 14][..]));
    }

    #[test]
    fn test_interlaced_odd_width_discards_edge_sample() {
        let image = reconstruct(&ramp(14), &window(6, 2, 1, 1), SensorLayout::InterlacedColor).unwrap();
        assert_eq!((image.width(), image.height()), (3, 4));
        assert_eq!(image.row(0), Some(&[0u16, 3, 4][..]));
        assert_eq!(image.row(1), Some(&[1u16, 2, 5][..]));
        assert_eq!(image.row(2), Some(&[7u16, 10, 11][..]));
        assert_eq!(image.row(3), Some(&[8u16, 9, 12][..]));
    }

    #[test]
    fn test_undersized_stream_rejected() {
        let err = reconstruct(&ramp(11), &window(4, 3, 1, 1), SensorLayout::Progressive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_32_bit_samples_unsupported() {
        let samples = SampleArray::U32(vec![0; 4]);
        let err = reconstruct(&samples, &window(2, 2, 1, 1), SensorLayout::Progressive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Range);
        assert!(matches!(err, SxError::UnsupportedBitDepth(32)));
    }

    #[test]
    fn test_layout_selection() {
        assert_eq!(SensorLayout::for_model(MX25C_MODEL, 0), SensorLayout::InterlacedColor);
        assert_eq!(SensorLayout::for_model(MX25C_MODEL, 1), SensorLayout::Progressive);
        assert_eq!(SensorLayout::for_model(0x47, 0), SensorLayout::Progressive);
    }
}

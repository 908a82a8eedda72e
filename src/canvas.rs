// ============================================================================
// Raster buffers and the drawable canvas surface
// ============================================================================

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Placeholder surface size used when no image is available.
pub const PLACEHOLDER_WIDTH: u32 = 360;
pub const PLACEHOLDER_HEIGHT: u32 = 180;
/// Neutral editor-dark background (#252526).
pub const PLACEHOLDER_BACKGROUND: [u8; 4] = [0x25, 0x25, 0x26, 0xFF];
pub const PLACEHOLDER_TEXT: &str = "Upload an image to apply animation";
const PLACEHOLDER_FONT_SIZE: f32 = 16.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterError {
    /// Byte length does not equal `width * height * 4`.
    LengthMismatch { expected: usize, actual: usize },
    /// Dimensions overflow the addressable byte length.
    TooLarge { width: u32, height: u32 },
}

impl std::fmt::Display for RasterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RasterError::LengthMismatch { expected, actual } => write!(
                f,
                "pixel buffer holds {} bytes, expected {}",
                actual, expected
            ),
            RasterError::TooLarge { width, height } => {
                write!(f, "raster dimensions {}x{} are too large", width, height)
            }
        }
    }
}

impl std::error::Error for RasterError {}

/// Width, height and a flat RGBA byte array (4 bytes/pixel, row-major).
///
/// `data.len() == width * height * 4` always holds; every constructor checks it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RasterBuffer {
    /// Fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0, 0, 0, 0])
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * 4);
        for _ in 0..count {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, RasterError> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(RasterError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_rgba_image(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Alpha byte of the pixel at linear index `idx`, `None` past the end.
    pub fn alpha_at(&self, idx: usize) -> Option<u8> {
        self.data.get(idx.checked_mul(4)?.checked_add(3)?).copied()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.data[i..i + 4].copy_from_slice(&rgba);
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize, RasterError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or(RasterError::TooLarge { width, height })
}

// ============================================================================
// Canvas: the visible 2D surface
// ============================================================================

/// A 2D drawable surface with `putImageData`-style whole-buffer writes.
///
/// Dimensions are fixed at creation; writes are clipped, never scaled.
#[derive(Clone, Debug)]
pub struct Canvas {
    buffer: RasterBuffer,
    draw_count: u64,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buffer: RasterBuffer::new(width, height),
            draw_count: 0,
        }
    }

    /// Fixed-size neutral canvas with centred instructional text.
    pub fn placeholder() -> Self {
        let mut buffer =
            RasterBuffer::filled(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT, PLACEHOLDER_BACKGROUND);
        crate::text::draw_text_centered(
            &mut buffer,
            PLACEHOLDER_TEXT,
            PLACEHOLDER_FONT_SIZE,
            [255, 255, 255, 255],
        );
        Self {
            buffer,
            draw_count: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Number of `put_image_data` calls since creation.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn snapshot(&self) -> &RasterBuffer {
        &self.buffer
    }

    /// Copy `frame` onto the canvas with its top-left corner at `(dx, dy)`.
    /// Pixels falling outside the canvas are discarded.
    pub fn put_image_data(&mut self, frame: &RasterBuffer, dx: i64, dy: i64) {
        self.draw_count += 1;

        let cw = self.buffer.width() as i64;
        let ch = self.buffer.height() as i64;
        let fw = frame.width() as i64;
        let fh = frame.height() as i64;

        let x0 = dx.max(0);
        let x1 = (dx + fw).min(cw);
        if x0 >= x1 {
            return;
        }
        let row_bytes = ((x1 - x0) * 4) as usize;

        for y in dy.max(0)..(dy + fh).min(ch) {
            let src_y = y - dy;
            let src = ((src_y * fw + (x0 - dx)) * 4) as usize;
            let dst = ((y * cw + x0) * 4) as usize;
            self.buffer.data_mut()[dst..dst + row_bytes]
                .copy_from_slice(&frame.data()[src..src + row_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_checks_length() {
        assert!(RasterBuffer::from_raw(2, 2, vec![0; 16]).is_ok());
        assert_eq!(
            RasterBuffer::from_raw(2, 2, vec![0; 15]),
            Err(RasterError::LengthMismatch {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn alpha_lookup_is_bounds_checked() {
        let mut raster = RasterBuffer::new(2, 1);
        raster.put_pixel(1, 0, [0, 0, 0, 77]);
        assert_eq!(raster.alpha_at(0), Some(0));
        assert_eq!(raster.alpha_at(1), Some(77));
        assert_eq!(raster.alpha_at(2), None);
        assert_eq!(raster.alpha_at(usize::MAX), None);
    }

    #[test]
    fn put_image_data_at_origin_copies_everything() {
        let mut canvas = Canvas::new(3, 2);
        let frame = RasterBuffer::filled(3, 2, [1, 2, 3, 4]);
        canvas.put_image_data(&frame, 0, 0);
        assert_eq!(canvas.snapshot(), &frame);
        assert_eq!(canvas.draw_count(), 1);
    }

    #[test]
    fn put_image_data_clips_oversized_frames() {
        let mut canvas = Canvas::new(2, 2);
        let mut frame = RasterBuffer::new(4, 4);
        frame.put_pixel(1, 1, [9, 9, 9, 255]);
        frame.put_pixel(3, 3, [7, 7, 7, 255]);
        canvas.put_image_data(&frame, 0, 0);
        assert_eq!(canvas.snapshot().pixel(1, 1), Some([9, 9, 9, 255]));
        assert_eq!(canvas.snapshot().data().len(), 16);
    }

    #[test]
    fn put_image_data_with_offset() {
        let mut canvas = Canvas::new(3, 3);
        let frame = RasterBuffer::filled(2, 2, [5, 5, 5, 255]);
        canvas.put_image_data(&frame, 2, 2);
        assert_eq!(canvas.snapshot().pixel(2, 2), Some([5, 5, 5, 255]));
        assert_eq!(canvas.snapshot().pixel(1, 1), Some([0, 0, 0, 0]));
    }

    #[test]
    fn placeholder_has_fixed_size_and_background() {
        let canvas = Canvas::placeholder();
        assert_eq!(canvas.width(), PLACEHOLDER_WIDTH);
        assert_eq!(canvas.height(), PLACEHOLDER_HEIGHT);
        assert_eq!(canvas.snapshot().pixel(0, 0), Some(PLACEHOLDER_BACKGROUND));
    }
}

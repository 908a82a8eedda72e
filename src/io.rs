use image::codecs::png::PngEncoder;
use image::{ImageEncoder, RgbaImage};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::canvas::RasterBuffer;

/// Maximum accepted image dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted or pasted images.
pub const MAX_IMAGE_DIMENSION: u32 = 16384;

/// Side length of the built-in default sprite.
pub const DEFAULT_IMAGE_SIZE: u32 = 128;

// ============================================================================
// ERRORS
// ============================================================================

/// Error type for image ingestion
#[derive(Debug)]
pub enum DecodeError {
    Io(std::io::Error),
    Image(String),
    Clipboard(String),
    TooLarge { width: u32, height: u32 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Io(e) => write!(f, "I/O error: {}", e),
            DecodeError::Image(e) => write!(f, "Could not decode image: {}", e),
            DecodeError::Clipboard(e) => write!(f, "Clipboard: {}", e),
            DecodeError::TooLarge { width, height } => write!(
                f,
                "Image {}x{} exceeds the {}px limit",
                width, height, MAX_IMAGE_DIMENSION
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e)
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(e: image::ImageError) -> Self {
        DecodeError::Image(e.to_string())
    }
}

/// Error type for writing images and animations
#[derive(Debug)]
pub enum ExportError {
    Io(std::io::Error),
    Encode(String),
    NoFrames,
    TooLarge { width: u32, height: u32 },
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Io(e) => write!(f, "I/O error: {}", e),
            ExportError::Encode(e) => write!(f, "Encoding error: {}", e),
            ExportError::NoFrames => write!(f, "No frames to encode"),
            ExportError::TooLarge { width, height } => {
                write!(f, "Frame size {}x{} is too large for this format", width, height)
            }
        }
    }
}

impl std::error::Error for ExportError {}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

impl From<image::ImageError> for ExportError {
    fn from(e: image::ImageError) -> Self {
        ExportError::Encode(e.to_string())
    }
}

// ============================================================================
// DECODING
// ============================================================================

fn check_dimensions(width: u32, height: u32) -> Result<(), DecodeError> {
    if width == 0 || height == 0 || width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(DecodeError::TooLarge { width, height });
    }
    Ok(())
}

fn from_rgba(img: RgbaImage) -> Result<RasterBuffer, DecodeError> {
    check_dimensions(img.width(), img.height())?;
    Ok(RasterBuffer::from_rgba_image(img))
}

/// Decode an encoded image (PNG, JPEG, WEBP, BMP, …) held in memory.
pub fn decode_bytes(bytes: &[u8]) -> Result<RasterBuffer, DecodeError> {
    let img = image::load_from_memory(bytes)?.to_rgba8();
    from_rgba(img)
}

/// Decode an image file from disk.
pub fn decode_path(path: &Path) -> Result<RasterBuffer, DecodeError> {
    let img = image::open(path)?.to_rgba8();
    from_rgba(img)
}

/// Read an image from the system clipboard.
/// Raw image data is preferred; clipboard text naming an image file is the fallback.
pub fn paste_from_clipboard() -> Result<RasterBuffer, DecodeError> {
    let mut clip = arboard::Clipboard::new().map_err(|e| DecodeError::Clipboard(e.to_string()))?;

    if let Ok(data) = clip.get_image() {
        let width = data.width as u32;
        let height = data.height as u32;
        check_dimensions(width, height)?;
        return RasterBuffer::from_raw(width, height, data.bytes.into_owned())
            .map_err(|e| DecodeError::Clipboard(e.to_string()));
    }

    if let Ok(text) = clip.get_text() {
        let path = Path::new(text.trim());
        if path.is_file() {
            return decode_path(path);
        }
    }

    Err(DecodeError::Clipboard("no image on the clipboard".to_string()))
}

/// Built-in sprite used when no image was supplied: a shaded disc on a
/// transparent background.
pub fn default_image() -> RasterBuffer {
    let size = DEFAULT_IMAGE_SIZE;
    let mut raster = RasterBuffer::new(size, size);
    let c = (size as f32 - 1.0) * 0.5;
    let radius = size as f32 * 0.42;

    for y in 0..size {
        for x in 0..size {
            let dx = x as f32 - c;
            let dy = y as f32 - c;
            let d = (dx * dx + dy * dy).sqrt();
            if d > radius + 1.0 {
                continue;
            }
            // 1px anti-aliased rim
            let coverage = (radius + 1.0 - d).clamp(0.0, 1.0);
            let t = (d / radius).min(1.0);
            let angle = dy.atan2(dx);
            let r = 255.0 * (1.0 - 0.6 * t);
            let g = 140.0 + 80.0 * angle.sin().abs() * (1.0 - t);
            let b = 60.0 + 150.0 * t;
            raster.put_pixel(
                x,
                y,
                [r as u8, g as u8, b as u8, (coverage * 255.0).round() as u8],
            );
        }
    }
    raster
}

// ============================================================================
// ENCODING
// ============================================================================

/// Write a raster as a PNG file.
pub fn save_png(raster: &RasterBuffer, path: &Path) -> Result<(), ExportError> {
    let file = File::create(path)?;
    PngEncoder::new(BufWriter::new(file)).write_image(
        raster.data(),
        raster.width(),
        raster.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(())
}

// ============================================================================
// CONTACT SHEET
// ============================================================================

const SHEET_PADDING: u32 = 8;
const SHEET_LABEL_HEIGHT: u32 = 20;
const SHEET_LABEL_SIZE: f32 = 13.0;
const SHEET_BACKGROUND: [u8; 4] = [0x1E, 0x1E, 0x1E, 0xFF];
const SHEET_EMPTY_CELL: [u8; 4] = [0x33, 0x33, 0x33, 0xFF];

/// Lay `frames` out in a labelled grid ("Frame 1", "Frame 2", …).
/// Missing frames leave an empty cell. Returns `None` when there is nothing
/// to size the cells from.
pub fn compose_contact_sheet(frames: &[Option<RasterBuffer>], columns: u32) -> Option<RasterBuffer> {
    let cell_w = frames.iter().flatten().map(|f| f.width()).max()?;
    let cell_h = frames.iter().flatten().map(|f| f.height()).max()?;
    let columns = columns.clamp(1, frames.len().max(1) as u32);
    let rows = (frames.len() as u32).div_ceil(columns);

    let tile_w = cell_w + SHEET_PADDING;
    let tile_h = cell_h + SHEET_LABEL_HEIGHT + SHEET_PADDING;

    // Render every tile in parallel, then blit them serially.
    let tiles: Vec<RasterBuffer> = frames
        .par_iter()
        .enumerate()
        .map(|(i, frame)| {
            let mut tile = RasterBuffer::filled(cell_w, cell_h + SHEET_LABEL_HEIGHT, SHEET_BACKGROUND);
            match frame {
                Some(f) => blit(&mut tile, f, 0, 0),
                None => {
                    let empty = RasterBuffer::filled(cell_w, cell_h, SHEET_EMPTY_CELL);
                    blit(&mut tile, &empty, 0, 0);
                }
            }
            if let Some(font) = crate::text::ui_font() {
                let label = format!("Frame {}", i + 1);
                crate::text::draw_line(
                    &mut tile,
                    font,
                    &label,
                    SHEET_LABEL_SIZE,
                    2.0,
                    (cell_h + SHEET_LABEL_HEIGHT) as f32 - 5.0,
                    [220, 220, 220, 255],
                );
            }
            tile
        })
        .collect();

    let mut sheet = RasterBuffer::filled(
        columns * tile_w + SHEET_PADDING,
        rows * tile_h + SHEET_PADDING,
        SHEET_BACKGROUND,
    );
    for (i, tile) in tiles.iter().enumerate() {
        let col = i as u32 % columns;
        let row = i as u32 / columns;
        blit(
            &mut sheet,
            tile,
            SHEET_PADDING + col * tile_w,
            SHEET_PADDING + row * tile_h,
        );
    }
    Some(sheet)
}

/// Opaque copy of `src` into `dst` at `(x, y)`, clipped to `dst`.
fn blit(dst: &mut RasterBuffer, src: &RasterBuffer, x: u32, y: u32) {
    let (dw, dh) = dst.dimensions();
    if x >= dw || y >= dh {
        return;
    }
    let copy_w = src.width().min(dw - x) as usize;
    let rows = src.height().min(dh - y);
    let src_stride = src.width() as usize * 4;
    let dst_stride = dw as usize * 4;
    for row in 0..rows as usize {
        let s = row * src_stride;
        let d = (y as usize + row) * dst_stride + x as usize * 4;
        dst.data_mut()[d..d + copy_w * 4].copy_from_slice(&src.data()[s..s + copy_w * 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pixelplay_io_{}_{}", std::process::id(), name))
    }

    #[test]
    fn png_round_trip_through_disk() {
        let mut raster = RasterBuffer::new(3, 2);
        raster.put_pixel(2, 1, [1, 2, 3, 200]);
        let path = temp_path("roundtrip.png");
        save_png(&raster, &path).unwrap();
        let back = decode_path(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(back, raster);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(decode_path(Path::new("/nonexistent/pixelplay/nothing.png")).is_err());
    }

    #[test]
    fn default_image_has_transparent_corners_and_opaque_centre() {
        let img = default_image();
        assert_eq!(img.dimensions(), (DEFAULT_IMAGE_SIZE, DEFAULT_IMAGE_SIZE));
        assert_eq!(img.alpha_at(0), Some(0));
        let c = DEFAULT_IMAGE_SIZE / 2;
        assert_eq!(img.pixel(c, c).map(|p| p[3]), Some(255));
    }

    #[test]
    fn contact_sheet_sizes_grid_from_largest_frame() {
        let frames = vec![
            Some(RasterBuffer::filled(10, 10, [255, 0, 0, 255])),
            None,
            Some(RasterBuffer::filled(10, 10, [0, 255, 0, 255])),
        ];
        let sheet = compose_contact_sheet(&frames, 2).unwrap();
        let tile_w = 10 + SHEET_PADDING;
        let tile_h = 10 + SHEET_LABEL_HEIGHT + SHEET_PADDING;
        assert_eq!(sheet.width(), 2 * tile_w + SHEET_PADDING);
        assert_eq!(sheet.height(), 2 * tile_h + SHEET_PADDING);
        assert_eq!(
            sheet.pixel(SHEET_PADDING, SHEET_PADDING),
            Some([255, 0, 0, 255])
        );
        assert_eq!(
            sheet.pixel(SHEET_PADDING + tile_w, SHEET_PADDING),
            Some(SHEET_EMPTY_CELL)
        );
    }

    #[test]
    fn contact_sheet_without_frames_is_none() {
        assert!(compose_contact_sheet(&[None, None], 2).is_none());
    }
}

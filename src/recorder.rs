// ============================================================================
// Canvas recorder: captures rendered frames and exports GIF / APNG
// ============================================================================

use rayon::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::canvas::RasterBuffer;
use crate::io::ExportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnimationFormat {
    Gif,
    Apng,
}

impl AnimationFormat {
    /// Pick the format from a file extension (`.gif` or `.png`/`.apng`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "gif" => Some(AnimationFormat::Gif),
            "png" | "apng" => Some(AnimationFormat::Apng),
            _ => None,
        }
    }
}

/// Collects canvas snapshots up to a frame cap.
#[derive(Debug)]
pub struct Recorder {
    fps: f32,
    max_frames: usize,
    frames: Vec<RasterBuffer>,
    dropped: usize,
}

impl Recorder {
    pub fn new(fps: f32, max_frames: usize) -> Self {
        Self {
            fps: fps.clamp(1.0, 100.0),
            max_frames: max_frames.max(1),
            frames: Vec::new(),
            dropped: 0,
        }
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frames(&self) -> &[RasterBuffer] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames refused because the cap was reached.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Store a copy of `frame`. Returns `false` once the cap is reached.
    pub fn capture(&mut self, frame: &RasterBuffer) -> bool {
        if self.frames.len() >= self.max_frames {
            self.dropped += 1;
            return false;
        }
        self.frames.push(frame.clone());
        true
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.dropped = 0;
    }

    /// Write the captured frames to `path`, format chosen by extension.
    pub fn export(&self, path: &Path, max_colors: u16) -> Result<(), ExportError> {
        let format = AnimationFormat::from_path(path).ok_or_else(|| {
            ExportError::Encode(format!(
                "unsupported animation extension: {}",
                path.display()
            ))
        })?;
        match format {
            AnimationFormat::Gif => encode_animated_gif(&self.frames, self.fps, max_colors, path)?,
            AnimationFormat::Apng => encode_animated_png(&self.frames, self.fps, path)?,
        }
        crate::log_info!(
            "Exported {} frames to {} ({:?})",
            self.frames.len(),
            path.display(),
            format
        );
        Ok(())
    }
}

// ============================================================================
// ANIMATION ENCODING
// ============================================================================

/// Encode frames as a looping animated GIF with per-frame palettes.
/// Frames must share the first frame's dimensions; others are skipped.
pub fn encode_animated_gif(
    frames: &[RasterBuffer],
    fps: f32,
    max_colors: u16,
    path: &Path,
) -> Result<(), ExportError> {
    let first = frames.first().ok_or(ExportError::NoFrames)?;
    let (fw, fh) = first.dimensions();
    if fw > u16::MAX as u32 || fh > u16::MAX as u32 {
        return Err(ExportError::TooLarge {
            width: fw,
            height: fh,
        });
    }
    let (w, h) = (fw as u16, fh as u16);
    let delay_cs = ((100.0 / fps).round() as u16).max(1); // centiseconds
    let colors = (max_colors as usize).clamp(2, 256);

    // Palette quantization dominates; do it for all frames in parallel.
    let quantized: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = frames
        .par_iter()
        .filter(|f| f.dimensions() == (fw, fh))
        .map(|f| quantize_rgba(f, colors))
        .collect();

    let file = File::create(path)?;
    let mut encoder = gif::Encoder::new(BufWriter::new(file), w, h, &[])
        .map_err(|e| ExportError::Encode(format!("GIF encoder init error: {}", e)))?;
    encoder
        .set_repeat(gif::Repeat::Infinite)
        .map_err(|e| ExportError::Encode(format!("GIF set repeat error: {}", e)))?;

    for (palette, indices, transparent) in quantized {
        let frame = gif::Frame {
            width: w,
            height: h,
            delay: delay_cs,
            dispose: gif::DisposalMethod::Background,
            transparent: transparent.first().copied(),
            palette: Some(palette),
            buffer: std::borrow::Cow::Owned(indices),
            ..Default::default()
        };
        encoder
            .write_frame(&frame)
            .map_err(|e| ExportError::Encode(format!("GIF frame write error: {}", e)))?;
    }
    Ok(())
}

/// Encode frames as a looping animated PNG (APNG).
pub fn encode_animated_png(frames: &[RasterBuffer], fps: f32, path: &Path) -> Result<(), ExportError> {
    let first = frames.first().ok_or(ExportError::NoFrames)?;
    let (width, height) = first.dimensions();
    let usable: Vec<&RasterBuffer> = frames
        .iter()
        .filter(|f| f.dimensions() == (width, height))
        .collect();
    let delay_ms = (1000.0 / fps).round().clamp(1.0, 65535.0) as u16;

    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder
        .set_animated(usable.len() as u32, 0) // 0 = infinite loop
        .map_err(|e| ExportError::Encode(format!("APNG set_animated error: {}", e)))?;

    let mut writer = encoder
        .write_header()
        .map_err(|e| ExportError::Encode(format!("APNG header write error: {}", e)))?;

    for frame in usable {
        writer
            .set_frame_delay(delay_ms, 1000)
            .map_err(|e| ExportError::Encode(format!("APNG set frame delay error: {}", e)))?;
        writer
            .set_dispose_op(png::DisposeOp::Background)
            .map_err(|e| ExportError::Encode(format!("APNG set dispose op error: {}", e)))?;
        writer
            .write_image_data(frame.data())
            .map_err(|e| ExportError::Encode(format!("APNG frame write error: {}", e)))?;
    }

    writer
        .finish()
        .map_err(|e| ExportError::Encode(format!("APNG finish error: {}", e)))?;
    Ok(())
}

/// Quantize an RGBA frame to `[R,G,B,…]` palette plus indices.
/// Fully transparent pixels map to a reserved last palette slot, returned in
/// the third element when the frame has any.
fn quantize_rgba(frame: &RasterBuffer, max_colors: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let has_transparency = frame.data().chunks_exact(4).any(|p| p[3] == 0);
    let opaque_colors = if has_transparency { max_colors - 1 } else { max_colors };

    let nq = color_quant::NeuQuant::new(10, opaque_colors, frame.data());

    let mut palette = Vec::with_capacity(max_colors * 3);
    for i in 0..opaque_colors {
        match nq.lookup(i) {
            Some(color) => palette.extend_from_slice(&color[..3]),
            None => palette.extend_from_slice(&[0, 0, 0]),
        }
    }

    let transparent_index = opaque_colors as u8;
    if has_transparency {
        palette.extend_from_slice(&[0, 0, 0]);
    }

    let indices = frame
        .data()
        .chunks_exact(4)
        .map(|p| {
            if p[3] == 0 && has_transparency {
                transparent_index
            } else {
                nq.index_of(p) as u8
            }
        })
        .collect();

    let transparent = if has_transparency {
        vec![transparent_index]
    } else {
        Vec::new()
    };
    (palette, indices, transparent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pixelplay_rec_{}_{}", std::process::id(), name))
    }

    fn frames() -> Vec<RasterBuffer> {
        (0..3)
            .map(|i| RasterBuffer::filled(4, 4, [i * 80, 0, 255 - i * 80, 255]))
            .collect()
    }

    #[test]
    fn capture_respects_the_frame_cap() {
        let mut rec = Recorder::new(30.0, 2);
        for f in frames() {
            rec.capture(&f);
        }
        assert_eq!(rec.len(), 2);
        assert_eq!(rec.dropped(), 1);
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(AnimationFormat::from_path(Path::new("a.GIF")), Some(AnimationFormat::Gif));
        assert_eq!(AnimationFormat::from_path(Path::new("a.png")), Some(AnimationFormat::Apng));
        assert_eq!(AnimationFormat::from_path(Path::new("a.bmp")), None);
    }

    #[test]
    fn gif_export_writes_a_gif_header() {
        let mut rec = Recorder::new(30.0, 10);
        for f in frames() {
            rec.capture(&f);
        }
        let path = temp_path("anim.gif");
        rec.export(&path, 64).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(&bytes[..6], b"GIF89a");
    }

    #[test]
    fn apng_export_writes_an_animation_chunk() {
        let path = temp_path("anim.png");
        encode_animated_png(&frames(), 30.0, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(&bytes[1..4], b"PNG");
        assert!(bytes.windows(4).any(|w| w == b"acTL"));
    }

    #[test]
    fn empty_recording_cannot_be_exported() {
        let rec = Recorder::new(30.0, 10);
        assert!(matches!(
            rec.export(&temp_path("empty.gif"), 256),
            Err(ExportError::NoFrames)
        ));
    }

    #[test]
    fn transparent_pixels_get_a_reserved_index() {
        let mut f = RasterBuffer::filled(2, 1, [200, 10, 10, 255]);
        f.put_pixel(1, 0, [0, 0, 0, 0]);
        let (palette, indices, transparent) = quantize_rgba(&f, 16);
        assert_eq!(palette.len(), 16 * 3);
        assert_eq!(transparent, vec![15]);
        assert_eq!(indices[1], 15);
    }
}

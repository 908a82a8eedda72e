//! Minimal glyph rasterization for placeholder and preview labels.
//!
//! Fonts come from the system via `font-kit`; when none of the candidate
//! families resolve, drawing is skipped and the caller keeps a text-less
//! surface.

use ab_glyph::{Font, FontArc, GlyphId, ScaleFont, point};
use std::sync::OnceLock;

use crate::canvas::RasterBuffer;

/// Sans-serif families tried in order before falling back to the generic family.
const CANDIDATE_FAMILIES: &[&str] = &["Arial", "Helvetica", "DejaVu Sans", "Liberation Sans"];

static UI_FONT: OnceLock<Option<FontArc>> = OnceLock::new();

/// Shared UI font, loaded once per process.
pub fn ui_font() -> Option<&'static FontArc> {
    UI_FONT.get_or_init(load_ui_font).as_ref()
}

fn load_ui_font() -> Option<FontArc> {
    for family in CANDIDATE_FAMILIES {
        if let Some(font) = load_system_font(family) {
            return Some(font);
        }
    }
    let font = load_generic_sans();
    if font.is_none() {
        crate::log_warn!("No system sans-serif font found; text labels disabled");
    }
    font
}

/// Load a regular-weight font by family name from the system.
pub fn load_system_font(family: &str) -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    use font_kit::properties::Properties;
    use font_kit::source::SystemSource;

    let handle = SystemSource::new()
        .select_best_match(&[FamilyName::Title(family.to_string())], &Properties::new())
        .ok()?;
    font_from_handle(handle)
}

fn load_generic_sans() -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    use font_kit::properties::Properties;
    use font_kit::source::SystemSource;

    let handle = SystemSource::new()
        .select_best_match(&[FamilyName::SansSerif], &Properties::new())
        .ok()?;
    font_from_handle(handle)
}

fn font_from_handle(handle: font_kit::handle::Handle) -> Option<FontArc> {
    let font_data = handle.load().ok()?;
    let bytes = font_data.copy_font_data()?;
    FontArc::try_from_vec((*bytes).clone()).ok()
}

/// Lay out a single line of text starting at x=0 on the baseline.
/// Returns `(glyphs, total_width, ascent, descent)`.
pub fn layout_line(font: &FontArc, text: &str, font_size: f32) -> (Vec<(GlyphId, f32)>, f32, f32, f32) {
    let scaled = font.as_scaled(font_size);
    let mut glyphs = Vec::new();
    let mut cursor_x = 0.0f32;
    let mut last_glyph: Option<GlyphId> = None;

    for ch in text.chars() {
        let glyph_id = font.glyph_id(ch);
        if let Some(prev) = last_glyph {
            cursor_x += scaled.kern(prev, glyph_id);
        }
        glyphs.push((glyph_id, cursor_x));
        cursor_x += scaled.h_advance(glyph_id);
        last_glyph = Some(glyph_id);
    }

    (glyphs, cursor_x, scaled.ascent(), scaled.descent())
}

/// Draw `text` centred horizontally and vertically. Returns `false` when no
/// font is available and nothing was drawn.
pub fn draw_text_centered(target: &mut RasterBuffer, text: &str, font_size: f32, color: [u8; 4]) -> bool {
    let Some(font) = ui_font() else {
        return false;
    };
    let (_, width, ascent, descent) = layout_line(font, text, font_size);
    let origin_x = (target.width() as f32 - width) * 0.5;
    let baseline = (target.height() as f32 + ascent + descent) * 0.5;
    draw_line(target, font, text, font_size, origin_x, baseline, color);
    true
}

/// Draw `text` with its baseline starting at `(origin_x, baseline)`.
/// Coverage is alpha-blended over the existing pixels.
pub fn draw_line(
    target: &mut RasterBuffer,
    font: &FontArc,
    text: &str,
    font_size: f32,
    origin_x: f32,
    baseline: f32,
    color: [u8; 4],
) {
    let (glyphs, _, _, _) = layout_line(font, text, font_size);
    let (w, h) = target.dimensions();

    for (glyph_id, gx) in glyphs {
        let glyph = glyph_id.with_scale_and_position(font_size, point(origin_x + gx, baseline));
        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|px, py, cov| {
            let x = bounds.min.x as i64 + px as i64;
            let y = bounds.min.y as i64 + py as i64;
            if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
                return;
            }
            let Some(dst) = target.pixel(x as u32, y as u32) else {
                return;
            };
            let a = (color[3] as f32 / 255.0) * cov.clamp(0.0, 1.0);
            let blend = |s: u8, d: u8| (s as f32 * a + d as f32 * (1.0 - a)).round() as u8;
            let out_a = (a * 255.0 + dst[3] as f32 * (1.0 - a)).round().min(255.0) as u8;
            target.put_pixel(
                x as u32,
                y as u32,
                [
                    blend(color[0], dst[0]),
                    blend(color[1], dst[1]),
                    blend(color[2], dst[2]),
                    out_a,
                ],
            );
        });
    }
}

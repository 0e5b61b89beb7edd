//! Drawing surfaces.
//!
//! The renderer only talks to [`Canvas`]; [`PixmapCanvas`] is the tiny-skia
//! backed implementation used for real output.

use crate::error::CertStampError;
use crate::font::{FontDescriptor, FontRegistry, middle_to_baseline, shape_run};
use crate::template::Template;
use crate::types::{Color, PixelSize, Point};
use std::sync::Arc;
use tiny_skia::{
    FillRule, FilterQuality, LineCap, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Stroke,
    Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

const SYNTHETIC_ITALIC_SKEW: f32 = 0.2;
const SYNTHETIC_BOLD_STROKE_EM: f32 = 0.03;

pub trait TextMeasurer {
    /// Rendered advance width of `text` in pixels.
    fn measure_text(&self, text: &str, font: &FontDescriptor) -> Result<f32, CertStampError>;
}

/// A 2D raster surface with center/middle text alignment.
pub trait Canvas: TextMeasurer {
    fn size(&self) -> PixelSize;

    /// Stretches the template to cover the whole surface.
    fn draw_background(&mut self, template: &Template) -> Result<(), CertStampError>;

    /// Draws `text` with its horizontal center and em-box middle on `at`.
    /// Returns false when nothing was drawn (empty text or no usable face).
    fn fill_text(
        &mut self,
        text: &str,
        at: Point,
        font: &FontDescriptor,
        color: Color,
    ) -> Result<bool, CertStampError>;

    fn stroke_line(
        &mut self,
        from: Point,
        to: Point,
        thickness: f32,
        color: Color,
    ) -> Result<(), CertStampError>;

    fn encode_png(&self) -> Result<Vec<u8>, CertStampError>;
}

/// Hands out one fresh surface per rendered certificate.
pub trait SurfaceFactory {
    type Surface: Canvas;

    fn create(&self, size: PixelSize) -> Result<Self::Surface, CertStampError>;
}

#[derive(Debug, Clone)]
pub struct PixmapSurfaceFactory {
    fonts: Arc<FontRegistry>,
}

impl PixmapSurfaceFactory {
    pub fn new(fonts: Arc<FontRegistry>) -> Self {
        Self { fonts }
    }
}

impl SurfaceFactory for PixmapSurfaceFactory {
    type Surface = PixmapCanvas;

    fn create(&self, size: PixelSize) -> Result<PixmapCanvas, CertStampError> {
        PixmapCanvas::new(size, self.fonts.clone())
    }
}

pub struct PixmapCanvas {
    pixmap: Pixmap,
    fonts: Arc<FontRegistry>,
    debug_text: bool,
}

impl PixmapCanvas {
    pub fn new(size: PixelSize, fonts: Arc<FontRegistry>) -> Result<Self, CertStampError> {
        let pixmap = Pixmap::new(size.width, size.height).ok_or_else(|| {
            CertStampError::SurfaceUnavailable(format!(
                "cannot allocate {}x{} surface",
                size.width, size.height
            ))
        })?;
        let debug_text = std::env::var("CERTSTAMP_DEBUG_TEXT")
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);
        Ok(Self {
            pixmap,
            fonts,
            debug_text,
        })
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }
}

impl TextMeasurer for PixmapCanvas {
    fn measure_text(&self, text: &str, font: &FontDescriptor) -> Result<f32, CertStampError> {
        let width = self.fonts.measure_text_width(font, text);
        if width.is_finite() {
            Ok(width)
        } else {
            Err(CertStampError::InvalidConfiguration(format!(
                "non-finite text width for '{}'",
                font.css()
            )))
        }
    }
}

impl Canvas for PixmapCanvas {
    fn size(&self) -> PixelSize {
        PixelSize::new(self.pixmap.width(), self.pixmap.height())
    }

    fn draw_background(&mut self, template: &Template) -> Result<(), CertStampError> {
        let source = template.pixmap();
        if source.width() == 0 || source.height() == 0 {
            return Err(CertStampError::Decode("empty template image".to_string()));
        }
        let sx = self.pixmap.width() as f32 / source.width() as f32;
        let sy = self.pixmap.height() as f32 / source.height() as f32;
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        self.pixmap.draw_pixmap(
            0,
            0,
            source.as_ref(),
            &paint,
            Transform::from_scale(sx, sy),
            None,
        );
        Ok(())
    }

    fn fill_text(
        &mut self,
        text: &str,
        at: Point,
        font: &FontDescriptor,
        color: Color,
    ) -> Result<bool, CertStampError> {
        if text.is_empty() || font.size_px <= 0.0 {
            return Ok(false);
        }
        let Some(face) = self.fonts.resolve(font) else {
            if self.debug_text {
                eprintln!(
                    "[certstamp][text] no face for '{}'; text '{}' not drawn",
                    font.css(),
                    text
                );
            }
            log::debug!("no font face available for '{}'", font.css());
            return Ok(false);
        };
        let Some(run) = shape_run(&face.data, text, font.size_px, self.fonts.shape_text()) else {
            return Ok(false);
        };
        let Ok(outlines) = ttf_parser::Face::parse(&face.data, 0) else {
            return Ok(false);
        };

        let start_x = at.x - run.advance / 2.0;
        let baseline = at.y + middle_to_baseline(&face.data, font.size_px);
        let skew = if face.synthetic_italic {
            SYNTHETIC_ITALIC_SKEW
        } else {
            0.0
        };
        if self.debug_text {
            eprintln!(
                "[certstamp][text] '{}' font='{}' face='{}' glyphs={} width={:.2} start=({:.2},{:.2}) faux_bold={} faux_italic={}",
                text,
                font.css(),
                face.name,
                run.glyphs.len(),
                run.advance,
                start_x,
                baseline,
                face.synthetic_bold,
                face.synthetic_italic
            );
        }

        let paint = fill_paint(color);
        let bold_stroke = face.synthetic_bold.then(|| Stroke {
            width: (font.size_px * SYNTHETIC_BOLD_STROKE_EM).max(0.5),
            ..Stroke::default()
        });
        for glyph in &run.glyphs {
            let mut builder = GlyphPathBuilder::new(
                start_x + glyph.x,
                baseline - glyph.y_offset,
                run.scale,
                skew,
            );
            if outlines
                .outline_glyph(GlyphId(glyph.glyph_id), &mut builder)
                .is_none()
            {
                continue;
            }
            let Some(path) = builder.finish() else {
                continue;
            };
            self.pixmap
                .fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
            if let Some(stroke) = bold_stroke.as_ref() {
                self.pixmap
                    .stroke_path(&path, &paint, stroke, Transform::identity(), None);
            }
        }
        Ok(true)
    }

    fn stroke_line(
        &mut self,
        from: Point,
        to: Point,
        thickness: f32,
        color: Color,
    ) -> Result<(), CertStampError> {
        let mut pb = PathBuilder::new();
        pb.move_to(from.x, from.y);
        pb.line_to(to.x, to.y);
        let Some(path) = pb.finish() else {
            return Ok(());
        };
        let stroke = Stroke {
            width: thickness.max(0.0),
            line_cap: LineCap::Butt,
            ..Stroke::default()
        };
        self.pixmap
            .stroke_path(&path, &fill_paint(color), &stroke, Transform::identity(), None);
        Ok(())
    }

    fn encode_png(&self) -> Result<Vec<u8>, CertStampError> {
        self.pixmap
            .encode_png()
            .map_err(|err| CertStampError::Encode(err.to_string()))
    }
}

fn fill_paint(color: Color) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(color.to_skia());
    paint.anti_alias = true;
    paint
}

/// Maps font-space outlines (y up) onto the surface (y down), with an
/// optional horizontal shear for synthetic italics.
struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
    skew: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32, skew: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
            skew,
        }
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.origin_x + (x + y * self.skew) * self.scale,
            self.origin_y - y * self.scale,
        )
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::tests::fixture_registry;
    use crate::template::tests::solid_template;

    fn canvas(width: u32, height: u32) -> PixmapCanvas {
        let mut fonts = FontRegistry::new();
        fonts.set_use_system_fonts(false);
        PixmapCanvas::new(PixelSize::new(width, height), Arc::new(fonts)).unwrap()
    }

    #[test]
    fn background_is_stretched_to_cover_surface() {
        let template = solid_template(10, 10, [0, 128, 255, 255]);
        let mut surface = canvas(40, 20);
        surface.draw_background(&template).unwrap();
        for (x, y) in [(0, 0), (39, 0), (0, 19), (39, 19), (20, 10)] {
            let px = surface.pixmap().pixel(x, y).unwrap();
            assert_eq!(
                (px.red(), px.green(), px.blue(), px.alpha()),
                (0, 128, 255, 255),
                "pixel ({x},{y})"
            );
        }
    }

    #[test]
    fn zero_sized_surface_is_unavailable() {
        let err = PixmapCanvas::new(PixelSize::new(0, 10), Arc::new(FontRegistry::new()))
            .err()
            .unwrap();
        assert!(matches!(err, CertStampError::SurfaceUnavailable(_)));
    }

    #[test]
    fn line_paints_only_its_band() {
        let mut surface = canvas(50, 20);
        surface
            .stroke_line(
                Point::new(10.0, 10.0),
                Point::new(40.0, 10.0),
                2.0,
                Color::BLACK,
            )
            .unwrap();
        let on = surface.pixmap().pixel(25, 9).unwrap();
        assert_eq!(on.alpha(), 255);
        let off = surface.pixmap().pixel(25, 15).unwrap();
        assert_eq!(off.alpha(), 0);
        let past_end = surface.pixmap().pixel(45, 10).unwrap();
        assert_eq!(past_end.alpha(), 0);
    }

    #[test]
    fn text_without_any_face_is_a_silent_no_op() {
        let mut surface = canvas(30, 30);
        let font = FontDescriptor {
            italic: false,
            bold: false,
            size_px: 12.0,
            family: "Nope".to_string(),
        };
        let drawn = surface
            .fill_text("Ada", Point::new(15.0, 15.0), &font, Color::BLACK)
            .unwrap();
        assert!(!drawn);
        assert!(surface.pixmap().data().iter().all(|&b| b == 0));
        assert!((surface.measure_text("Ada", &font).unwrap() - 21.6).abs() < 1e-3);
    }

    /// Inclusive pixel bounds of everything at least half opaque, and the
    /// number of such pixels.
    fn ink_bounds(pixmap: &Pixmap) -> Option<((u32, u32, u32, u32), usize)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        let mut count = 0;
        for y in 0..pixmap.height() {
            for x in 0..pixmap.width() {
                let Some(px) = pixmap.pixel(x, y) else {
                    continue;
                };
                if px.alpha() < 128 {
                    continue;
                }
                count += 1;
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                });
            }
        }
        bounds.map(|b| (b, count))
    }

    fn fixture_canvas() -> (PixmapCanvas, String) {
        let (fonts, family) = fixture_registry();
        let surface = PixmapCanvas::new(PixelSize::new(400, 200), Arc::new(fonts)).unwrap();
        (surface, family)
    }

    fn face(family: &str, bold: bool, italic: bool) -> FontDescriptor {
        FontDescriptor {
            italic,
            bold,
            size_px: 48.0,
            family: family.to_string(),
        }
    }

    #[test]
    fn text_ink_is_centered_on_its_position() {
        let (mut surface, family) = fixture_canvas();
        let font = face(&family, false, false);
        let drawn = surface
            .fill_text("HHHH", Point::new(200.0, 100.0), &font, Color::BLACK)
            .unwrap();
        assert!(drawn);

        let ((left, top, right, bottom), _) = ink_bounds(surface.pixmap()).unwrap();
        let center_x = (left + right) as f32 / 2.0;
        let center_y = (top + bottom) as f32 / 2.0;
        assert!((center_x - 200.0).abs() <= 2.0, "ink x {left}..{right}");
        assert!((center_y - 100.0).abs() <= 3.0, "ink y {top}..{bottom}");

        // Side bearings keep the ink inside the advance, but not by much.
        let measured = surface.measure_text("HHHH", &font).unwrap();
        let ink_width = (right - left + 1) as f32;
        assert!(ink_width <= measured + 1.0);
        assert!(ink_width >= measured * 0.8, "ink {ink_width} advance {measured}");
    }

    #[test]
    fn synthetic_bold_thickens_and_italic_leans() {
        let draw = |bold: bool, italic: bool| {
            let (mut surface, family) = fixture_canvas();
            surface
                .fill_text(
                    "HHHH",
                    Point::new(200.0, 100.0),
                    &face(&family, bold, italic),
                    Color::BLACK,
                )
                .unwrap();
            ink_bounds(surface.pixmap()).unwrap()
        };
        let ((left, top, right, bottom), regular_ink) = draw(false, false);

        let (_, bold_ink) = draw(true, false);
        assert!(bold_ink as f32 > regular_ink as f32 * 1.05);

        // The skew pivots on the baseline: stems keep their feet and their
        // tops move right by about 0.2 * cap height.
        let ((i_left, i_top, i_right, i_bottom), _) = draw(false, true);
        assert!(i_left.abs_diff(left) <= 1);
        assert!(i_right >= right + 4, "italic right {i_right} regular {right}");
        assert!(i_top.abs_diff(top) <= 1 && i_bottom.abs_diff(bottom) <= 1);
    }

    #[test]
    fn encoded_png_decodes_to_surface_size() {
        let surface = canvas(7, 5);
        let png = surface.encode_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 5));
    }
}

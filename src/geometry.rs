//! Percent-to-pixel placement and font scaling.
//!
//! Field coordinates are stored as percentages of whatever surface they end up
//! on, and font sizes are stored relative to the template's native width. The
//! editor surface and the export surface both go through [`Normalizer`], so a
//! field positioned on a 640px wide editor lands on the same relative spot of
//! the full-size export.

use crate::model::FieldDefinition;
use crate::types::{PixelSize, Point};

pub const DEFAULT_REFERENCE_WIDTH: u32 = 800;
pub const FALLBACK_CANVAS_SIZE: PixelSize = PixelSize::new(1200, 850);
pub const MIN_FONT_SIZE: f32 = 8.0;

/// `output_width / reference_width`. A zero native width falls back to
/// `fallback_reference`, and a zero output width means "same as reference".
pub fn export_scale(template_native_width: u32, output_width: u32, fallback_reference: u32) -> f32 {
    let fallback = if fallback_reference == 0 {
        DEFAULT_REFERENCE_WIDTH
    } else {
        fallback_reference
    };
    let reference = if template_native_width == 0 {
        fallback
    } else {
        template_native_width
    };
    let output = if output_width == 0 {
        reference
    } else {
        output_width
    };
    output as f32 / reference as f32
}

/// `max(8, round(base * scale))`. Non-finite products collapse to the floor.
pub fn output_font_size(base_font_size: f32, scale: f32) -> f32 {
    let scaled = (base_font_size * scale).round();
    if !scaled.is_finite() {
        return MIN_FONT_SIZE;
    }
    scaled.max(MIN_FONT_SIZE)
}

pub fn field_position(x_percent: f32, y_percent: f32, surface: PixelSize) -> Point {
    Point::new(
        x_percent / 100.0 * surface.width as f32,
        y_percent / 100.0 * surface.height as f32,
    )
}

/// Where and how large a field is drawn on one particular surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPlacement {
    pub position: Point,
    pub font_size: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    reference_width_fallback: u32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            reference_width_fallback: DEFAULT_REFERENCE_WIDTH,
        }
    }
}

impl Normalizer {
    pub fn new(reference_width_fallback: u32) -> Self {
        Self {
            reference_width_fallback,
        }
    }

    pub fn scale(&self, template_native_width: u32, output_width: u32) -> f32 {
        export_scale(
            template_native_width,
            output_width,
            self.reference_width_fallback,
        )
    }

    pub fn place(
        &self,
        field: &FieldDefinition,
        surface: PixelSize,
        template_native_width: u32,
    ) -> FieldPlacement {
        let scale = self.scale(template_native_width, surface.width);
        FieldPlacement {
            position: field_position(field.x, field.y, surface),
            font_size: output_font_size(field.font_size, scale),
            scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn font_size_never_drops_below_floor() {
        assert_eq!(output_font_size(24.0, 1.0), 24.0);
        assert_eq!(output_font_size(24.0, 0.1), 8.0);
        assert_eq!(output_font_size(0.0, 3.0), 8.0);
        assert_eq!(output_font_size(-12.0, 1.0), 8.0);
        assert_eq!(output_font_size(f32::NAN, 1.0), 8.0);
    }

    #[test]
    fn font_size_is_monotone_in_base_size() {
        for scale in [0.05f32, 0.4, 0.8, 1.0, 1.7, 3.25] {
            let mut prev = 0.0f32;
            for tenth in 0..800 {
                let base = tenth as f32 / 10.0;
                let size = output_font_size(base, scale);
                assert!(size >= MIN_FONT_SIZE);
                assert!(size >= prev, "scale {scale} base {base}");
                prev = size;
            }
        }
    }

    #[test]
    fn font_size_rounds_half_up() {
        assert_eq!(output_font_size(24.0, 0.8125), 20.0);
        assert_eq!(output_font_size(25.0, 0.5), 13.0);
    }

    #[test]
    fn scale_uses_fallback_reference_for_unknown_width() {
        assert_eq!(export_scale(0, 1600, 800), 2.0);
        assert_eq!(export_scale(0, 1600, 0), 2.0);
        assert_eq!(export_scale(1000, 500, 800), 0.5);
        assert_eq!(export_scale(1000, 0, 800), 1.0);
    }

    #[test]
    fn position_is_percent_of_surface() {
        let p = field_position(50.0, 25.0, PixelSize::new(1000, 700));
        assert_eq!(p, Point::new(500.0, 175.0));
        let p = field_position(0.0, 100.0, PixelSize::new(333, 77));
        assert_eq!(p, Point::new(0.0, 77.0));
    }

    #[test]
    fn editor_and_export_placements_agree_after_scaling() {
        let field = FieldDefinition {
            x: 37.5,
            y: 62.0,
            font_size: 30.0,
            ..FieldDefinition::named("1", "Name")
        };
        let normalizer = Normalizer::default();
        let export = normalizer.place(&field, PixelSize::new(2000, 1400), 2000);
        let editor = normalizer.place(&field, PixelSize::new(500, 350), 2000);

        assert_eq!(export.scale, 1.0);
        assert_eq!(editor.scale, 0.25);
        let ratio = 2000.0 / 500.0;
        assert!((export.position.x - editor.position.x * ratio).abs() < 1e-3);
        assert!((export.position.y - editor.position.y * ratio).abs() < 1e-3);
        assert_eq!(export.font_size, 30.0);
        assert_eq!(editor.font_size, 8.0);
    }
}

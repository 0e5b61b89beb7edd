use crate::canvas::Canvas;
use crate::debug::EventLog;
use crate::error::CertStampError;
use crate::font::FontDescriptor;
use crate::geometry::Normalizer;
use crate::model::FieldDefinition;
use crate::resolve::FieldValues;
use crate::template::Template;
use crate::types::{Color, Point};
use serde_json::json;

/// Hand-drawn text underline, since the drawing surface has no text
/// decoration of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnderlineGeometry {
    pub start: Point,
    pub end: Point,
    pub thickness: f32,
}

impl UnderlineGeometry {
    pub fn compute(position: Point, text_width: f32, font_size: f32) -> Self {
        let y = position.y + (font_size * 0.35).max(1.0);
        let half = text_width / 2.0;
        Self {
            start: Point::new(position.x - half, y),
            end: Point::new(position.x + half, y),
            thickness: (font_size * 0.06).round().max(1.0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldRenderer {
    normalizer: Normalizer,
    events: Option<EventLog>,
}

impl FieldRenderer {
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            normalizer,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Background first, then every field in list order; later fields paint
    /// over earlier ones.
    pub fn render<C: Canvas + ?Sized>(
        &self,
        canvas: &mut C,
        template: &Template,
        fields: &[FieldDefinition],
        values: &FieldValues,
    ) -> Result<(), CertStampError> {
        canvas.draw_background(template)?;
        let surface = canvas.size();
        let native_width = template.native_size().width;
        for field in fields {
            let placement = self.normalizer.place(field, surface, native_width);
            let font = FontDescriptor::for_field(field, placement.font_size);
            let color = field.fill_color();
            let text = values.get(&field.id);
            let drawn = canvas.fill_text(text, placement.position, &font, color)?;
            if field.underline && drawn {
                if let Err(err) = draw_underline(canvas, text, placement.position, &font, color) {
                    log::debug!("underline skipped for field '{}': {err}", field.name);
                    if let Some(events) = &self.events {
                        events.event(
                            "underline.skipped",
                            json!({"field": field.name, "reason": err.to_string()}),
                        );
                        events.increment("underline.skipped", 1);
                    }
                }
            }
        }
        Ok(())
    }
}

fn draw_underline<C: Canvas + ?Sized>(
    canvas: &mut C,
    text: &str,
    position: Point,
    font: &FontDescriptor,
    color: Color,
) -> Result<(), CertStampError> {
    let width = canvas.measure_text(text, font)?;
    let line = UnderlineGeometry::compute(position, width, font.size_px);
    canvas.stroke_line(line.start, line.end, line.thickness, color)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::recording::{DrawOp, RecordingCanvas};
    use crate::debug::tests::SharedBuf;
    use crate::template::tests::solid_template;
    use crate::types::PixelSize;

    fn field(id: &str, name: &str, x: f32, y: f32) -> FieldDefinition {
        FieldDefinition {
            x,
            y,
            ..FieldDefinition::named(id, name)
        }
    }

    #[test]
    fn underline_geometry_matches_formula() {
        let line = UnderlineGeometry::compute(Point::new(100.0, 50.0), 40.0, 24.0);
        assert_eq!(line.start, Point::new(80.0, 50.0 + 24.0 * 0.35));
        assert_eq!(line.end, Point::new(120.0, 50.0 + 24.0 * 0.35));
        assert_eq!(line.thickness, 1.0);

        let small = UnderlineGeometry::compute(Point::new(0.0, 0.0), 0.0, 2.0);
        assert_eq!(small.start.y, 1.0);
        assert_eq!(small.thickness, 1.0);

        let large = UnderlineGeometry::compute(Point::new(0.0, 0.0), 10.0, 100.0);
        assert_eq!(large.thickness, 6.0);
        assert_eq!(large.start.y, 35.0);
    }

    #[test]
    fn draws_background_then_fields_in_list_order() {
        let template = solid_template(100, 80, [255, 255, 255, 255]);
        let fields = vec![field("a", "Name", 50.0, 50.0), field("b", "Course", 10.0, 90.0)];
        let mut values = FieldValues::default();
        values.insert("a", "Ada");
        values.insert("b", "Rust");
        let mut canvas = RecordingCanvas::new(PixelSize::new(200, 160));

        FieldRenderer::default()
            .render(&mut canvas, &template, &fields, &values)
            .unwrap();

        assert_eq!(canvas.ops.len(), 3);
        assert_eq!(canvas.ops[0], DrawOp::Background(PixelSize::new(200, 160)));
        match (&canvas.ops[1], &canvas.ops[2]) {
            (
                DrawOp::Text { text: first, at: a, css, .. },
                DrawOp::Text { text: second, at: b, .. },
            ) => {
                assert_eq!(first, "Ada");
                assert_eq!(*a, Point::new(100.0, 80.0));
                // 24px designed against a 100px template, drawn on 200px.
                assert_eq!(css, "normal 400 48px Inter, sans-serif");
                assert_eq!(second, "Rust");
                assert_eq!(*b, Point::new(20.0, 144.0));
            }
            other => panic!("unexpected ops {other:?}"),
        }
    }

    #[test]
    fn underline_uses_measured_width_and_fill_color() {
        let template = solid_template(200, 100, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition {
            underline: true,
            color: "#ff0000".to_string(),
            font_size: 20.0,
            ..field("a", "Name", 50.0, 50.0)
        }];
        let mut values = FieldValues::default();
        values.insert("a", "Ada");
        let mut canvas = RecordingCanvas::new(PixelSize::new(200, 100));

        FieldRenderer::default()
            .render(&mut canvas, &template, &fields, &values)
            .unwrap();

        let red = Color::rgb(1.0, 0.0, 0.0);
        assert_eq!(
            canvas.ops.last(),
            Some(&DrawOp::Line {
                from: Point::new(85.0, 57.0),
                to: Point::new(115.0, 57.0),
                thickness: 1.0,
                color: red,
            })
        );
    }

    #[test]
    fn failed_measurement_skips_only_the_underline() {
        let template = solid_template(100, 100, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition {
            underline: true,
            ..field("a", "Name", 50.0, 50.0)
        }];
        let mut values = FieldValues::default();
        values.insert("a", "Ada");
        let mut canvas = RecordingCanvas::new(PixelSize::new(100, 100));
        canvas.fail_measure = true;
        let buf = SharedBuf::default();
        let renderer = FieldRenderer::default().with_events(Some(EventLog::to_writer(buf.clone())));

        renderer
            .render(&mut canvas, &template, &fields, &values)
            .unwrap();

        assert_eq!(canvas.ops.len(), 2);
        assert!(matches!(canvas.ops[1], DrawOp::Text { .. }));
        let lines = buf.lines();
        assert_eq!(lines[0]["type"], "underline.skipped");
        assert_eq!(lines[0]["field"], "Name");
    }

    #[test]
    fn text_that_was_not_drawn_gets_no_underline() {
        let template = solid_template(100, 100, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition {
            underline: true,
            ..field("a", "Name", 50.0, 50.0)
        }];
        let mut values = FieldValues::default();
        values.insert("a", "Ada");
        let mut canvas = RecordingCanvas::new(PixelSize::new(100, 100));
        canvas.no_face = true;
        FieldRenderer::default()
            .render(&mut canvas, &template, &fields, &values)
            .unwrap();
        assert_eq!(canvas.ops.len(), 2);
        assert!(!canvas.ops.iter().any(|op| matches!(op, DrawOp::Line { .. })));
    }

    #[test]
    fn empty_value_draws_no_underline() {
        let template = solid_template(100, 100, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition {
            underline: true,
            ..field("a", "Name", 50.0, 50.0)
        }];
        let mut canvas = RecordingCanvas::new(PixelSize::new(100, 100));
        FieldRenderer::default()
            .render(&mut canvas, &template, &fields, &FieldValues::default())
            .unwrap();
        assert!(!canvas.ops.iter().any(|op| matches!(op, DrawOp::Line { .. })));
    }
}

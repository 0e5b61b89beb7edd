#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Parses the color strings the field editor stores: `#rgb`, `#rrggbb`,
    /// `#rrggbbaa`, `rgb()`, `rgba()` and a handful of keywords.
    pub fn parse(raw: &str) -> Option<Color> {
        let s = raw.trim().trim_end_matches(';');
        if s.is_empty() {
            return None;
        }
        if let Some(color) = parse_hex_color(s) {
            return Some(color);
        }
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "black" => return Some(Color::BLACK),
            "white" => return Some(Color::WHITE),
            "red" => return Some(Color::rgb(1.0, 0.0, 0.0)),
            "green" => return Some(Color::rgb(0.0, 128.0 / 255.0, 0.0)),
            "blue" => return Some(Color::rgb(0.0, 0.0, 1.0)),
            "transparent" => return Some(Color::rgba(0.0, 0.0, 0.0, 0.0)),
            _ => {}
        }
        if lower.starts_with("rgb(") || lower.starts_with("rgba(") {
            let inner = lower
                .trim_start_matches("rgba(")
                .trim_start_matches("rgb(")
                .trim_end_matches(')');
            let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
            if parts.len() < 3 {
                return None;
            }
            let r = parts[0].parse::<f32>().ok()? / 255.0;
            let g = parts[1].parse::<f32>().ok()? / 255.0;
            let b = parts[2].parse::<f32>().ok()? / 255.0;
            let a = if parts.len() >= 4 {
                parts[3].parse::<f32>().ok()?
            } else {
                1.0
            };
            return Some(Color::rgba(
                r.clamp(0.0, 1.0),
                g.clamp(0.0, 1.0),
                b.clamp(0.0, 1.0),
                a.clamp(0.0, 1.0),
            ));
        }
        None
    }

    /// Unparseable input falls back to black, as a 2D canvas keeps its
    /// default fill style when handed an invalid color.
    pub fn parse_or_black(raw: &str) -> Color {
        Color::parse(raw).unwrap_or(Color::BLACK)
    }

    pub(crate) fn to_skia(self) -> tiny_skia::Color {
        tiny_skia::Color::from_rgba(
            self.r.clamp(0.0, 1.0),
            self.g.clamp(0.0, 1.0),
            self.b.clamp(0.0, 1.0),
            self.a.clamp(0.0, 1.0),
        )
        .unwrap_or_else(|| tiny_skia::Color::from_rgba8(0, 0, 0, 255))
    }
}

fn parse_hex_color(value: &str) -> Option<Color> {
    let s = value.strip_prefix('#')?;
    if !s.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let hex = match s.len() {
        3 | 4 => {
            let mut out = String::with_capacity(s.len() * 2);
            for ch in s.chars() {
                out.push(ch);
                out.push(ch);
            }
            out
        }
        6 | 8 => s.to_string(),
        _ => return None,
    };

    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    let a = if hex.len() == 8 {
        u8::from_str_radix(&hex[6..8], 16).ok()?
    } else {
        255
    };
    Some(Color::rgba(
        r as f32 / 255.0,
        g as f32 / 255.0,
        b as f32 / 255.0,
        a as f32 / 255.0,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

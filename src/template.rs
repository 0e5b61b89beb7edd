use crate::error::CertStampError;
use crate::geometry::FALLBACK_CANVAS_SIZE;
use crate::types::PixelSize;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;
use tiny_skia::Pixmap;

/// Decoded background image. Decoded once per session and shared read-only
/// by every row render.
#[derive(Clone)]
pub struct Template {
    pixmap: Arc<Pixmap>,
    mime: Option<String>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("width", &self.pixmap.width())
            .field("height", &self.pixmap.height())
            .field("mime", &self.mime)
            .finish()
    }
}

impl Template {
    pub fn from_bytes(data: &[u8]) -> Result<Self, CertStampError> {
        Self::decode(data, None)
    }

    /// Accepts the `data:image/...;base64,` form the editor persists.
    pub fn from_data_uri(uri: &str) -> Result<Self, CertStampError> {
        let (mime, data) = parse_data_uri(uri)
            .ok_or_else(|| CertStampError::Decode("malformed data uri".to_string()))?;
        Self::decode(&data, Some(mime))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CertStampError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::decode(&bytes, None)
    }

    /// A `data:` URI or a file path.
    pub fn load(source: &str) -> Result<Self, CertStampError> {
        if source.starts_with("data:") {
            return Self::from_data_uri(source);
        }
        Self::from_path(source)
    }

    fn decode(data: &[u8], mime: Option<String>) -> Result<Self, CertStampError> {
        let pixmap = decode_image_to_pixmap(data, mime.as_deref())?;
        Ok(Self {
            pixmap: Arc::new(pixmap),
            mime,
        })
    }

    pub fn native_size(&self) -> PixelSize {
        PixelSize::new(self.pixmap.width(), self.pixmap.height())
    }

    /// Size of the export surface: the native size, or the fallback when the
    /// image reports no usable dimensions.
    pub fn output_size(&self, fallback: PixelSize) -> PixelSize {
        let native = self.native_size();
        if native.is_empty() {
            if fallback.is_empty() {
                FALLBACK_CANVAS_SIZE
            } else {
                fallback
            }
        } else {
            native
        }
    }

    pub(crate) fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }
}

fn decode_image_to_pixmap(data: &[u8], mime: Option<&str>) -> Result<Pixmap, CertStampError> {
    let guessed_format = match mime {
        Some(mime) if mime.contains("png") => Some(image::ImageFormat::Png),
        Some(mime) if mime.contains("jpeg") || mime.contains("jpg") => {
            Some(image::ImageFormat::Jpeg)
        }
        _ => image::guess_format(data).ok(),
    };

    let decoded = match guessed_format {
        Some(fmt) => image::load_from_memory_with_format(data, fmt),
        None => image::load_from_memory(data),
    }
    .map_err(|err| CertStampError::Decode(err.to_string()))?;

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
        CertStampError::Decode(format!("unusable image dimensions {width}x{height}"))
    })?;
    let src = rgba.as_raw();
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Ok(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()?
    } else {
        payload.as_bytes().to_vec()
    };
    Some((mime, data))
}

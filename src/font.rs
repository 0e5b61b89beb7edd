use crate::error::CertStampError;
use crate::model::FieldDefinition;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use ttf_parser::GlyphId;

pub const GENERIC_FALLBACK_FAMILY: &str = "sans-serif";

/// Style, weight, size and family for one text draw, in the shape of a CSS
/// `font` shorthand.
#[derive(Debug, Clone, PartialEq)]
pub struct FontDescriptor {
    pub italic: bool,
    pub bold: bool,
    pub size_px: f32,
    pub family: String,
}

impl FontDescriptor {
    pub fn for_field(field: &FieldDefinition, size_px: f32) -> Self {
        Self {
            italic: field.italic,
            bold: field.bold,
            size_px,
            family: field.family().to_string(),
        }
    }

    pub fn weight(&self) -> u16 {
        if self.bold { 700 } else { 400 }
    }

    /// `italic 700 24px "Open Sans", sans-serif`. Families containing
    /// whitespace are quoted and the generic fallback is always appended.
    pub fn css(&self) -> String {
        let style = if self.italic { "italic" } else { "normal" };
        let family = if self.family.chars().any(char::is_whitespace) {
            format!("\"{}\"", self.family)
        } else {
            self.family.clone()
        };
        format!(
            "{} {} {}px {}, {}",
            style,
            self.weight(),
            format_px(self.size_px),
            family,
            GENERIC_FALLBACK_FAMILY
        )
    }

    /// Families to try, in order, ending with the generic fallback.
    pub fn family_candidates(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        let family = normalize_name(&self.family);
        if !family.is_empty() {
            out.push(self.family.trim().to_string());
        }
        if family != GENERIC_FALLBACK_FAMILY {
            out.push(GENERIC_FALLBACK_FAMILY.to_string());
        }
        out
    }

    fn variant(&self) -> FontStyleVariant {
        FontStyleVariant::from_flags(self.bold, self.italic)
    }
}

fn format_px(size: f32) -> String {
    if size.fract() == 0.0 {
        format!("{}", size as i64)
    } else {
        format!("{size}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum FontStyleVariant {
    Regular,
    Bold,
    Italic,
    BoldItalic,
}

impl FontStyleVariant {
    fn from_flags(bold: bool, italic: bool) -> Self {
        match (bold, italic) {
            (false, false) => FontStyleVariant::Regular,
            (true, false) => FontStyleVariant::Bold,
            (false, true) => FontStyleVariant::Italic,
            (true, true) => FontStyleVariant::BoldItalic,
        }
    }

    fn suffixes(self) -> &'static [&'static str] {
        match self {
            FontStyleVariant::Regular => &["-Regular", "Regular", ""],
            FontStyleVariant::Bold => &["-Bold", "Bold", "bd"],
            FontStyleVariant::Italic => &["-Italic", "Italic", "-Oblique", "i"],
            FontStyleVariant::BoldItalic => &["-BoldItalic", "BoldItalic", "-BoldOblique", "bi"],
        }
    }
}

/// A face chosen for a descriptor, plus what has to be synthesized because
/// the face itself lacks the requested weight or slant.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedFace {
    pub(crate) data: Arc<Vec<u8>>,
    pub(crate) name: String,
    pub(crate) synthetic_bold: bool,
    pub(crate) synthetic_italic: bool,
}

#[derive(Debug)]
struct RegisteredFont {
    family: String,
    data: Arc<Vec<u8>>,
    bold: bool,
    italic: bool,
}

#[derive(Debug, Default)]
struct FontTable {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TextWidthKey {
    css: String,
    text: String,
}

#[derive(Debug)]
struct TextWidthCache {
    map: HashMap<TextWidthKey, f32>,
    order: VecDeque<TextWidthKey>,
    max_entries: usize,
}

impl TextWidthCache {
    fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&self, key: &TextWidthKey) -> Option<f32> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: TextWidthKey, value: f32) {
        if self.map.contains_key(&key) {
            return;
        }
        self.map.insert(key.clone(), value);
        self.order.push_back(key);
        while self.map.len() > self.max_entries {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Registered fonts plus platform font lookup. Registration takes `&self`
/// so a host can keep loading fonts into a registry the engine already holds.
#[derive(Debug)]
pub struct FontRegistry {
    table: RwLock<FontTable>,
    shape_text: bool,
    use_system_fonts: bool,
    text_width_cache: Mutex<TextWidthCache>,
}

impl Default for FontRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FontRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(FontTable::default()),
            shape_text: true,
            use_system_fonts: true,
            text_width_cache: Mutex::new(TextWidthCache::new(20_000)),
        }
    }

    pub(crate) fn set_shape_text(&mut self, enabled: bool) {
        self.shape_text = enabled;
    }

    pub(crate) fn set_use_system_fonts(&mut self, enabled: bool) {
        self.use_system_fonts = enabled;
    }

    pub fn font_count(&self) -> usize {
        self.read_table().fonts.len()
    }

    pub fn register_dir(&self, path: impl AsRef<Path>) -> usize {
        let Ok(entries) = fs::read_dir(path.as_ref()) else {
            return 0;
        };
        let mut registered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file()
                && is_supported_font_path(&path)
                && self.register_file(&path).is_ok()
            {
                registered += 1;
            }
        }
        registered
    }

    pub fn register_file(&self, path: impl AsRef<Path>) -> Result<String, CertStampError> {
        let path = path.as_ref();
        if !is_supported_font_path(path) {
            return Err(CertStampError::InvalidConfiguration(format!(
                "unsupported font file {}",
                path.display()
            )));
        }
        let data = fs::read(path)?;
        let stem = path.file_stem().and_then(|v| v.to_str());
        self.register_bytes(data, stem)
    }

    /// Registers one face and returns its family name.
    pub fn register_bytes(
        &self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, CertStampError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let face = ttf_parser::Face::parse(&data, 0).map_err(|err| {
            CertStampError::InvalidConfiguration(format!("invalid font data for {source}: {err}"))
        })?;

        let (family, aliases) = font_names(&face, source);
        let bold = face.is_bold() || face.weight().to_number() >= 600;
        let italic = face.is_italic() || face.is_oblique();

        let mut table = self.write_table();
        let index = table.fonts.len();
        table.fonts.push(RegisteredFont {
            family: family.clone(),
            data: Arc::new(data),
            bold,
            italic,
        });
        let mut keys: Vec<String> = Vec::with_capacity(1 + aliases.len());
        keys.push(normalize_name(&family));
        keys.extend(aliases.iter().map(|alias| normalize_name(alias)));
        keys.dedup();
        for key in keys {
            if key.is_empty() {
                continue;
            }
            table.lookup.entry(key).or_default().push(index);
        }
        drop(table);

        if let Ok(mut cache) = self.text_width_cache.lock() {
            cache.clear();
        }
        log::debug!(
            "registered font family '{family}' from {source} (bold={bold}, italic={italic})"
        );
        Ok(family)
    }

    pub(crate) fn resolve(&self, descriptor: &FontDescriptor) -> Option<ResolvedFace> {
        let wanted = descriptor.variant();
        for family in descriptor.family_candidates() {
            if let Some(face) = self.resolve_registered(&family, descriptor) {
                return Some(face);
            }
            if !self.use_system_fonts {
                continue;
            }
            if let Some(data) = resolve_system_font_bytes(&family, wanted) {
                log::debug!("font '{family}' resolved from system fonts");
                return Some(face_with_synthesis(data, family, descriptor));
            }
        }
        None
    }

    fn resolve_registered(
        &self,
        family: &str,
        descriptor: &FontDescriptor,
    ) -> Option<ResolvedFace> {
        let table = self.read_table();
        let indices = table.lookup.get(&normalize_name(family))?;
        let pick = indices
            .iter()
            .copied()
            .find(|&idx| {
                let font = &table.fonts[idx];
                font.bold == descriptor.bold && font.italic == descriptor.italic
            })
            .or_else(|| {
                indices
                    .iter()
                    .copied()
                    .find(|&idx| table.fonts[idx].italic == descriptor.italic)
            })
            .or_else(|| indices.first().copied())?;
        let font = &table.fonts[pick];
        Some(ResolvedFace {
            data: font.data.clone(),
            name: font.family.clone(),
            synthetic_bold: descriptor.bold && !font.bold,
            synthetic_italic: descriptor.italic && !font.italic,
        })
    }

    /// Advance width of `text` in pixels. Without any usable face the width
    /// is estimated at 0.6em per character so layout still has something to
    /// center on.
    pub fn measure_text_width(&self, descriptor: &FontDescriptor, text: &str) -> f32 {
        if text.is_empty() || descriptor.size_px <= 0.0 {
            return 0.0;
        }
        let key = TextWidthKey {
            css: descriptor.css(),
            text: text.to_string(),
        };
        if let Ok(cache) = self.text_width_cache.lock() {
            if let Some(value) = cache.get(&key) {
                return value;
            }
        }
        let value = match self.resolve(descriptor) {
            Some(face) => shape_run(&face.data, text, descriptor.size_px, self.shape_text)
                .map(|run| run.advance)
                .unwrap_or_else(|| estimate_width(descriptor.size_px, text)),
            None => estimate_width(descriptor.size_px, text),
        };
        if let Ok(mut cache) = self.text_width_cache.lock() {
            cache.insert(key, value);
        }
        value
    }

    pub(crate) fn shape_text(&self) -> bool {
        self.shape_text
    }

    fn read_table(&self) -> RwLockReadGuard<'_, FontTable> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, FontTable> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn face_with_synthesis(
    data: Arc<Vec<u8>>,
    family: String,
    descriptor: &FontDescriptor,
) -> ResolvedFace {
    let (bold, italic) = match ttf_parser::Face::parse(&data, 0) {
        Ok(face) => (
            face.is_bold() || face.weight().to_number() >= 600,
            face.is_italic() || face.is_oblique(),
        ),
        Err(_) => (false, false),
    };
    ResolvedFace {
        data,
        name: family,
        synthetic_bold: descriptor.bold && !bold,
        synthetic_italic: descriptor.italic && !italic,
    }
}

fn estimate_width(font_size: f32, text: &str) -> f32 {
    (font_size * 0.6).max(1.0) * text.chars().count() as f32
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct GlyphPlacement {
    pub(crate) glyph_id: u16,
    pub(crate) x: f32,
    pub(crate) y_offset: f32,
}

#[derive(Clone, Debug)]
pub(crate) struct ShapedRun {
    pub(crate) glyphs: Vec<GlyphPlacement>,
    pub(crate) advance: f32,
    pub(crate) scale: f32,
}

/// Glyph positions relative to the run's start, in pixels. Offsets are in
/// font space (y up).
pub(crate) fn shape_run(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    shape: bool,
) -> Option<ShapedRun> {
    if !shape {
        return shape_run_unshaped(font_data, text, font_size);
    }
    let Some(face) = HbFace::from_slice(font_data, 0) else {
        return shape_run_unshaped(font_data, text, font_size);
    };
    let units = face.units_per_em().max(1) as f32;
    let scale = font_size / units;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.len() != positions.len() {
        return shape_run_unshaped(font_data, text, font_size);
    }

    let mut glyphs = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            glyphs.push(GlyphPlacement {
                glyph_id: gid,
                x: pen_x + pos.x_offset as f32 * scale,
                y_offset: pos.y_offset as f32 * scale,
            });
        }
        pen_x += pos.x_advance as f32 * scale;
    }
    Some(ShapedRun {
        glyphs,
        advance: pen_x.max(0.0),
        scale,
    })
}

fn shape_run_unshaped(font_data: &[u8], text: &str, font_size: f32) -> Option<ShapedRun> {
    let face = ttf_parser::Face::parse(font_data, 0).ok()?;
    let units = face.units_per_em().max(1) as f32;
    let scale = font_size / units;

    let mut glyphs = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_size * 0.5;
            continue;
        }
        glyphs.push(GlyphPlacement {
            glyph_id: gid,
            x: pen_x,
            y_offset: 0.0,
        });
        let advance_units = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let mut adv = advance_units * scale;
        if adv <= 0.0 {
            adv = font_size * 0.5;
        }
        pen_x += adv;
    }
    Some(ShapedRun {
        glyphs,
        advance: pen_x,
        scale,
    })
}

/// Distance from the em box middle down to the alphabetic baseline, in
/// pixels. Text drawn with a "middle" baseline puts its baseline here.
pub(crate) fn middle_to_baseline(font_data: &[u8], font_size: f32) -> f32 {
    let Ok(face) = ttf_parser::Face::parse(font_data, 0) else {
        return font_size * 0.35;
    };
    let units = face.units_per_em().max(1) as f32;
    let ascent = face.ascender() as f32;
    let descent = face.descender() as f32;
    if ascent - descent <= 0.0 {
        return font_size * 0.35;
    }
    (ascent + descent) / 2.0 / units * font_size
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let code = ch as u32;
        let rtl = matches!(
            code,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

fn font_names(face: &ttf_parser::Face<'_>, source: &str) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut typographic = None;
    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY if typographic.is_none() => typographic = Some(name),
            name_id::FAMILY if family.is_none() => family = Some(name),
            name_id::FULL_NAME if full.is_none() => full = Some(name),
            name_id::POST_SCRIPT_NAME if post.is_none() => post = Some(name),
            _ => {}
        }
    }

    let stem = Path::new(source)
        .file_stem()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string());
    let primary = typographic
        .clone()
        .or_else(|| family.clone())
        .or_else(|| full.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let mut aliases = Vec::new();
    for candidate in [typographic, family, full, post, stem].into_iter().flatten() {
        if candidate != primary && !aliases.contains(&candidate) {
            aliases.push(candidate);
        }
    }
    (primary, aliases)
}

pub fn is_supported_font_path(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
        return false;
    };
    matches!(ext.to_ascii_lowercase().as_str(), "ttf" | "otf")
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

static SYSTEM_FONT_INDEX: OnceLock<HashMap<String, PathBuf>> = OnceLock::new();
type SystemFontCache = HashMap<(String, FontStyleVariant), Option<Arc<Vec<u8>>>>;

static SYSTEM_FONT_CACHE: OnceLock<Mutex<SystemFontCache>> = OnceLock::new();

fn resolve_system_font_bytes(family: &str, variant: FontStyleVariant) -> Option<Arc<Vec<u8>>> {
    let key = (normalize_name(family), variant);
    if key.0.is_empty() {
        return None;
    }
    let cache = SYSTEM_FONT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(entry) = guard.get(&key) {
            return entry.clone();
        }
    }

    let index = SYSTEM_FONT_INDEX.get_or_init(build_system_font_index);
    let mut loaded = None;
    let mut candidates = system_font_file_candidates(&key.0, variant);
    if variant != FontStyleVariant::Regular {
        candidates.extend(system_font_file_candidates(&key.0, FontStyleVariant::Regular));
    }
    for file_name in candidates {
        let Some(path) = index.get(&file_name.to_ascii_lowercase()) else {
            continue;
        };
        let Ok(bytes) = fs::read(path) else {
            continue;
        };
        if ttf_parser::Face::parse(&bytes, 0).is_ok() {
            loaded = Some(Arc::new(bytes));
            break;
        }
    }

    if let Ok(mut guard) = cache.lock() {
        guard.insert(key, loaded.clone());
    }
    loaded
}

fn system_font_file_candidates(family: &str, variant: FontStyleVariant) -> Vec<String> {
    let generic: &[&str] = match family {
        "sans-serif" | "system-ui" | "ui-sans-serif" => &[
            "NotoSans",
            "LiberationSans",
            "DejaVuSans",
            "Arial",
            "arial",
            "Helvetica",
        ],
        "serif" | "ui-serif" => &["NotoSerif", "LiberationSerif", "DejaVuSerif", "times"],
        "monospace" | "ui-monospace" => &[
            "NotoSansMono",
            "LiberationMono",
            "DejaVuSansMono",
            "cour",
        ],
        _ => &[],
    };
    let mut stems: Vec<String> = generic.iter().map(|s| s.to_string()).collect();
    if stems.is_empty() {
        let compact: String = family.split_whitespace().collect();
        stems.push(compact);
        if family.contains(' ') {
            stems.push(family.replace(' ', "-"));
        }
    }

    let mut out = Vec::new();
    for stem in &stems {
        for suffix in variant.suffixes() {
            for ext in ["ttf", "otf"] {
                out.push(format!("{stem}{suffix}.{ext}"));
            }
        }
    }
    out
}

fn build_system_font_index() -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    for dir in system_font_dirs() {
        index_font_dir(&dir, 0, &mut index);
    }
    index
}

fn index_font_dir(dir: &Path, depth: usize, index: &mut HashMap<String, PathBuf>) {
    const MAX_DEPTH: usize = 5;
    if depth > MAX_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            index_font_dir(&path, depth + 1, index);
        } else if is_supported_font_path(&path) {
            if let Some(name) = path.file_name().and_then(|v| v.to_str()) {
                index.entry(name.to_ascii_lowercase()).or_insert(path.clone());
            }
        }
    }
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(&home).join(".fonts"));
            dirs.push(PathBuf::from(home).join(".local/share/fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    if let Ok(extra) = std::env::var("CERTSTAMP_FONT_DIR") {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    dirs
}

/// Marks fonts as loaded. Dropping it without calling `mark_ready` also
/// releases waiters, which then render with whatever faces are available.
#[derive(Debug)]
pub struct FontReadiness {
    tx: watch::Sender<bool>,
}

impl FontReadiness {
    pub fn mark_ready(&self) {
        let _ = self.tx.send(true);
    }
}

/// Awaited once before a batch or preview starts drawing.
#[derive(Debug, Clone)]
pub struct FontReadinessSignal {
    rx: watch::Receiver<bool>,
}

impl FontReadinessSignal {
    pub fn pending() -> (FontReadiness, FontReadinessSignal) {
        let (tx, rx) = watch::channel(false);
        (FontReadiness { tx }, FontReadinessSignal { rx })
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) {
        if self.rx.wait_for(|ready| *ready).await.is_err() {
            log::debug!("font readiness sender dropped before signalling; continuing");
        }
    }
}

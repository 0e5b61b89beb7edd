//! Minimal ZIP writer (STORE method only).
//!
//! PNG payloads are already deflated, so entries are stored as is. Names are
//! flagged UTF-8 (general purpose bit 11) and every entry carries the
//! packaging date as its DOS timestamp.

use crate::error::CertStampError;
use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;
const VERSION_NEEDED: u16 = 20;
const FLAG_UTF8: u16 = 0x0800;
const METHOD_STORE: u16 = 0;
const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_LEN: usize = 22;
const MAX_ENTRIES: usize = u16::MAX as usize;

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

/// `(time, date)` in MS-DOS format. Dates before 1980 clamp to 1980-01-01.
pub fn dos_date_time(date: NaiveDate) -> (u16, u16) {
    let year = date.year();
    if year < 1980 {
        return (0, (1 << 5) | 1);
    }
    let year = (year - 1980).min(127) as u16;
    let dos_date = (year << 9) | ((date.month() as u16) << 5) | date.day() as u16;
    (0, dos_date)
}

/// Replaces path separators and control characters so a data-derived name
/// cannot escape the archive root.
pub fn sanitize_entry_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch == '/' || ch == '\\' || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Hands out unique entry names, suffixing repeats as `<stem>-2.<ext>`,
/// `<stem>-3.<ext>`, ...
#[derive(Debug, Default)]
pub struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, wanted: &str) -> String {
        let wanted = sanitize_entry_name(wanted);
        if self.taken.insert(wanted.clone()) {
            return wanted;
        }
        let (stem, ext) = match wanted.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (wanted.clone(), String::new()),
        };
        let mut n = 2usize;
        loop {
            let candidate = format!("{stem}-{n}{ext}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

struct CentralRecord {
    name: String,
    crc: u32,
    size: u32,
    offset: u32,
}

pub struct ZipWriter {
    buf: Vec<u8>,
    central: Vec<CentralRecord>,
    names: HashSet<String>,
    dos_time: u16,
    dos_date: u16,
    max_bytes: Option<u64>,
}

impl ZipWriter {
    pub fn new(date: NaiveDate) -> Self {
        let (dos_time, dos_date) = dos_date_time(date);
        Self {
            buf: Vec::new(),
            central: Vec::new(),
            names: HashSet::new(),
            dos_time,
            dos_date,
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<(), CertStampError> {
        if self.central.len() >= MAX_ENTRIES {
            return Err(CertStampError::Packaging(format!(
                "too many entries (limit {MAX_ENTRIES})"
            )));
        }
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(CertStampError::Packaging(format!(
                "unusable entry name of {} bytes",
                name.len()
            )));
        }
        if !self.names.insert(name.to_string()) {
            return Err(CertStampError::Packaging(format!("duplicate entry '{name}'")));
        }
        let size = u32::try_from(data.len()).map_err(|_| {
            CertStampError::Packaging(format!("entry '{name}' exceeds 4 GiB"))
        })?;
        let offset = u32::try_from(self.buf.len())
            .map_err(|_| CertStampError::Packaging("archive exceeds 4 GiB".to_string()))?;

        let entry_len = LOCAL_HEADER_LEN + CENTRAL_HEADER_LEN + 2 * name.len() + data.len();
        self.check_size(self.projected_len() + entry_len)?;

        let crc = crc32(data);
        put_u32(&mut self.buf, LOCAL_HEADER_SIG);
        put_u16(&mut self.buf, VERSION_NEEDED);
        put_u16(&mut self.buf, FLAG_UTF8);
        put_u16(&mut self.buf, METHOD_STORE);
        put_u16(&mut self.buf, self.dos_time);
        put_u16(&mut self.buf, self.dos_date);
        put_u32(&mut self.buf, crc);
        put_u32(&mut self.buf, size);
        put_u32(&mut self.buf, size);
        put_u16(&mut self.buf, name.len() as u16);
        put_u16(&mut self.buf, 0);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(data);

        self.central.push(CentralRecord {
            name: name.to_string(),
            crc,
            size,
            offset,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<u8>, CertStampError> {
        let cd_offset = u32::try_from(self.buf.len())
            .map_err(|_| CertStampError::Packaging("archive exceeds 4 GiB".to_string()))?;
        let cd_start = self.buf.len();
        for record in &self.central {
            put_u32(&mut self.buf, CENTRAL_HEADER_SIG);
            put_u16(&mut self.buf, VERSION_NEEDED);
            put_u16(&mut self.buf, VERSION_NEEDED);
            put_u16(&mut self.buf, FLAG_UTF8);
            put_u16(&mut self.buf, METHOD_STORE);
            put_u16(&mut self.buf, self.dos_time);
            put_u16(&mut self.buf, self.dos_date);
            put_u32(&mut self.buf, record.crc);
            put_u32(&mut self.buf, record.size);
            put_u32(&mut self.buf, record.size);
            put_u16(&mut self.buf, record.name.len() as u16);
            put_u16(&mut self.buf, 0);
            put_u16(&mut self.buf, 0);
            put_u16(&mut self.buf, 0);
            put_u16(&mut self.buf, 0);
            put_u32(&mut self.buf, 0);
            put_u32(&mut self.buf, record.offset);
            self.buf.extend_from_slice(record.name.as_bytes());
        }
        let cd_size = u32::try_from(self.buf.len() - cd_start).map_err(|_| {
            CertStampError::Packaging("central directory exceeds 4 GiB".to_string())
        })?;

        let count = self.central.len() as u16;
        put_u32(&mut self.buf, END_OF_CENTRAL_SIG);
        put_u16(&mut self.buf, 0);
        put_u16(&mut self.buf, 0);
        put_u16(&mut self.buf, count);
        put_u16(&mut self.buf, count);
        put_u32(&mut self.buf, cd_size);
        put_u32(&mut self.buf, cd_offset);
        put_u16(&mut self.buf, 0);
        self.check_size(self.buf.len())?;
        Ok(self.buf)
    }

    fn projected_len(&self) -> usize {
        let central: usize = self
            .central
            .iter()
            .map(|r| CENTRAL_HEADER_LEN + r.name.len())
            .sum();
        self.buf.len() + central + END_OF_CENTRAL_LEN
    }

    fn check_size(&self, projected: usize) -> Result<(), CertStampError> {
        if projected > u32::MAX as usize {
            return Err(CertStampError::Packaging("archive exceeds 4 GiB".to_string()));
        }
        if let Some(limit) = self.max_bytes {
            if projected as u64 > limit {
                return Err(CertStampError::Packaging(format!(
                    "archive would be {projected} bytes, limit is {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// Packs `(name, bytes)` pairs in order. Names must already be unique.
pub fn package(
    entries: &[(String, Vec<u8>)],
    date: NaiveDate,
    max_bytes: Option<u64>,
) -> Result<Vec<u8>, CertStampError> {
    let mut writer = ZipWriter::new(date).with_max_bytes(max_bytes);
    for (name, data) in entries {
        writer.add(name, data)?;
    }
    writer.finish()
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

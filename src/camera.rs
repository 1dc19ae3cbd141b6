//! Camera identification from the metadata embedded in each DNG file.
//!
//! This is an offline batch step: its CSV output is consumed by the index
//! builder and never regenerated on read.

use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use camino::Utf8Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::Camera;
use crate::error::FivekError;
use crate::store::Layout;

pub const CAMERA_TABLE_HEADER: &str = "file_id,make,normalized_make,model,normalized_model";

const RAW_EXTENSION: &str = "dng";

/// Identification block of one raw file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIdentity {
    pub make: String,
    pub model: String,
    pub normalized_make: String,
    pub normalized_model: String,
}

impl RawIdentity {
    /// Builds an identity from raw firmware strings, deriving the normalized pair.
    pub fn from_raw(make: &str, model: &str) -> Self {
        let normalized_make = normalize_make(make);
        let normalized_model = normalize_model(&normalized_make, model);
        Self {
            make: make.trim().to_string(),
            model: model.trim().to_string(),
            normalized_make,
            normalized_model,
        }
    }
}

/// Raw-container decoding capability.
pub trait RawProbe: Send + Sync {
    fn identify(&self, path: &Path) -> Result<RawIdentity, FivekError>;
}

/// Decodes DNG headers with `rawloader`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawloaderProbe;

impl RawProbe for RawloaderProbe {
    fn identify(&self, path: &Path) -> Result<RawIdentity, FivekError> {
        let decoder = rawloader::RawLoader::new();
        let image = decoder
            .decode_file(path)
            .map_err(|err| FivekError::CameraTable(format!("{}: {err:?}", path.display())))?;
        let mut identity = RawIdentity::from_raw(&image.make, &image.model);
        if !image.clean_make.trim().is_empty() {
            identity.normalized_make = collapse_whitespace(&image.clean_make);
        }
        if !image.clean_model.trim().is_empty() {
            identity.normalized_model = collapse_whitespace(&image.clean_model);
        }
        Ok(identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraProbe {
    Identified(RawIdentity),
    Unreadable(String),
}

/// Identifies one file; decoder errors and panics both come back as
/// `Unreadable`.
pub fn identify_camera(probe: &dyn RawProbe, path: &Path) -> CameraProbe {
    let result = panic::catch_unwind(AssertUnwindSafe(|| probe.identify(path)));
    match result {
        Ok(Ok(identity)) => CameraProbe::Identified(identity),
        Ok(Err(err)) => CameraProbe::Unreadable(err.to_string()),
        Err(panic_info) => {
            let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            CameraProbe::Unreadable(format!("decoder panicked: {message}"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRow {
    pub file_id: String,
    pub make: String,
    pub normalized_make: String,
    pub model: String,
    pub normalized_model: String,
}

impl CameraRow {
    pub fn camera(&self) -> Camera {
        Camera {
            make: self.make.clone(),
            model: self.model.clone(),
            normalized_make: non_empty(&self.normalized_make),
            normalized_model: non_empty(&self.normalized_model),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CameraScan {
    pub rows: Vec<CameraRow>,
    pub visited: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraTable {
    pub rows: Vec<CameraRow>,
}

impl CameraTable {
    /// Walks `root` and identifies every `.dng` file. Rows keep traversal order.
    pub fn scan(root: &Path, probe: &dyn RawProbe) -> Result<CameraScan, FivekError> {
        if !root.is_dir() {
            return Err(FivekError::Filesystem(format!(
                "raw directory not found: {}",
                root.display()
            )));
        }
        let mut scan = CameraScan::default();
        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !has_raw_extension(path) {
                continue;
            }
            scan.visited += 1;
            let Some(file_id) = path.file_stem().map(|stem| stem.to_string_lossy().to_string())
            else {
                scan.skipped += 1;
                continue;
            };
            match identify_camera(probe, path) {
                CameraProbe::Identified(identity) => {
                    debug!(
                        file_id = %file_id,
                        make = %identity.make,
                        model = %identity.model,
                        "identified camera"
                    );
                    scan.rows.push(CameraRow {
                        file_id,
                        make: identity.make,
                        normalized_make: identity.normalized_make,
                        model: identity.model,
                        normalized_model: identity.normalized_model,
                    });
                }
                CameraProbe::Unreadable(reason) => {
                    warn!(path = %path.display(), %reason, "skipping unreadable raw file");
                    scan.skipped += 1;
                }
            }
        }
        info!(
            visited = scan.visited,
            identified = scan.rows.len(),
            skipped = scan.skipped,
            "camera scan finished"
        );
        Ok(scan)
    }

    pub fn from_scan(scan: CameraScan) -> Self {
        Self { rows: scan.rows }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.rows.len() + 1));
        out.push_str(CAMERA_TABLE_HEADER);
        out.push('\n');
        for row in &self.rows {
            let fields = [
                row.file_id.as_str(),
                row.make.as_str(),
                row.normalized_make.as_str(),
                row.model.as_str(),
                row.normalized_model.as_str(),
            ];
            let line = fields
                .iter()
                .map(|field| csv_field(field))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Utf8Path) -> Result<(), FivekError> {
        Layout::write_bytes_atomic(path, self.to_csv().as_bytes())
    }

    pub fn parse_csv(content: &str) -> Result<Self, FivekError> {
        let mut lines = content.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| FivekError::CameraTable("empty camera table".to_string()))?;
        let columns = split_csv_line(header.trim_start_matches('\u{feff}'))?;
        let position = |name: &str| {
            columns
                .iter()
                .position(|column| column.trim() == name)
                .ok_or_else(|| FivekError::CameraTable(format!("missing column {name}")))
        };
        let file_id = position("file_id")?;
        let make = position("make")?;
        let model = position("model")?;
        let normalized_make = columns.iter().position(|c| c.trim() == "normalized_make");
        let normalized_model = columns.iter().position(|c| c.trim() == "normalized_model");

        let mut rows = Vec::new();
        for (number, line) in lines.enumerate() {
            let fields = split_csv_line(line)?;
            let field = |index: usize| -> Result<String, FivekError> {
                fields
                    .get(index)
                    .map(|value| value.trim().to_string())
                    .ok_or_else(|| {
                        FivekError::CameraTable(format!(
                            "row {} has {} fields",
                            number + 2,
                            fields.len()
                        ))
                    })
            };
            let optional = |index: Option<usize>| {
                index
                    .and_then(|index| fields.get(index))
                    .map(|value| value.trim().to_string())
                    .unwrap_or_default()
            };
            let row = CameraRow {
                file_id: field(file_id)?,
                make: field(make)?,
                normalized_make: optional(normalized_make),
                model: field(model)?,
                normalized_model: optional(normalized_model),
            };
            // an identification-less row is equivalent to no row
            if row.make.is_empty() && row.model.is_empty() {
                continue;
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn read_csv(path: &Path) -> Result<Self, FivekError> {
        let content = fs::read_to_string(path)
            .map_err(|err| FivekError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::parse_csv(&content)
    }

    /// Cameras keyed by file id; later rows win.
    pub fn by_file_id(&self) -> HashMap<String, Camera> {
        self.rows
            .iter()
            .map(|row| (row.file_id.clone(), row.camera()))
            .collect()
    }
}

const VENDOR_SUFFIXES: [&str; 11] = [
    " imaging corporation",
    " imaging corp.",
    " optical co.,ltd",
    " corporation",
    " company, ltd.",
    " co., ltd.",
    " co.,ltd.",
    " corp.",
    " corp",
    " inc.",
    " ag",
];

const VENDOR_NAMES: [(&str, &str); 14] = [
    ("canon", "Canon"),
    ("nikon", "Nikon"),
    ("sony", "Sony"),
    ("olympus", "Olympus"),
    ("pentax", "Pentax"),
    ("asahi optical", "Pentax"),
    ("leica", "Leica"),
    ("leica camera", "Leica"),
    ("fujifilm", "Fujifilm"),
    ("panasonic", "Panasonic"),
    ("konica minolta", "Minolta"),
    ("minolta", "Minolta"),
    ("eastman kodak", "Kodak"),
    ("kodak", "Kodak"),
];

/// Maps firmware maker strings of one vendor onto a single spelling.
pub fn normalize_make(make: &str) -> String {
    let mut collapsed = collapse_whitespace(make);
    loop {
        let lower = collapsed.to_ascii_lowercase();
        let Some(suffix) = VENDOR_SUFFIXES.iter().find(|suffix| lower.ends_with(*suffix)) else {
            break;
        };
        collapsed.truncate(collapsed.len() - suffix.len());
        collapsed = collapsed.trim_end_matches([',', ' ']).to_string();
    }
    let lower = collapsed.to_ascii_lowercase();
    VENDOR_NAMES
        .iter()
        .find(|(raw, _)| *raw == lower)
        .map(|(_, name)| name.to_string())
        .unwrap_or(collapsed)
}

/// Drops a repeated maker prefix, e.g. `Canon EOS 450D` → `EOS 450D`.
pub fn normalize_model(normalized_make: &str, model: &str) -> String {
    let collapsed = collapse_whitespace(model);
    let prefix_len = normalized_make.len();
    let has_prefix = prefix_len > 0
        && collapsed
            .get(..prefix_len)
            .map(|head| head.eq_ignore_ascii_case(normalized_make))
            .unwrap_or(false)
        && collapsed.as_bytes().get(prefix_len) == Some(&b' ');
    if has_prefix {
        return collapsed[prefix_len + 1..].to_string();
    }
    collapsed
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn has_raw_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(RAW_EXTENSION))
        .unwrap_or(false)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn split_csv_line(line: &str) -> Result<Vec<String>, FivekError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    let mut quoted = false;
    while let Some(ch) = chars.next() {
        match (ch, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if current.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            (other, _) => current.push(other),
        }
    }
    if quoted {
        return Err(FivekError::CameraTable(format!("unterminated quote: {line}")));
    }
    fields.push(current);
    Ok(fields)
}

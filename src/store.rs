use std::fs;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile};
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::{Asset, Basename, Expert, ItemRecord, Split};
use crate::error::FivekError;

/// Directory name used for raw files whose camera could not be identified.
pub const UNKNOWN_CAMERA_DIR: &str = "unknown";

const TEMP_PREFIX: &str = ".fivek-partial";

/// Canonical local layout of the collection.
///
/// ```text
/// <root>
/// ├── raw/<Make_Model>/<basename>.dng
/// ├── processed/tiff16_<e>/<basename>.tif
/// ├── training.json
/// ├── validation.json
/// ├── testing.json
/// └── debugging.json
/// ```
///
/// Every path is a pure function of the item record.
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new() -> Result<Self, FivekError> {
        Ok(Self {
            root: default_root()?,
        })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn raw_root(&self) -> Utf8PathBuf {
        self.root.join("raw")
    }

    pub fn processed_root(&self) -> Utf8PathBuf {
        self.root.join("processed")
    }

    pub fn raw_dir(&self, record: &ItemRecord) -> Utf8PathBuf {
        let camera_dir = record
            .camera
            .as_ref()
            .map(|camera| camera.directory_name())
            .unwrap_or_else(|| UNKNOWN_CAMERA_DIR.to_string());
        self.raw_root().join(camera_dir)
    }

    pub fn raw_path(&self, record: &ItemRecord) -> Utf8PathBuf {
        self.raw_dir(record)
            .join(format!("{}.dng", record.basename.as_str()))
    }

    pub fn expert_path(&self, basename: &Basename, expert: Expert) -> Utf8PathBuf {
        self.processed_root()
            .join(expert.dir_name())
            .join(format!("{}.tif", basename.as_str()))
    }

    pub fn asset_path(&self, record: &ItemRecord, asset: Asset) -> Utf8PathBuf {
        match asset {
            Asset::Raw => self.raw_path(record),
            Asset::Expert(expert) => self.expert_path(&record.basename, expert),
        }
    }

    pub fn index_path(&self, split: Split) -> Utf8PathBuf {
        self.root.join(split.file_name())
    }

    pub fn ensure_root(&self) -> Result<(), FivekError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| FivekError::Filesystem(format!("create {}: {err}", self.root)))
    }

    pub fn is_present(path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FivekError> {
        let mut temp = Self::temp_file_for(path)?;
        std::io::Write::write_all(&mut temp, content).map_err(|err| {
            FivekError::Filesystem(format!("write {}: {err}", temp.path().display()))
        })?;
        Self::persist_temp(temp, path)
    }

    /// Creates an empty temporary file next to `path` so the final rename
    /// stays on one filesystem.
    pub fn temp_file_for(path: &Utf8Path) -> Result<NamedTempFile, FivekError> {
        let parent = path
            .parent()
            .ok_or_else(|| FivekError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FivekError::Filesystem(format!("create {parent}: {err}")))?;
        Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FivekError::Filesystem(format!("temp file in {parent}: {err}")))
    }

    /// Moves a completed temporary file into place. Readers see either the
    /// previous state or the whole file.
    pub fn persist_temp(temp: NamedTempFile, path: &Utf8Path) -> Result<(), FivekError> {
        temp.persist(path.as_std_path())
            .map_err(|err| FivekError::Filesystem(format!("persist {path}: {err}")))?;
        Ok(())
    }

    pub fn is_partial_file(path: &Utf8Path) -> bool {
        path.file_name()
            .map(|name| name.starts_with(TEMP_PREFIX))
            .unwrap_or(false)
    }

    /// Removes temporary files left under `raw/` and `processed/` by an
    /// interrupted run. Files modified within `older_than` may belong to a
    /// live download and are kept. Returns how many were removed.
    pub fn sweep_partials(&self, older_than: Duration) -> Result<usize, FivekError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for dir in [self.raw_root(), self.processed_root()] {
            for entry in WalkDir::new(dir.as_std_path())
                .into_iter()
                .filter_map(|entry| entry.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(path) = Utf8Path::from_path(entry.path()) else {
                    continue;
                };
                if !Self::is_partial_file(path) {
                    continue;
                }
                let stale = entry
                    .metadata()
                    .ok()
                    .and_then(|metadata| metadata.modified().ok())
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age >= older_than);
                if !stale {
                    continue;
                }
                fs::remove_file(path.as_std_path())
                    .map_err(|err| FivekError::Filesystem(format!("remove {path}: {err}")))?;
                debug!(%path, "removed stale partial download");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn default_root() -> Result<Utf8PathBuf, FivekError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("fivek-dataset")
                    .join("MITAboveFiveK"),
            )
            .ok()
        })
        .ok_or_else(|| FivekError::Filesystem("unable to resolve cache directory".to_string()))
}

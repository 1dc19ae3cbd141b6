use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Asset, AssetSet, Basename, ItemRecord};
use crate::error::FivekError;
use crate::remote::RemoteSource;
use crate::store::Layout;

/// Temporary files untouched for this long are leftovers of an interrupted
/// run, not a live download.
pub const STALE_PARTIAL_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives coarse progress from batch acquisition. Called from worker
/// threads.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub pool_size: usize,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            retries: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Stops a running batch from scheduling further files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredFile {
    pub asset: Asset,
    pub url: Option<String>,
    pub path: Utf8PathBuf,
}

/// The files one item needs locally, with their canonical paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub id: u32,
    pub basename: Basename,
    pub files: Vec<RequiredFile>,
}

impl Requirement {
    /// Resolves the requirement from what is already on disk, without any
    /// network access.
    pub fn locate(&self) -> Result<ResolvedFiles, FivekError> {
        let mut files = BTreeMap::new();
        for file in &self.files {
            if !Layout::is_present(&file.path) {
                return Err(FivekError::FileMissing(file.path.to_string()));
            }
            files.insert(file.asset, file.path.clone());
        }
        Ok(ResolvedFiles {
            id: self.id,
            basename: self.basename.clone(),
            files,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFiles {
    pub id: u32,
    pub basename: Basename,
    pub files: BTreeMap<Asset, Utf8PathBuf>,
}

impl ResolvedFiles {
    pub fn path(&self, asset: Asset) -> Option<&Utf8Path> {
        self.files.get(&asset).map(Utf8PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Present,
    Downloaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedFile {
    pub id: u32,
    pub basename: String,
    pub asset: String,
    pub path: String,
    pub action: FileAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub id: u32,
    pub basename: String,
    pub asset: String,
    pub path: String,
    pub reason: String,
    /// A later run may succeed; false for local and permanent errors.
    pub transient: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionReport {
    pub started_at: String,
    pub finished_at: String,
    pub resolved: Vec<ResolvedFile>,
    pub failed: Vec<FailedFile>,
}

impl AcquisitionReport {
    /// Failures a rerun could resolve, as opposed to permanent ones.
    pub fn transient_failures(&self) -> impl Iterator<Item = &FailedFile> {
        self.failed.iter().filter(|file| file.transient)
    }

    pub fn failed_ids(&self) -> BTreeSet<u32> {
        self.failed.iter().map(|file| file.id).collect()
    }

    pub fn downloaded_count(&self) -> usize {
        self.count(FileAction::Downloaded)
    }

    pub fn present_count(&self) -> usize {
        self.count(FileAction::Present)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn count(&self, action: FileAction) -> usize {
        self.resolved
            .iter()
            .filter(|file| file.action == action)
            .count()
    }
}

/// Places requested files at their canonical paths, downloading only what
/// is missing.
pub struct Acquirer<R: RemoteSource> {
    layout: Layout,
    remote: R,
    options: AcquisitionOptions,
    cancel: CancelToken,
    in_flight: Mutex<HashSet<Utf8PathBuf>>,
    released: Condvar,
}

impl<R: RemoteSource> Acquirer<R> {
    pub fn new(layout: Layout, remote: R, options: AcquisitionOptions) -> Self {
        Self {
            layout,
            remote,
            options,
            cancel: CancelToken::default(),
            in_flight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn options(&self) -> &AcquisitionOptions {
        &self.options
    }

    pub fn requirement(&self, record: &ItemRecord, assets: &AssetSet) -> Requirement {
        let files = assets
            .iter()
            .map(|asset| RequiredFile {
                asset,
                url: record.urls.url(asset).map(str::to_string),
                path: self.layout.asset_path(record, asset),
            })
            .collect();
        Requirement {
            id: record.id,
            basename: record.basename.clone(),
            files,
        }
    }

    /// Makes every file of `requirement` present locally.
    pub fn ensure(&self, requirement: &Requirement) -> Result<ResolvedFiles, FivekError> {
        let mut files = BTreeMap::new();
        for file in &requirement.files {
            self.ensure_file(file)
                .map_err(|err| FivekError::Acquisition {
                    target: file.path.to_string(),
                    source: Box::new(err),
                })?;
            files.insert(file.asset, file.path.clone());
        }
        Ok(ResolvedFiles {
            id: requirement.id,
            basename: requirement.basename.clone(),
            files,
        })
    }

    /// Acquires `assets` for every record on a pool of `pool_size` workers.
    ///
    /// Per-file failures land in the report; only a pool that cannot be
    /// started is an error.
    pub fn acquire(
        &self,
        records: &[ItemRecord],
        assets: &AssetSet,
        sink: &dyn ProgressSink,
    ) -> Result<AcquisitionReport, FivekError> {
        let started_at = Utc::now().to_rfc3339();
        let start = Instant::now();
        match self.layout.sweep_partials(STALE_PARTIAL_AGE) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "cleared partial downloads of an earlier run"),
            Err(err) => warn!(error = %err, "could not clear partial downloads"),
        }
        let jobs = records
            .iter()
            .flat_map(|record| {
                self.requirement(record, assets)
                    .files
                    .into_iter()
                    .map(move |file| (record, file))
            })
            .collect::<Vec<_>>();
        let total = jobs.len();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} files for {} items, {} workers",
                total,
                records.len(),
                self.options.pool_size
            ),
            elapsed: None,
        });

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.pool_size.max(1))
            .build()
            .map_err(|err| FivekError::InvalidConfig(format!("worker pool: {err}")))?;
        let done = AtomicUsize::new(0);
        let outcomes = pool.install(|| {
            jobs.par_iter()
                .map(|(record, file)| {
                    let outcome = if self.cancel.is_cancelled() {
                        Err(FivekError::Cancelled(file.path.to_string()))
                    } else {
                        self.ensure_file(file)
                    };
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    let status = match &outcome {
                        Ok(FileAction::Present) => "present",
                        Ok(FileAction::Downloaded) => "downloaded",
                        Err(_) => "failed",
                    };
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Fetch; {finished}/{total} {} {} {status}",
                            record.basename, file.asset
                        ),
                        elapsed: Some(start.elapsed()),
                    });
                    outcome
                })
                .collect::<Vec<_>>()
        });

        let mut resolved = Vec::new();
        let mut failed = Vec::new();
        for ((record, file), outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                Ok(action) => resolved.push(ResolvedFile {
                    id: record.id,
                    basename: record.basename.to_string(),
                    asset: file.asset.to_string(),
                    path: file.path.to_string(),
                    action,
                }),
                Err(err) => failed.push(FailedFile {
                    id: record.id,
                    basename: record.basename.to_string(),
                    asset: file.asset.to_string(),
                    path: file.path.to_string(),
                    reason: err.to_string(),
                    transient: err.is_transient(),
                }),
            }
        }

        let report = AcquisitionReport {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            resolved,
            failed,
        };
        info!(
            files = total,
            downloaded = report.downloaded_count(),
            present = report.present_count(),
            failed = report.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "acquisition finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} downloaded, {} present, {} failed",
                report.downloaded_count(),
                report.present_count(),
                report.failed.len()
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    fn ensure_file(&self, file: &RequiredFile) -> Result<FileAction, FivekError> {
        if Layout::is_present(&file.path) {
            debug!(path = %file.path, "already present");
            return Ok(FileAction::Present);
        }
        let _claim = self.claim(&file.path);
        // another worker may have placed it while we waited
        if Layout::is_present(&file.path) {
            debug!(path = %file.path, "placed by another worker");
            return Ok(FileAction::Present);
        }
        let url = file.url.as_deref().ok_or_else(|| {
            FivekError::FileMissing(format!("{} (no source url for {})", file.path, file.asset))
        })?;
        self.download_with_retries(url, &file.path)?;
        Ok(FileAction::Downloaded)
    }

    fn download_with_retries(&self, url: &str, path: &Utf8Path) -> Result<u64, FivekError> {
        let mut attempt = 0u32;
        loop {
            let temp = Layout::temp_file_for(path)?;
            match self.remote.download(url, temp.path()) {
                Ok(bytes) => {
                    Layout::persist_temp(temp, path)?;
                    debug!(%url, %path, bytes, "downloaded");
                    return Ok(bytes);
                }
                Err(err) if err.is_transient() && attempt < self.options.retries => {
                    drop(temp);
                    attempt += 1;
                    warn!(%url, attempt, error = %err, "transient failure, retrying");
                    thread::sleep(self.options.retry_delay * attempt);
                    if self.cancel.is_cancelled() {
                        return Err(FivekError::Cancelled(path.to_string()));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Blocks until no other worker is fetching `path`, then marks it as
    /// ours until the returned guard drops.
    fn claim(&self, path: &Utf8Path) -> InFlightClaim<'_> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.contains(path) {
            in_flight = self
                .released
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
        in_flight.insert(path.to_path_buf());
        InFlightClaim {
            in_flight: &self.in_flight,
            released: &self.released,
            path: path.to_path_buf(),
        }
    }
}

struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashSet<Utf8PathBuf>>,
    released: &'a Condvar,
    path: Utf8PathBuf,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    /// Fails with a transient status a fixed number of times, then writes.
    struct FlakyRemote {
        failures: u32,
        calls: AtomicUsize,
    }

    impl RemoteSource for FlakyRemote {
        fn download(&self, url: &str, destination: &Path) -> Result<u64, FivekError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            if call < self.failures {
                return Err(FivekError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            std::fs::write(destination, b"payload").unwrap();
            Ok(7)
        }

        fn fetch_text(&self, url: &str) -> Result<String, FivekError> {
            Err(FivekError::Http(url.to_string()))
        }
    }

    fn acquirer(failures: u32, retries: u32) -> (tempfile::TempDir, Acquirer<FlakyRemote>) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let acquirer = Acquirer::new(
            Layout::new_with_root(root),
            FlakyRemote {
                failures,
                calls: AtomicUsize::new(0),
            },
            AcquisitionOptions {
                pool_size: 2,
                retries,
                retry_delay: Duration::ZERO,
            },
        );
        (temp, acquirer)
    }

    #[test]
    fn transient_failures_are_retried() {
        let (_temp, acquirer) = acquirer(2, 3);
        let target = acquirer.layout().root().join("processed/tiff16_a/a0001-x.tif");
        acquirer.download_with_retries("https://example.org/a", &target).unwrap();
        assert_eq!(acquirer.remote().calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(target.as_std_path()).unwrap(), b"payload");
    }

    #[test]
    fn retries_are_bounded() {
        let (_temp, acquirer) = acquirer(10, 2);
        let target = acquirer.layout().root().join("processed/tiff16_a/a0001-x.tif");
        let err = acquirer
            .download_with_retries("https://example.org/a", &target)
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(acquirer.remote().calls.load(Ordering::SeqCst), 3);
        assert!(!target.as_std_path().exists());
    }

    #[test]
    fn claim_is_released_on_drop() {
        let (_temp, acquirer) = acquirer(0, 0);
        let path = Utf8PathBuf::from("/tmp/fivek/a.dng");
        drop(acquirer.claim(&path));
        let again = acquirer.claim(&path);
        assert!(acquirer.in_flight.lock().unwrap().contains(&path));
        drop(again);
        assert!(acquirer.in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_token_is_shared() {
        let (_temp, acquirer) = acquirer(0, 0);
        let token = CancelToken::default();
        let acquirer = acquirer.with_cancel_token(token.clone());
        token.cancel();
        assert!(acquirer.cancel_token().is_cancelled());
    }
}

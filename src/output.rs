use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};

use serde::Serialize;

use crate::acquire::{AcquisitionReport, ProgressEvent, ProgressSink, Requirement};
use crate::domain::{Camera, Categories, ItemRecord, License, Split};
use crate::store::Layout;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraTableResult {
    pub output: String,
    pub visited: usize,
    pub identified: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub root: String,
    pub splits: Vec<BuildSplitEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSplitEntry {
    pub split: Split,
    pub items: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub split: Split,
    pub index: usize,
    pub id: u32,
    pub basename: String,
    pub license: License,
    pub categories: Categories,
    pub camera: Option<Camera>,
    pub files: Vec<InfoFileEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoFileEntry {
    pub asset: String,
    pub path: String,
    pub url: Option<String>,
    pub present: bool,
}

impl InfoResult {
    pub fn new(split: Split, index: usize, record: &ItemRecord, requirement: &Requirement) -> Self {
        Self {
            split,
            index,
            id: record.id,
            basename: record.basename.to_string(),
            license: record.license,
            categories: record.categories.clone(),
            camera: record.camera.clone(),
            files: requirement
                .files
                .iter()
                .map(|file| InfoFileEntry {
                    asset: file.asset.to_string(),
                    path: file.path.to_string(),
                    url: file.url.clone(),
                    present: Layout::is_present(&file.path),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoriesResult {
    pub split: Split,
    pub categories: BTreeMap<&'static str, BTreeSet<String>>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_camera_table(result: &CameraTableResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_build(result: &BuildResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(report: &AcquisitionReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_categories(result: &CategoriesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Writes progress lines to stderr, leaving stdout for results.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr().lock();
        let _ = match event.elapsed {
            Some(elapsed) => {
                writeln!(stderr, "[{:>6.1}s] {}", elapsed.as_secs_f64(), event.message)
            }
            None => writeln!(stderr, "          {}", event.message),
        };
    }
}

pub fn print_report_summary(report: &AcquisitionReport) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}FiveK acquisition summary{reset}");
    println!("{green}downloaded: {}{reset}", report.downloaded_count());
    println!("{green}already present: {}{reset}", report.present_count());
    if report.is_complete() {
        return;
    }
    println!(
        "{red}failed: {} files across {} items ({} retryable){reset}",
        report.failed.len(),
        report.failed_ids().len(),
        report.transient_failures().count()
    );
    for file in &report.failed {
        let kind = if file.transient { "transient" } else { "permanent" };
        println!("{red}  {} {} [{kind}]: {}{reset}", file.basename, file.asset, file.reason);
    }
}

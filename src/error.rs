use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FivekError {
    #[error("invalid basename: {0}")]
    InvalidBasename(String),

    #[error("invalid split: {0} (expected train, val, test or debug)")]
    InvalidSplit(String),

    #[error("invalid asset: {0} (expected raw, a, b, c, d or e)")]
    InvalidAsset(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}")]
    HttpStatus { status: u16, url: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("malformed camera table: {0}")]
    CameraTable(String),

    #[error("malformed annotation source: {0}")]
    Annotation(String),

    #[error("{0} is not listed in either license list")]
    #[diagnostic(help("filesAdobe.txt and filesAdobeMIT.txt must cover every item"))]
    LicenseCoverage(String),

    #[error("{0} appears in more than one split")]
    PartitionViolation(String),

    #[error("split index not found locally: {0}")]
    #[diagnostic(help("build the index or enable download to fetch the published one"))]
    IndexNotFound(String),

    #[error("failed to parse split index: {0}")]
    IndexParse(String),

    #[error("index {index} out of range for split of {len} items")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("file not present locally: {0}")]
    #[diagnostic(help("enable download to acquire missing files"))]
    FileMissing(String),

    #[error("failed to acquire {target}: {source}")]
    Acquisition {
        target: String,
        #[source]
        source: Box<FivekError>,
    },

    #[error("{failed} files of {items} items in {target} were not acquired")]
    #[diagnostic(help("rerun to retry; files already placed are kept"))]
    IncompleteAcquisition {
        target: String,
        failed: usize,
        items: usize,
    },

    #[error("acquisition cancelled before {0} was scheduled")]
    Cancelled(String),
}

impl FivekError {
    /// Whether a retry of the same fetch could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FivekError::Http(_) | FivekError::HttpStatus { .. } => true,
            FivekError::Acquisition { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        assert!(FivekError::Http("connection reset".to_string()).is_transient());
        assert!(
            FivekError::HttpStatus {
                status: 503,
                url: "https://example.org/a.dng".to_string()
            }
            .is_transient()
        );
        assert!(!FivekError::Filesystem("disk full".to_string()).is_transient());
        assert!(!FivekError::Cancelled("a0001".to_string()).is_transient());
    }

    #[test]
    fn acquisition_keeps_the_kind_of_its_cause() {
        let wrap = |source: FivekError| FivekError::Acquisition {
            target: "raw/unknown/a0001-x.dng".to_string(),
            source: Box::new(source),
        };
        assert!(wrap(FivekError::Http("timed out".to_string())).is_transient());
        assert!(!wrap(FivekError::Filesystem("no space left".to_string())).is_transient());
    }
}

use std::fs;
use std::path::Path;

use camino::Utf8PathBuf;

use fivek_dataset::camera::{CameraTable, RawIdentity, RawProbe};
use fivek_dataset::error::FivekError;

/// Reads "make|model" from the file body.
struct BodyProbe;

impl RawProbe for BodyProbe {
    fn identify(&self, path: &Path) -> Result<RawIdentity, FivekError> {
        let body = fs::read_to_string(path).map_err(|err| FivekError::Filesystem(err.to_string()))?;
        let (make, model) = body.split_once('|').ok_or_else(|| {
            FivekError::CameraTable(format!("{}: no identification", path.display()))
        })?;
        Ok(RawIdentity::from_raw(make, model))
    }
}

#[test]
fn scanned_table_round_trips_through_disk() {
    let temp = tempfile::tempdir().unwrap();
    let raw = temp.path().join("fivek_dataset").join("raw_photos");
    fs::create_dir_all(raw.join("HQa1to700")).unwrap();
    fs::create_dir_all(raw.join("HQa701to1400")).unwrap();
    fs::write(raw.join("HQa1to700/a0298-IMG_5043.dng"), "Canon|Canon EOS 450D").unwrap();
    fs::write(raw.join("HQa701to1400/a1384-dvf_095.dng"), "NIKON CORPORATION|NIKON D70").unwrap();
    fs::write(raw.join("HQa701to1400/a1385-broken.dng"), "garbage").unwrap();

    let scan = CameraTable::scan(&raw, &BodyProbe).unwrap();
    assert_eq!((scan.visited, scan.skipped), (3, 1));

    let output = Utf8PathBuf::from_path_buf(temp.path().join("out").join("camera.csv")).unwrap();
    CameraTable::from_scan(scan).write_csv(&output).unwrap();
    let cameras = CameraTable::read_csv(output.as_std_path()).unwrap().by_file_id();

    assert_eq!(cameras.len(), 2);
    assert_eq!(cameras["a0298-IMG_5043"].directory_name(), "Canon_EOS_450D");
    let nikon = &cameras["a1384-dvf_095"];
    assert_eq!(nikon.make, "NIKON CORPORATION");
    assert_eq!(nikon.directory_name(), "Nikon_D70");
    assert!(!cameras.contains_key("a1385-broken"));
}

#[test]
fn missing_raw_directory_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    assert!(CameraTable::scan(&temp.path().join("absent"), &BodyProbe).is_err());
}

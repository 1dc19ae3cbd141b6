use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use rayon::prelude::*;

use fivek_dataset::acquire::AcquisitionOptions;
use fivek_dataset::dataset::{Dataset, DatasetOptions, ResolvedItem};
use fivek_dataset::domain::{
    Asset, AssetSet, Basename, Camera, Categories, Expert, ItemRecord, License, SourceUrls, Split,
};
use fivek_dataset::error::FivekError;
use fivek_dataset::index::{
    Assignments, IndexBuilder, IndexInputs, IndexStore, SplitIndex, SplitRatios,
};
use fivek_dataset::remote::RemoteSource;
use fivek_dataset::store::Layout;

const ARCHIVE: &str = "https://mock.example/fivek";
const PUBLISHED: &str = "https://mock.example/index";

#[derive(Default)]
struct MockRemote {
    downloads: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
    document: Option<String>,
}

impl MockRemote {
    fn downloads(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl RemoteSource for MockRemote {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, FivekError> {
        self.downloads.lock().unwrap().push(url.to_string());
        fs::write(destination, url.as_bytes()).unwrap();
        Ok(url.len() as u64)
    }

    fn fetch_text(&self, url: &str) -> Result<String, FivekError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.document.clone().ok_or_else(|| FivekError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

fn record(basename: &str, camera: Option<(&str, &str)>, location: Option<&str>) -> ItemRecord {
    let basename: Basename = basename.parse().unwrap();
    ItemRecord {
        id: basename.item_id(),
        urls: SourceUrls::for_archive(ARCHIVE, &basename),
        basename,
        license: License::Adobe,
        categories: Categories {
            location: location.map(str::to_string),
            time: Some("day".to_string()),
            light: None,
            subject: Some("nature".to_string()),
        },
        camera: camera.map(|(make, model)| Camera {
            make: make.to_string(),
            model: model.to_string(),
            normalized_make: None,
            normalized_model: None,
        }),
    }
}

fn val_records() -> Vec<ItemRecord> {
    vec![
        record("a0012-kme_0012", Some(("Nikon", "D70")), Some("outdoor")),
        record("a1384-dvf_095", Some(("Canon", "EOS 450D")), Some("indoor")),
        record("a2077-unknown", None, None),
    ]
}

fn options(root: &Utf8PathBuf, experts: &[Expert], download: bool) -> DatasetOptions {
    DatasetOptions {
        root: root.clone(),
        split: Split::Val,
        assets: AssetSet::new(true, experts),
        download,
        acquisition: AcquisitionOptions {
            pool_size: 2,
            retries: 0,
            retry_delay: Duration::ZERO,
        },
        index_base_url: PUBLISHED.to_string(),
    }
}

fn seeded_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("MITAboveFiveK")).unwrap();
    let store = IndexStore::new(Layout::new_with_root(root.clone()));
    store
        .save(&SplitIndex::new(Split::Val, val_records()))
        .unwrap();
    (temp, root)
}

#[test]
fn item_1384_resolves_raw_and_expert_c() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[Expert::C], true), MockRemote::default()).unwrap();
    let basename: Basename = "a1384-dvf_095".parse().unwrap();
    let position = dataset.index().position(&basename).unwrap();

    let item = dataset.get(position).unwrap();

    assert_eq!(item.id, 1384);
    assert_eq!(item.categories.location.as_deref(), Some("indoor"));
    let raw = item.path(Asset::Raw).unwrap();
    let expert = item.path(Asset::Expert(Expert::C)).unwrap();
    assert_eq!(raw.to_path_buf(), root.join("raw/Canon_EOS_450D/a1384-dvf_095.dng"));
    assert_eq!(expert.to_path_buf(), root.join("processed/tiff16_c/a1384-dvf_095.tif"));
    assert!(raw.as_std_path().is_file());
    assert!(expert.as_std_path().is_file());
    assert_eq!(item.files.len(), 2);
    assert_eq!(dataset.acquirer().remote().downloads(), 2);

    // a second read finds everything in place
    dataset.get(position).unwrap();
    assert_eq!(dataset.acquirer().remote().downloads(), 2);
}

#[test]
fn unknown_camera_lands_in_unknown_directory() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[], true), MockRemote::default()).unwrap();

    let item = dataset.get(2).unwrap();

    assert_eq!(item.camera, None);
    assert_eq!(
        item.path(Asset::Raw).unwrap().to_path_buf(),
        root.join("raw/unknown/a2077-unknown.dng")
    );
}

#[test]
fn missing_file_without_download_is_an_error() {
    let (_temp, root) = seeded_root();
    let dataset =
        Dataset::open(options(&root, &[Expert::A], false), MockRemote::default()).unwrap();

    assert_matches!(dataset.get(0), Err(FivekError::FileMissing(_)));
    assert_eq!(dataset.acquirer().remote().downloads(), 0);
}

#[test]
fn out_of_range_reads_fail() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[], false), MockRemote::default()).unwrap();

    assert_matches!(
        dataset.get(3),
        Err(FivekError::IndexOutOfRange { index: 3, len: 3 })
    );
}

#[test]
fn resolve_touches_nothing() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[Expert::E], true), MockRemote::default()).unwrap();

    let requirement = dataset.resolve(0).unwrap();

    assert_eq!(requirement.files.len(), 2);
    assert!(requirement.files.iter().all(|file| !file.path.as_std_path().exists()));
    assert_eq!(dataset.acquirer().remote().downloads(), 0);
}

#[test]
fn transform_is_applied_in_every_read_path() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[], true), MockRemote::default())
        .unwrap()
        .with_transform(|item: ResolvedItem| item.basename.to_string());

    let first = dataset.iter().collect::<Result<Vec<_>, _>>().unwrap();
    let again = dataset.iter().collect::<Result<Vec<_>, _>>().unwrap();
    let parallel = dataset.par_iter().collect::<Result<Vec<_>, _>>().unwrap();
    let loaded = dataset.load_all().unwrap();

    assert_eq!(first, vec!["a0012-kme_0012", "a1384-dvf_095", "a2077-unknown"]);
    assert_eq!(first, again);
    assert_eq!(first, parallel);
    assert_eq!(first, loaded);
    assert_eq!(dataset.iter().len(), 3);
    assert_eq!(dataset.acquirer().remote().downloads(), 3);
}

#[test]
fn categories_are_sorted_and_unique() {
    let (_temp, root) = seeded_root();
    let dataset = Dataset::open(options(&root, &[], false), MockRemote::default()).unwrap();

    let categories = dataset.all_categories();

    assert_eq!(
        categories["location"].iter().collect::<Vec<_>>(),
        vec!["indoor", "outdoor"]
    );
    assert_eq!(categories["time"].len(), 1);
    assert!(categories["light"].is_empty());
}

#[test]
fn missing_index_without_download_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    let result = Dataset::open(options(&root, &[], false), MockRemote::default());

    assert_matches!(result.err(), Some(FivekError::IndexNotFound(_)));
}

#[test]
fn missing_index_is_fetched_from_published_location() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let document = r#"{
        "a0005-jn_2007_05_10__564": {
            "id": 5,
            "urls": {"dng": "https://mock.example/fivek/img/dng/a0005-jn_2007_05_10__564.dng",
                     "tiff16": {"c": "https://mock.example/fivek/img/tiff16_c/a0005-jn_2007_05_10__564.tif"}},
            "categories": {"location": "outdoor", "time": "day", "light": "sun_sky", "subject": "nature"},
            "license": "Adobe",
            "camera": {"make": "Nikon", "model": "D70"}
        }
    }"#;
    let remote = MockRemote {
        document: Some(document.to_string()),
        ..MockRemote::default()
    };

    let dataset = Dataset::open(options(&root, &[Expert::C], true), remote).unwrap();

    assert_eq!(dataset.len(), 1);
    assert_eq!(
        dataset.acquirer().remote().fetched.lock().unwrap().as_slice(),
        ["https://mock.example/index/validation.json"]
    );
    assert!(root.join("validation.json").as_std_path().is_file());
    let item = dataset.get(0).unwrap();
    assert_eq!(
        item.path(Asset::Expert(Expert::C)).unwrap().to_path_buf(),
        root.join("processed/tiff16_c/a0005-jn_2007_05_10__564.tif")
    );
}

#[test]
fn adobe_item_1384_with_two_experts() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("MITAboveFiveK")).unwrap();
    let name = |value: &str| value.parse::<Basename>().unwrap();
    let item_1384 = name("a1384-dvf_095");
    let inputs = IndexInputs {
        categories: HashMap::from([(
            item_1384.clone(),
            Categories {
                location: Some("outdoor".to_string()),
                time: Some("day".to_string()),
                light: Some("sun_sky".to_string()),
                subject: Some("nature".to_string()),
            },
        )]),
        adobe: vec![item_1384.clone()],
        adobe_mit: vec![name("a0012-kme_0012"), name("a2077-unknown")],
        cameras: HashMap::from([(
            item_1384.clone(),
            Camera {
                make: "Leica".to_string(),
                model: "M8".to_string(),
                normalized_make: None,
                normalized_model: None,
            },
        )]),
    };
    let all_train = SplitRatios {
        train: 1.0,
        val: 0.0,
    };
    let built = IndexBuilder::new(ARCHIVE, all_train)
        .unwrap()
        .build(&inputs, &Assignments::default())
        .unwrap();
    IndexStore::new(Layout::new_with_root(root.clone()))
        .save_all(&built)
        .unwrap();
    let mut train_options = options(&root, &[Expert::A, Expert::C], true);
    train_options.split = Split::Train;
    let dataset = Dataset::open(train_options, MockRemote::default()).unwrap();
    assert_eq!(dataset.len(), 3);
    let position = dataset.index().position(&item_1384).unwrap();

    let item = dataset.get(position).unwrap();

    assert_eq!(item.id, 1384);
    assert_eq!(item.license, License::Adobe);
    assert_eq!(item.categories.light.as_deref(), Some("sun_sky"));
    assert_eq!(
        item.path(Asset::Raw).unwrap().to_path_buf(),
        root.join("raw/Leica_M8/a1384-dvf_095.dng")
    );
    let experts = item
        .files
        .keys()
        .filter_map(|asset| match asset {
            Asset::Expert(expert) => Some(*expert),
            Asset::Raw => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(experts, vec![Expert::A, Expert::C]);
    for expert in [Expert::B, Expert::D, Expert::E] {
        assert!(item.path(Asset::Expert(expert)).is_none());
    }
    assert_eq!(
        item.path(Asset::Expert(Expert::A)).unwrap().to_path_buf(),
        root.join("processed/tiff16_a/a1384-dvf_095.tif")
    );
    assert_eq!(dataset.acquirer().remote().downloads(), 3);
}

#[test]
fn unknown_camera_serves_expert_only_requests() {
    let (_temp, root) = seeded_root();
    let mut expert_options = options(&root, &[Expert::B], true);
    expert_options.assets = AssetSet::new(false, &[Expert::B]);
    let expert_only = Dataset::open(expert_options, MockRemote::default()).unwrap();
    assert_eq!(expert_only.record(2).unwrap().camera, None);

    let item = expert_only.get(2).unwrap();

    assert_eq!(item.camera, None);
    assert_eq!(item.files.len(), 1);
    assert!(item.path(Asset::Raw).is_none());
    assert!(item.path(Asset::Expert(Expert::B)).unwrap().as_std_path().is_file());
    assert!(!root.join("raw").as_std_path().exists());
    assert_eq!(expert_only.acquirer().remote().downloads(), 1);
}

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::camera::CameraTable;
use crate::domain::{
    Basename, Camera, Categories, DEBUG_SPLIT_SIZE, ItemRecord, License, SourceUrls, Split,
};
use crate::error::FivekError;
use crate::remote::RemoteSource;
use crate::store::Layout;

pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Where a text input of the index builder lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Url(String),
    Path(Utf8PathBuf),
}

impl SourceLocation {
    pub fn read_text(&self, remote: &dyn RemoteSource) -> Result<String, FivekError> {
        match self {
            SourceLocation::Url(url) => remote.fetch_text(url),
            SourceLocation::Path(path) => fs::read_to_string(path.as_std_path())
                .map_err(|err| FivekError::Filesystem(format!("read {path}: {err}"))),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Url(url) => write!(f, "{url}"),
            SourceLocation::Path(path) => write!(f, "{path}"),
        }
    }
}

impl FromStr for SourceLocation {
    type Err = FivekError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(FivekError::InvalidConfig("empty source location".to_string()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(SourceLocation::Url(trimmed.to_string()));
        }
        Ok(SourceLocation::Path(Utf8PathBuf::from(trimmed)))
    }
}

#[derive(Debug, Clone)]
pub struct IndexSources {
    pub categories: SourceLocation,
    pub adobe_list: SourceLocation,
    pub adobe_mit_list: SourceLocation,
    pub camera_table: SourceLocation,
}

impl IndexSources {
    pub fn load(&self, remote: &dyn RemoteSource) -> Result<IndexInputs, FivekError> {
        let categories = parse_categories(&self.categories.read_text(remote)?)?;
        let adobe = parse_file_list(&self.adobe_list.read_text(remote)?)?;
        let adobe_mit = parse_file_list(&self.adobe_mit_list.read_text(remote)?)?;
        let table = CameraTable::parse_csv(&self.camera_table.read_text(remote)?)?;

        let mut cameras = HashMap::new();
        for (file_id, camera) in table.by_file_id() {
            match file_id.parse::<Basename>() {
                Ok(basename) => {
                    cameras.insert(basename, camera);
                }
                Err(_) => warn!(%file_id, "ignoring camera row with unrecognised file id"),
            }
        }

        Ok(IndexInputs {
            categories,
            adobe,
            adobe_mit,
            cameras,
        })
    }
}

/// Parsed builder inputs, keyed by basename.
#[derive(Debug, Clone, Default)]
pub struct IndexInputs {
    pub categories: HashMap<Basename, Categories>,
    pub adobe: Vec<Basename>,
    pub adobe_mit: Vec<Basename>,
    pub cameras: HashMap<Basename, Camera>,
}

/// Parses `categories.txt`: `basename,location,time,light,subject` per line.
/// `None` and empty cells are unset.
pub fn parse_categories(text: &str) -> Result<HashMap<Basename, Categories>, FivekError> {
    let mut categories = HashMap::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
        if fields.len() != 5 {
            return Err(FivekError::Annotation(format!(
                "categories line {} has {} fields",
                number + 1,
                fields.len()
            )));
        }
        let basename: Basename = fields[0].parse()?;
        let value = |index: usize| {
            let cell = fields[index];
            (!cell.is_empty() && cell != "None").then(|| cell.to_string())
        };
        categories.insert(
            basename,
            Categories {
                location: value(1),
                time: value(2),
                light: value(3),
                subject: value(4),
            },
        );
    }
    Ok(categories)
}

/// Parses a license membership list: one basename per line.
pub fn parse_file_list(text: &str) -> Result<Vec<Basename>, FivekError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.1,
        }
    }
}

impl SplitRatios {
    pub fn validate(&self) -> Result<(), FivekError> {
        let in_range = |value: f64| (0.0..=1.0).contains(&value);
        if !in_range(self.train) || !in_range(self.val) || self.train + self.val > 1.0 {
            return Err(FivekError::InvalidConfig(format!(
                "split ratios train={} val={} must be within [0, 1] and sum to at most 1",
                self.train, self.val
            )));
        }
        Ok(())
    }

    /// Stable split for a basename that has never been assigned before.
    fn assign(&self, basename: &Basename) -> Split {
        let digest = Sha256::digest(basename.as_str().as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        // 53 bits keep the fraction exact and below 1.0
        let position = (u64::from_be_bytes(bucket) >> 11) as f64 / (1u64 << 53) as f64;
        if position < self.train {
            Split::Train
        } else if position < self.train + self.val {
            Split::Val
        } else {
            Split::Test
        }
    }
}

/// Ordered records of one split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndex {
    split: Split,
    items: Vec<ItemRecord>,
}

impl SplitIndex {
    pub fn new(split: Split, mut items: Vec<ItemRecord>) -> Self {
        items.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.basename.cmp(&b.basename)));
        Self { split, items }
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ItemRecord> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[ItemRecord] {
        &self.items
    }

    pub fn position(&self, basename: &Basename) -> Option<usize> {
        self.items
            .iter()
            .position(|item| &item.basename == basename)
    }
}

#[derive(Debug, Clone)]
pub struct BuiltIndex {
    splits: BTreeMap<Split, SplitIndex>,
}

impl BuiltIndex {
    pub fn split(&self, split: Split) -> Option<&SplitIndex> {
        self.splits.get(&split)
    }

    pub fn splits(&self) -> impl Iterator<Item = &SplitIndex> {
        self.splits.values()
    }

    pub fn total_items(&self) -> usize {
        Split::PARTITIONED
            .iter()
            .filter_map(|split| self.splits.get(split))
            .map(SplitIndex::len)
            .sum()
    }
}

/// Split membership persisted by an earlier build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignments {
    pub splits: BTreeMap<Basename, Split>,
    pub debug: BTreeSet<Basename>,
}

impl Assignments {
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty() && self.debug.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IndexBuilder {
    archive_base_url: String,
    ratios: SplitRatios,
}

impl IndexBuilder {
    pub fn new(
        archive_base_url: impl Into<String>,
        ratios: SplitRatios,
    ) -> Result<Self, FivekError> {
        ratios.validate()?;
        Ok(Self {
            archive_base_url: archive_base_url.into(),
            ratios,
        })
    }

    /// Joins the inputs into one record per item and partitions them.
    ///
    /// Items listed in `previous` keep that split; new items get a stable
    /// hash-based one. Debug members that are still in train stay in debug.
    pub fn build(
        &self,
        inputs: &IndexInputs,
        previous: &Assignments,
    ) -> Result<BuiltIndex, FivekError> {
        let mut licenses = HashMap::new();
        for basename in &inputs.adobe_mit {
            licenses.insert(basename.clone(), License::AdobeMIT);
        }
        for basename in &inputs.adobe {
            if licenses.insert(basename.clone(), License::Adobe) == Some(License::AdobeMIT) {
                warn!(%basename, "listed under both licenses; keeping Adobe");
            }
        }

        let universe: BTreeSet<&Basename> = licenses
            .keys()
            .chain(inputs.categories.keys())
            .chain(inputs.cameras.keys())
            .collect();

        let mut partitioned: BTreeMap<Split, Vec<ItemRecord>> = BTreeMap::new();
        for basename in universe {
            let license = *licenses
                .get(basename)
                .ok_or_else(|| FivekError::LicenseCoverage(basename.to_string()))?;
            let categories = inputs.categories.get(basename).cloned();
            let camera = inputs.cameras.get(basename).cloned();
            if categories.is_none() {
                debug!(%basename, "no category annotation");
            }
            if camera.is_none() {
                debug!(%basename, "no camera identification");
            }
            let record = ItemRecord {
                id: basename.item_id(),
                basename: basename.clone(),
                license,
                categories: categories.unwrap_or_default(),
                camera,
                urls: SourceUrls::for_archive(&self.archive_base_url, basename),
            };
            let split = previous
                .splits
                .get(basename)
                .copied()
                .filter(|split| *split != Split::Debug)
                .unwrap_or_else(|| self.ratios.assign(basename));
            partitioned.entry(split).or_default().push(record);
        }

        let mut splits = BTreeMap::new();
        for split in Split::PARTITIONED {
            let items = partitioned.remove(&split).unwrap_or_default();
            splits.insert(split, SplitIndex::new(split, items));
        }
        let debug_items = splits
            .get(&Split::Train)
            .map(|train| select_debug(train, &previous.debug))
            .unwrap_or_default();
        splits.insert(Split::Debug, SplitIndex::new(Split::Debug, debug_items));

        let built = BuiltIndex { splits };
        info!(
            items = built.total_items(),
            train = built.split(Split::Train).map(SplitIndex::len).unwrap_or(0),
            val = built.split(Split::Val).map(SplitIndex::len).unwrap_or(0),
            test = built.split(Split::Test).map(SplitIndex::len).unwrap_or(0),
            "index built"
        );
        Ok(built)
    }
}

/// Keeps the persisted members still in train, then fills up to
/// `DEBUG_SPLIT_SIZE` from train in id order.
fn select_debug(train: &SplitIndex, members: &BTreeSet<Basename>) -> Vec<ItemRecord> {
    let mut selected: Vec<ItemRecord> = train
        .items()
        .iter()
        .filter(|item| members.contains(&item.basename))
        .take(DEBUG_SPLIT_SIZE)
        .cloned()
        .collect();
    if selected.len() < members.len().min(DEBUG_SPLIT_SIZE) {
        warn!(
            kept = selected.len(),
            persisted = members.len(),
            "debug members left train; refilling"
        );
    }
    let missing = DEBUG_SPLIT_SIZE - selected.len();
    selected.extend(
        train
            .items()
            .iter()
            .filter(|item| !members.contains(&item.basename))
            .take(missing)
            .cloned(),
    );
    selected
}

/// Every basename sits in at most one of train/val/test, and debug is
/// drawn from train.
pub fn check_partition(indexes: &[&SplitIndex]) -> Result<(), FivekError> {
    let mut seen: HashSet<&Basename> = HashSet::new();
    let mut train: HashSet<&Basename> = HashSet::new();
    for index in indexes.iter().filter(|index| index.split() != Split::Debug) {
        for item in index.items() {
            if !seen.insert(&item.basename) {
                return Err(FivekError::PartitionViolation(item.basename.to_string()));
            }
            if index.split() == Split::Train {
                train.insert(&item.basename);
            }
        }
    }
    for index in indexes.iter().filter(|index| index.split() == Split::Debug) {
        if let Some(item) = index.items().iter().find(|item| !train.contains(&item.basename)) {
            return Err(FivekError::PartitionViolation(format!(
                "{} is in debug but not in train",
                item.basename
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct SplitDocument {
    schema_version: u32,
    split: Split,
    items: Vec<ItemRecord>,
}

/// Record shape of the published documents, keyed by basename.
#[derive(Debug, Deserialize)]
struct KeyedRecord {
    #[serde(default)]
    id: Option<u32>,
    license: License,
    #[serde(default)]
    categories: Categories,
    #[serde(default)]
    camera: Option<Camera>,
    urls: SourceUrls,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IndexDocument {
    Listed(SplitDocument),
    Keyed(BTreeMap<Basename, KeyedRecord>),
}

/// Reads and writes split documents under the layout root.
#[derive(Debug, Clone)]
pub struct IndexStore {
    layout: Layout,
}

impl IndexStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn exists(&self, split: Split) -> bool {
        Layout::is_present(&self.layout.index_path(split))
    }

    pub fn save(&self, index: &SplitIndex) -> Result<(), FivekError> {
        let document = SplitDocument {
            schema_version: INDEX_SCHEMA_VERSION,
            split: index.split(),
            items: index.items().to_vec(),
        };
        let mut content = serde_json::to_vec_pretty(&document)
            .map_err(|err| FivekError::IndexParse(err.to_string()))?;
        content.push(b'\n');
        Layout::write_bytes_atomic(&self.layout.index_path(index.split()), &content)
    }

    pub fn save_all(&self, built: &BuiltIndex) -> Result<(), FivekError> {
        self.layout.ensure_root()?;
        for index in built.splits() {
            self.save(index)?;
        }
        Ok(())
    }

    pub fn load(&self, split: Split) -> Result<SplitIndex, FivekError> {
        let path = self.layout.index_path(split);
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FivekError::IndexNotFound(path.to_string()));
            }
            Err(err) => return Err(FivekError::Filesystem(format!("read {path}: {err}"))),
        };
        parse_document(split, &content)
    }

    /// Current split of every persisted item, plus the debug membership.
    pub fn load_assignments(&self) -> Result<Assignments, FivekError> {
        let mut assignments = Assignments::default();
        for split in Split::PARTITIONED {
            if !self.exists(split) {
                continue;
            }
            for item in self.load(split)?.items() {
                assignments.splits.insert(item.basename.clone(), split);
            }
        }
        if self.exists(Split::Debug) {
            assignments.debug = self
                .load(Split::Debug)?
                .items()
                .iter()
                .map(|item| item.basename.clone())
                .collect();
        }
        Ok(assignments)
    }

    /// Downloads the published document for `split` and stores it in the
    /// current format.
    pub fn fetch_published(
        &self,
        split: Split,
        index_base_url: &str,
        remote: &dyn RemoteSource,
    ) -> Result<SplitIndex, FivekError> {
        let url = format!(
            "{}/{}",
            index_base_url.trim_end_matches('/'),
            split.file_name()
        );
        info!(%split, %url, "fetching published split index");
        let content = remote.fetch_text(&url)?;
        let index = parse_document(split, &content)?;
        self.layout.ensure_root()?;
        self.save(&index)?;
        Ok(index)
    }
}

fn parse_document(split: Split, content: &str) -> Result<SplitIndex, FivekError> {
    let document: IndexDocument = serde_json::from_str(content)
        .map_err(|err| FivekError::IndexParse(format!("{}: {err}", split.file_name())))?;
    let items = match document {
        IndexDocument::Listed(document) => {
            if document.split != split {
                return Err(FivekError::IndexParse(format!(
                    "{} holds the {} split",
                    split.file_name(),
                    document.split
                )));
            }
            document.items
        }
        IndexDocument::Keyed(records) => records
            .into_iter()
            .map(|(basename, record)| ItemRecord {
                id: record.id.unwrap_or_else(|| basename.item_id()),
                basename,
                license: record.license,
                categories: record.categories,
                camera: record.camera,
                urls: record.urls,
            })
            .collect(),
    };
    Ok(SplitIndex::new(split, items))
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FivekError;

/// Highest item id in the collection.
pub const MAX_ITEM_ID: u32 = 5000;

/// Number of `train` items mirrored into the `debug` split.
pub const DEBUG_SPLIT_SIZE: usize = 9;

static BASENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^a(\d{4})-[A-Za-z0-9_.\-]+$").expect("basename pattern is a valid regex")
});

/// Stable file stem shared by the raw capture and all of its derivatives,
/// e.g. `a0001-jmac_DSC1459`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Basename(String);

impl Basename {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn item_id(&self) -> u32 {
        // validated in FromStr
        self.0[1..5].parse().unwrap_or(0)
    }
}

impl fmt::Display for Basename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Basename {
    type Err = FivekError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let id = BASENAME_RE
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .and_then(|digits| digits.as_str().parse::<u32>().ok())
            .ok_or_else(|| FivekError::InvalidBasename(value.to_string()))?;
        if id == 0 || id > MAX_ITEM_ID {
            return Err(FivekError::InvalidBasename(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for Basename {
    type Error = FivekError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Basename> for String {
    fn from(value: Basename) -> Self {
        value.0
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Expert {
    A,
    B,
    C,
    D,
    E,
}

impl Expert {
    pub const ALL: [Expert; 5] = [Expert::A, Expert::B, Expert::C, Expert::D, Expert::E];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expert::A => "a",
            Expert::B => "b",
            Expert::C => "c",
            Expert::D => "d",
            Expert::E => "e",
        }
    }

    pub fn dir_name(&self) -> String {
        format!("tiff16_{}", self.as_str())
    }
}

impl fmt::Display for Expert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Expert {
    type Err = FivekError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Expert::A),
            "b" => Ok(Expert::B),
            "c" => Ok(Expert::C),
            "d" => Ok(Expert::D),
            "e" => Ok(Expert::E),
            _ => Err(FivekError::InvalidAsset(value.to_string())),
        }
    }
}

/// One downloadable file of an item: the DNG capture or one expert TIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Asset {
    Raw,
    Expert(Expert),
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Raw => write!(f, "raw"),
            Asset::Expert(expert) => write!(f, "{}", expert.dir_name()),
        }
    }
}

impl FromStr for Asset {
    type Err = FivekError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "raw" | "dng" => Ok(Asset::Raw),
            other => other
                .strip_prefix("tiff16_")
                .unwrap_or(other)
                .parse()
                .map(Asset::Expert)
                .map_err(|_| FivekError::InvalidAsset(value.to_string())),
        }
    }
}

/// The assets requested for every item of a view or batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetSet(BTreeSet<Asset>);

impl AssetSet {
    pub fn new(include_raw: bool, experts: &[Expert]) -> Self {
        let mut assets = BTreeSet::new();
        if include_raw {
            assets.insert(Asset::Raw);
        }
        assets.extend(experts.iter().copied().map(Asset::Expert));
        Self(assets)
    }

    pub fn contains(&self, asset: Asset) -> bool {
        self.0.contains(&asset)
    }

    pub fn includes_raw(&self) -> bool {
        self.contains(Asset::Raw)
    }

    pub fn experts(&self) -> impl Iterator<Item = Expert> + '_ {
        self.0.iter().filter_map(|asset| match asset {
            Asset::Expert(expert) => Some(*expert),
            Asset::Raw => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Asset> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Asset> for AssetSet {
    fn from_iter<T: IntoIterator<Item = Asset>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum License {
    Adobe,
    AdobeMIT,
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            License::Adobe => write!(f, "Adobe"),
            License::AdobeMIT => write!(f, "AdobeMIT"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Categories {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub light: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

impl Categories {
    pub const KEYS: [&'static str; 4] = ["location", "time", "light", "subject"];

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "location" => self.location.as_deref(),
            "time" => self.time.as_deref(),
            "light" => self.light.as_deref(),
            "subject" => self.subject.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Camera {
    pub make: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_model: Option<String>,
}

impl Camera {
    /// Directory holding this camera's raw files, e.g. `Canon_EOS_450D`.
    pub fn directory_name(&self) -> String {
        let make = self.normalized_make.as_deref().unwrap_or(&self.make);
        let model = self.normalized_model.as_deref().unwrap_or(&self.model);
        format!("{}_{}", make.trim(), model.trim())
            .chars()
            .map(|ch| match ch {
                ' ' | '/' | '\\' | ':' => '_',
                other => other,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUrls {
    pub dng: String,
    #[serde(default)]
    pub tiff16: BTreeMap<Expert, String>,
}

impl SourceUrls {
    pub fn for_archive(base_url: &str, basename: &Basename) -> Self {
        let base = base_url.trim_end_matches('/');
        let tiff16 = Expert::ALL
            .iter()
            .map(|expert| {
                (
                    *expert,
                    format!("{base}/img/{}/{basename}.tif", expert.dir_name()),
                )
            })
            .collect();
        Self {
            dng: format!("{base}/img/dng/{basename}.dng"),
            tiff16,
        }
    }

    pub fn url(&self, asset: Asset) -> Option<&str> {
        match asset {
            Asset::Raw => Some(self.dng.as_str()),
            Asset::Expert(expert) => self.tiff16.get(&expert).map(String::as_str),
        }
    }
}

/// One raw capture and everything known about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: u32,
    pub basename: Basename,
    pub license: License,
    #[serde(default)]
    pub categories: Categories,
    #[serde(default)]
    pub camera: Option<Camera>,
    pub urls: SourceUrls,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
    Debug,
}

impl Split {
    pub const ALL: [Split; 4] = [Split::Train, Split::Val, Split::Test, Split::Debug];
    pub const PARTITIONED: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
            Split::Debug => "debug",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Split::Train => "training.json",
            Split::Val => "validation.json",
            Split::Test => "testing.json",
            Split::Debug => "debugging.json",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Split {
    type Err = FivekError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" | "training" => Ok(Split::Train),
            "val" | "validation" => Ok(Split::Val),
            "test" | "testing" => Ok(Split::Test),
            "debug" | "debugging" => Ok(Split::Debug),
            _ => Err(FivekError::InvalidSplit(value.to_string())),
        }
    }
}

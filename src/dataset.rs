use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::acquire::{
    AcquisitionOptions, AcquisitionReport, Acquirer, ProgressSink, Requirement,
};
use crate::config::Settings;
use crate::domain::{Asset, AssetSet, Basename, Camera, Categories, ItemRecord, License, Split};
use crate::error::FivekError;
use crate::index::{IndexStore, SplitIndex};
use crate::remote::RemoteSource;
use crate::store::Layout;

/// Construction parameters of a [`Dataset`].
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub root: Utf8PathBuf,
    pub split: Split,
    pub assets: AssetSet,
    pub download: bool,
    pub acquisition: AcquisitionOptions,
    pub index_base_url: String,
}

impl DatasetOptions {
    /// Options for `split` with the raw file and the configured experts.
    pub fn from_settings(settings: &Settings, split: Split) -> Self {
        Self {
            root: settings.root.clone(),
            split,
            assets: AssetSet::new(true, &settings.experts),
            download: settings.download,
            acquisition: settings.acquisition_options(),
            index_base_url: settings.index_base_url.clone(),
        }
    }
}

/// One item with its local files, as handed to a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub id: u32,
    pub basename: Basename,
    pub license: License,
    pub categories: Categories,
    pub camera: Option<Camera>,
    pub files: BTreeMap<Asset, Utf8PathBuf>,
}

impl ResolvedItem {
    pub fn path(&self, asset: Asset) -> Option<&Utf8Path> {
        self.files.get(&asset).map(Utf8PathBuf::as_path)
    }
}

/// Caller-supplied mapping applied to every item read from a [`Dataset`].
pub trait ItemTransform: Send + Sync {
    type Output;

    fn apply(&self, item: ResolvedItem) -> Self::Output;
}

impl<F, O> ItemTransform for F
where
    F: Fn(ResolvedItem) -> O + Send + Sync,
{
    type Output = O;

    fn apply(&self, item: ResolvedItem) -> O {
        self(item)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ItemTransform for Identity {
    type Output = ResolvedItem;

    fn apply(&self, item: ResolvedItem) -> ResolvedItem {
        item
    }
}

/// Random-access view over one split.
///
/// Reading item `i` makes its requested files present (or, with download
/// disabled, requires them to be) and passes the result through the
/// transform. Reads share no mutable state besides file placement, so
/// they can run from many threads at once.
pub struct Dataset<R: RemoteSource, T: ItemTransform = Identity> {
    index: SplitIndex,
    acquirer: Acquirer<R>,
    assets: AssetSet,
    download: bool,
    transform: T,
}

impl<R: RemoteSource> Dataset<R, Identity> {
    /// Loads the split index from the root, fetching the published
    /// document first when it is missing and download is enabled.
    pub fn open(options: DatasetOptions, remote: R) -> Result<Self, FivekError> {
        let layout = Layout::new_with_root(options.root.clone());
        let store = IndexStore::new(layout.clone());
        let index = if !store.exists(options.split) && options.download {
            store.fetch_published(options.split, &options.index_base_url, &remote)?
        } else {
            store.load(options.split)?
        };
        info!(
            split = %options.split,
            items = index.len(),
            assets = options.assets.len(),
            download = options.download,
            "dataset opened"
        );
        Ok(Self {
            index,
            acquirer: Acquirer::new(layout, remote, options.acquisition),
            assets: options.assets,
            download: options.download,
            transform: Identity,
        })
    }
}

impl<R: RemoteSource, T: ItemTransform> Dataset<R, T> {
    pub fn with_transform<U: ItemTransform>(self, transform: U) -> Dataset<R, U> {
        Dataset {
            index: self.index,
            acquirer: self.acquirer,
            assets: self.assets,
            download: self.download,
            transform,
        }
    }

    pub fn split(&self) -> Split {
        self.index.split()
    }

    pub fn index(&self) -> &SplitIndex {
        &self.index
    }

    pub fn acquirer(&self) -> &Acquirer<R> {
        &self.acquirer
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn record(&self, index: usize) -> Result<&ItemRecord, FivekError> {
        self.index.get(index).ok_or(FivekError::IndexOutOfRange {
            index,
            len: self.index.len(),
        })
    }

    /// Canonical files item `index` needs. Touches neither disk nor network.
    pub fn resolve(&self, index: usize) -> Result<Requirement, FivekError> {
        Ok(self.acquirer.requirement(self.record(index)?, &self.assets))
    }

    pub fn get(&self, index: usize) -> Result<T::Output, FivekError> {
        let record = self.record(index)?;
        let requirement = self.acquirer.requirement(record, &self.assets);
        let files = if self.download {
            self.acquirer.ensure(&requirement)?
        } else {
            requirement.locate()?
        };
        debug!(index, basename = %record.basename, files = files.files.len(), "item resolved");
        let item = ResolvedItem {
            id: record.id,
            basename: record.basename.clone(),
            license: record.license,
            categories: record.categories.clone(),
            camera: record.camera.clone(),
            files: files.files,
        };
        Ok(self.transform.apply(item))
    }

    /// Lazily reads every item in order. Each call starts from the first item.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Result<T::Output, FivekError>> + '_ {
        (0..self.len()).map(move |index| self.get(index))
    }

    pub fn par_iter(
        &self,
    ) -> impl IndexedParallelIterator<Item = Result<T::Output, FivekError>> + '_
    where
        T::Output: Send,
    {
        (0..self.len()).into_par_iter().map(move |index| self.get(index))
    }

    /// Reads every item on a pool of `pool_size` workers; the first failure
    /// aborts the load.
    pub fn load_all(&self) -> Result<Vec<T::Output>, FivekError>
    where
        T::Output: Send,
    {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.acquirer.options().pool_size.max(1))
            .build()
            .map_err(|err| FivekError::InvalidConfig(format!("worker pool: {err}")))?;
        pool.install(|| self.par_iter().collect())
    }

    /// Batch-acquires the requested assets of the whole split.
    pub fn prefetch(&self, sink: &dyn ProgressSink) -> Result<AcquisitionReport, FivekError> {
        self.acquirer.acquire(self.index.items(), &self.assets, sink)
    }

    /// Sorted unique values of every category key across the split.
    pub fn all_categories(&self) -> BTreeMap<&'static str, BTreeSet<String>> {
        let mut values: BTreeMap<&'static str, BTreeSet<String>> = Categories::KEYS
            .iter()
            .map(|key| (*key, BTreeSet::new()))
            .collect();
        for record in self.index.items() {
            for key in Categories::KEYS {
                let value = record.categories.get(key);
                if let (Some(value), Some(set)) = (value, values.get_mut(key)) {
                    set.insert(value.to_string());
                }
            }
        }
        values
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::alignment::{
    master_duration_seconds, master_start, source_offset, to_local_window, AlignmentRecord,
    AlignmentStore, SourceOffset, YamlAlignmentStore,
};
use super::cache::{CacheEntry, CacheKey, CacheManager, CacheStats, Decoded};
use super::channel::{
    validate_channel_id, ChannelSummary, Dataset, SourceKind, Statistics, TimeUnit,
};
use super::columnar::{decode_columnar, ColumnarFormat};
use super::config::EngineConfig;
use super::error::{AlignmentError, ChannelError, DecodeError, EngineError, ResolveError};
use super::resample::{magnitude, ChannelWindow};
use super::scope_file::decode_scope_file;

const ACCELERATION_AXES: [&str; 3] = ["acceleration_x", "acceleration_y", "acceleration_z"];

/// Maps an experiment and source kind to a file on disk
pub trait FileResolver: Send + Sync {
    fn resolve(&self, experiment_id: &str, source: SourceKind) -> Result<PathBuf, ResolveError>;
}

/// Decode a file that has already been read into memory.
///
/// Chunked files are never decoded whole; open them through [`decode_path`] instead.
pub fn decode(source: SourceKind, bytes: &[u8], config: &EngineConfig) -> Result<Dataset, DecodeError> {
    match source {
        SourceKind::Scope => decode_scope_file(bytes),
        SourceKind::Chunked => Err(DecodeError::UnsupportedLayout(String::from(
            "chunked files are read progressively from disk",
        ))),
        columnar => {
            let format = ColumnarFormat::for_source(columnar, config).ok_or_else(|| {
                DecodeError::UnsupportedLayout(format!("{columnar} is not a columnar source"))
            })?;
            decode_columnar(&format, bytes, config.sniff_lines)
        }
    }
}

/// Read and decode a file. The decode itself runs on the blocking pool.
pub async fn decode_path(
    source: SourceKind,
    path: PathBuf,
    config: Arc<EngineConfig>,
) -> Result<Decoded, EngineError> {
    if source == SourceKind::Chunked {
        return open_chunked(path).await;
    }
    let bytes = tokio::fs::read(&path).await?;
    log::info!(
        "Read {} ({})",
        path.display(),
        human_bytes::human_bytes(bytes.len() as f64)
    );
    let dataset =
        tokio::task::spawn_blocking(move || decode(source, &bytes, &config)).await??;
    Ok(Decoded::from(dataset))
}

#[cfg(feature = "hdf5")]
async fn open_chunked(path: PathBuf) -> Result<Decoded, EngineError> {
    use super::hdf5_reader::Hdf5Reader;

    let file_size = tokio::fs::metadata(&path).await?.len();
    let reader = tokio::task::spawn_blocking(move || Hdf5Reader::open(&path)).await??;
    Ok(Decoded {
        dataset: Dataset::new(SourceKind::Chunked, file_size),
        reader: Some(Box::new(reader)),
    })
}

#[cfg(not(feature = "hdf5"))]
async fn open_chunked(path: PathBuf) -> Result<Decoded, EngineError> {
    Err(DecodeError::UnsupportedLayout(format!(
        "cannot open {}: chunked sources need the hdf5 feature",
        path.display()
    ))
    .into())
}

fn entry_window(
    entry: &CacheEntry,
    id: &str,
    start: f64,
    end: f64,
    max_points: usize,
) -> Result<ChannelWindow, ChannelError> {
    match &entry.reader {
        Some(reader) => {
            validate_channel_id(id)?;
            reader.fetch_window(id, start, end, max_points)
        }
        None => entry.dataset.channel_window(id, start, end, max_points),
    }
}

// Window on the master timeline for an entry shifted by `offset_seconds`
fn aligned_entry_window(
    entry: &CacheEntry,
    offset_seconds: Option<f64>,
    id: &str,
    start: f64,
    end: f64,
    max_points: usize,
) -> Result<ChannelWindow, ChannelError> {
    match offset_seconds {
        Some(offset_seconds) => {
            let unit = entry_time_unit(entry, id)?;
            let (local_start, local_end) = to_local_window(offset_seconds, unit, start, end);
            let window = entry_window(entry, id, local_start, local_end, max_points)?;
            Ok(window.shifted(-unit.from_seconds(offset_seconds)))
        }
        None => entry_window(entry, id, start, end, max_points),
    }
}

fn entry_time_unit(entry: &CacheEntry, id: &str) -> Result<TimeUnit, ChannelError> {
    match &entry.reader {
        Some(reader) => reader
            .list_channels()
            .into_iter()
            .find(|summary| summary.id == id)
            .map(|summary| summary.time_unit)
            .ok_or_else(|| ChannelError::NotFound(id.to_string())),
        None => Ok(entry.dataset.channel(id)?.time_unit),
    }
}

/// Async front door to decoding, caching, resampling and alignment
#[derive(Clone)]
pub struct ChannelEngine {
    config: Arc<EngineConfig>,
    resolver: Arc<dyn FileResolver>,
    store: Arc<dyn AlignmentStore>,
    cache: CacheManager,
}

impl ChannelEngine {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn FileResolver>,
        store: Arc<dyn AlignmentStore>,
    ) -> Self {
        let cache = CacheManager::from_config(&config);
        Self {
            config: Arc::new(config),
            resolver,
            store,
            cache,
        }
    }

    /// Resolve files and store alignments under the configured data path
    pub fn from_config(config: EngineConfig) -> Self {
        let store = Arc::new(YamlAlignmentStore::new(&config.data_path));
        let resolver = Arc::new(config.clone());
        Self::new(config, resolver, store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Decode a file without touching the cache
    pub async fn decode_file(&self, source: SourceKind, path: &Path) -> Result<Decoded, EngineError> {
        decode_path(source, path.to_path_buf(), self.config.clone()).await
    }

    /// Cached entry for a source of an experiment, decoding it on a miss
    pub async fn entry(
        &self,
        experiment_id: &str,
        source: SourceKind,
    ) -> Result<Arc<CacheEntry>, EngineError> {
        let key = CacheKey::new(source, experiment_id);
        if let Some(entry) = self.cache.get(&key) {
            return Ok(entry);
        }
        let path = self.resolver.resolve(experiment_id, source)?;
        let config = self.config.clone();
        Ok(self
            .cache
            .get_or_decode(key, move || decode_path(source, path, config))
            .await?)
    }

    pub async fn dataset(
        &self,
        experiment_id: &str,
        source: SourceKind,
    ) -> Result<Arc<Dataset>, EngineError> {
        Ok(self.entry(experiment_id, source).await?.dataset.clone())
    }

    pub async fn list_channels(
        &self,
        experiment_id: &str,
        source: SourceKind,
    ) -> Result<Vec<ChannelSummary>, EngineError> {
        let entry = self.entry(experiment_id, source).await?;
        Ok(match &entry.reader {
            Some(reader) => reader.list_channels(),
            None => entry.dataset.list_channels(),
        })
    }

    pub async fn channel_window(
        &self,
        experiment_id: &str,
        source: SourceKind,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, EngineError> {
        let entry = self.entry(experiment_id, source).await?;
        Ok(entry_window(&entry, id, start, end, max_points)?)
    }

    /// Fetch many channels of one source. A bad id only fails its own slot.
    pub async fn bulk_channel_window(
        &self,
        experiment_id: &str,
        source: SourceKind,
        ids: &[&str],
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<BTreeMap<String, Result<ChannelWindow, ChannelError>>, EngineError> {
        let entry = self.entry(experiment_id, source).await?;
        Ok(ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    entry_window(&entry, id, start, end, max_points),
                )
            })
            .collect())
    }

    pub async fn statistics(
        &self,
        experiment_id: &str,
        source: SourceKind,
        id: &str,
    ) -> Result<Statistics, EngineError> {
        let entry = self.entry(experiment_id, source).await?;
        match &entry.reader {
            Some(reader) => {
                validate_channel_id(id)?;
                Ok(reader.statistics(id)?)
            }
            None => Ok(entry.dataset.statistics(id)?),
        }
    }

    /// Combined magnitude of the three acceleration axes. Computed per request.
    pub async fn magnitude_window(
        &self,
        experiment_id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, EngineError> {
        let dataset = self.dataset(experiment_id, SourceKind::Acceleration).await?;
        let [x, y, z] = ACCELERATION_AXES;
        let axes = [dataset.channel(x)?, dataset.channel(y)?, dataset.channel(z)?];
        Ok(magnitude(axes, start, end, max_points))
    }

    async fn load_record(&self, experiment_id: &str) -> Result<Option<AlignmentRecord>, EngineError> {
        let store = self.store.clone();
        let experiment_id = experiment_id.to_string();
        Ok(tokio::task::spawn_blocking(move || store.get(&experiment_id)).await??)
    }

    async fn save_record(&self, record: AlignmentRecord) -> Result<AlignmentRecord, EngineError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.put(&record).map(|_| record)).await??)
    }

    /// Place every source of an experiment on the master timeline.
    ///
    /// A stored record is returned as is unless `force` is set. Manual offsets survive a
    /// forced recomputation.
    pub async fn align_experiment(
        &self,
        experiment_id: &str,
        force: bool,
    ) -> Result<AlignmentRecord, EngineError> {
        let previous = self.load_record(experiment_id).await?;
        if let (Some(record), false) = (&previous, force) {
            return Ok(record.clone());
        }

        let master = self
            .dataset(experiment_id, SourceKind::Scope)
            .await
            .map_err(|e| AlignmentError::NoMasterTimeline(format!("{experiment_id}: {e}")))?;
        let start = master_start(&master, self.config.master_clock_offset_hours).ok_or_else(|| {
            AlignmentError::NoMasterTimeline(format!(
                "{experiment_id}: scope file has no absolute start time"
            ))
        })?;
        let mut record =
            AlignmentRecord::new(experiment_id, start, master_duration_seconds(&master));

        for source in SourceKind::ALL.into_iter().filter(|s| *s != SourceKind::Scope) {
            match self.resolver.resolve(experiment_id, source) {
                Ok(_) => (),
                Err(ResolveError::NotFound(_, _)) => continue,
                Err(e) => {
                    log::warn!("Could not resolve {source} for {experiment_id}: {e}");
                    continue;
                }
            }
            let offset = match self.dataset(experiment_id, source).await {
                Ok(dataset) => {
                    let offset = source_offset(
                        start,
                        &dataset,
                        self.config.is_zero_offset_source(source),
                    );
                    if offset.is_none() {
                        log::warn!(
                            "{source} of {experiment_id} has no absolute start; offset left unresolved"
                        );
                    }
                    SourceOffset::computed(offset, dataset.start_absolute_ms)
                }
                Err(e) => {
                    log::warn!("Could not decode {source} of {experiment_id} for alignment: {e}");
                    SourceOffset::computed(None, None)
                }
            };
            record.offsets.insert(source, offset);
        }
        if let Some(previous) = &previous {
            record.keep_manual_offsets(previous);
        }
        log::info!(
            "Aligned {experiment_id}: {} source(s) relative to the scope timeline",
            record.offsets.len()
        );
        self.save_record(record).await
    }

    /// Override the offset of one source by hand. `None` clears it to unresolved.
    pub async fn set_manual_offset(
        &self,
        experiment_id: &str,
        source: SourceKind,
        offset_seconds: Option<f64>,
    ) -> Result<AlignmentRecord, EngineError> {
        let mut record = match self.load_record(experiment_id).await? {
            Some(record) => record,
            None => self.align_experiment(experiment_id, false).await?,
        };
        record.set_manual_offset(source, offset_seconds);
        self.save_record(record).await
    }

    /// Window of a channel on the master timeline. `start` and `end` are master time in
    /// the channel's time unit. Sources without a resolved offset come back unshifted.
    pub async fn aligned_channel_window(
        &self,
        experiment_id: &str,
        source: SourceKind,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, EngineError> {
        let record = self.align_experiment(experiment_id, false).await?;
        let entry = self.entry(experiment_id, source).await?;
        Ok(aligned_entry_window(&entry, record.offset(source), id, start, end, max_points)?)
    }

    /// Aligned windows of many channels of one source. A bad id only fails its own slot.
    pub async fn bulk_aligned_channel_window(
        &self,
        experiment_id: &str,
        source: SourceKind,
        ids: &[&str],
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<BTreeMap<String, Result<ChannelWindow, ChannelError>>, EngineError> {
        let record = self.align_experiment(experiment_id, false).await?;
        let entry = self.entry(experiment_id, source).await?;
        let offset_seconds = record.offset(source);
        if offset_seconds.is_none() {
            log::debug!("{source} of {experiment_id} has no offset; serving local time");
        }
        Ok(ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    aligned_entry_window(&entry, offset_seconds, id, start, end, max_points),
                )
            })
            .collect())
    }

    pub fn invalidate(&self, experiment_id: &str, source: SourceKind) -> bool {
        self.cache.invalidate(&CacheKey::new(source, experiment_id))
    }

    pub fn invalidate_all(&self, source: SourceKind) -> usize {
        self.cache.invalidate_all(source)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

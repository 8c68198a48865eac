use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::channel::{ChannelKind, Dataset, SourceKind, TimeUnit};
use super::codec::now_epoch_millis;
use super::constants::MILLIS_PER_HOUR;
use super::error::AlignmentError;

const ALIGNMENT_FILE_NAME: &str = "alignment.yml";

/// Time offset of one source relative to the master timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOffset {
    /// Seconds to subtract from local time to land on the master timeline. None when
    /// the source could not be placed.
    pub offset_seconds: Option<f64>,
    /// Set by hand; recomputation leaves it alone
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub start_absolute_ms: Option<i64>,
}

impl SourceOffset {
    pub fn computed(offset_seconds: Option<f64>, start_absolute_ms: Option<i64>) -> Self {
        Self {
            offset_seconds,
            manual: false,
            start_absolute_ms,
        }
    }

    pub fn manual(offset_seconds: Option<f64>) -> Self {
        Self {
            offset_seconds,
            manual: true,
            start_absolute_ms: None,
        }
    }
}

/// Where every source of an experiment sits on the master timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub experiment_id: String,
    pub master_source: SourceKind,
    pub master_start_absolute_ms: i64,
    pub master_duration_seconds: f64,
    pub offsets: BTreeMap<SourceKind, SourceOffset>,
    pub computed_at_ms: i64,
}

impl AlignmentRecord {
    pub fn new(experiment_id: &str, master_start_absolute_ms: i64, master_duration_seconds: f64) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            master_source: SourceKind::Scope,
            master_start_absolute_ms,
            master_duration_seconds,
            offsets: BTreeMap::new(),
            computed_at_ms: now_epoch_millis(),
        }
    }

    /// Offset of `source` in seconds. The master is always at zero.
    pub fn offset(&self, source: SourceKind) -> Option<f64> {
        if source == self.master_source {
            return Some(0.0);
        }
        self.offsets.get(&source).and_then(|offset| offset.offset_seconds)
    }

    /// Carry manual overrides over from an earlier record
    pub fn keep_manual_offsets(&mut self, previous: &AlignmentRecord) {
        for (source, offset) in previous.offsets.iter() {
            if offset.manual {
                self.offsets.insert(*source, offset.clone());
            }
        }
    }

    pub fn set_manual_offset(&mut self, source: SourceKind, offset_seconds: Option<f64>) {
        self.offsets.insert(source, SourceOffset::manual(offset_seconds));
    }
}

/// Absolute start of the master timeline, with the configured clock correction
pub fn master_start(dataset: &Dataset, offset_hours: i64) -> Option<i64> {
    dataset
        .start_absolute_ms
        .map(|start| start + offset_hours * MILLIS_PER_HOUR)
}

/// Length of the longest raw channel, in seconds
pub fn master_duration_seconds(dataset: &Dataset) -> f64 {
    dataset
        .channels
        .values()
        .filter(|channel| channel.kind == ChannelKind::Raw)
        .map(|channel| channel.duration_seconds())
        .fold(0.0, f64::max)
}

/// Offset of a decoded source relative to the master start.
///
/// Sources with their own absolute start are placed by the difference of the two
/// starts. Sources without one only get zero when they share the master's zero-based
/// convention.
pub fn source_offset(master_start_ms: i64, dataset: &Dataset, shares_master_zero: bool) -> Option<f64> {
    match dataset.start_absolute_ms {
        Some(start) => Some((master_start_ms - start) as f64 / 1000.0),
        None if shares_master_zero => Some(0.0),
        None => None,
    }
}

/// Map a master-timeline window into a source's local time
pub fn to_local_window(offset_seconds: f64, unit: TimeUnit, start: f64, end: f64) -> (f64, f64) {
    let offset = unit.from_seconds(offset_seconds);
    (start + offset, end + offset)
}

/// Persistence for alignment records
pub trait AlignmentStore: Send + Sync {
    fn get(&self, experiment_id: &str) -> Result<Option<AlignmentRecord>, AlignmentError>;
    fn put(&self, record: &AlignmentRecord) -> Result<(), AlignmentError>;
}

/// Records that live as long as the process
#[derive(Debug, Default)]
pub struct MemoryAlignmentStore {
    records: Mutex<FxHashMap<String, AlignmentRecord>>,
}

impl MemoryAlignmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlignmentStore for MemoryAlignmentStore {
    fn get(&self, experiment_id: &str) -> Result<Option<AlignmentRecord>, AlignmentError> {
        let records = self
            .records
            .lock()
            .map_err(|e| AlignmentError::Store(e.to_string()))?;
        Ok(records.get(experiment_id).cloned())
    }

    fn put(&self, record: &AlignmentRecord) -> Result<(), AlignmentError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| AlignmentError::Store(e.to_string()))?;
        records.insert(record.experiment_id.clone(), record.clone());
        Ok(())
    }
}

/// Records stored as `alignment.yml` inside each experiment directory
#[derive(Debug, Clone)]
pub struct YamlAlignmentStore {
    data_path: PathBuf,
}

impl YamlAlignmentStore {
    pub fn new(data_path: &Path) -> Self {
        Self {
            data_path: data_path.to_path_buf(),
        }
    }

    pub fn record_path(&self, experiment_id: &str) -> PathBuf {
        self.data_path.join(experiment_id).join(ALIGNMENT_FILE_NAME)
    }
}

impl AlignmentStore for YamlAlignmentStore {
    fn get(&self, experiment_id: &str) -> Result<Option<AlignmentRecord>, AlignmentError> {
        let path = self.record_path(experiment_id);
        if !path.exists() {
            return Ok(None);
        }
        let yaml_str = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str::<AlignmentRecord>(&yaml_str)?))
    }

    fn put(&self, record: &AlignmentRecord) -> Result<(), AlignmentError> {
        let path = self.record_path(&record.experiment_id);
        let parent = path
            .parent()
            .ok_or_else(|| AlignmentError::Store(format!("{path:?} has no parent directory")))?;
        if !parent.exists() {
            return Err(AlignmentError::Store(format!(
                "experiment directory {parent:?} does not exist"
            )));
        }
        std::fs::write(&path, serde_yaml::to_string(record)?)?;
        log::info!("Wrote alignment for {} to {}", record.experiment_id, path.display());
        Ok(())
    }
}

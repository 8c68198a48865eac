use hdf5::types::{VarLenAscii, VarLenUnicode};
use hdf5::{Dataset as H5Dataset, File, Group};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::channel::{
    Calibration, ChannelKind, ChannelSummary, Statistics, StatisticsAccumulator, TimeUnit,
};
use super::constants::STATISTICS_CHUNK_SAMPLES;
use super::error::{ChannelError, DecodeError};
use super::progressive::{choose_level, index_range, Level, ProgressiveReader};
use super::resample::{resample_slices, ChannelWindow};

const CHANNELS_PATH: &str = "measurements/00000001/channels";
const BLOCK_PATH: &str = "blocks/00000001";
const RAW_NAME: &str = "raw";
const STRING_ATTRIBUTES: [&str; 3] = ["name", "physicalUnit", "ChannelName"];
const FACTOR_ATTRIBUTE: &str = "binToVoltFactor";
const CONSTANT_ATTRIBUTE: &str = "binToVoltConstant";
const RATE_ATTRIBUTE: &str = "samplingRate";

#[derive(Debug, Clone)]
struct ChunkedChannel {
    id: String,
    attributes: BTreeMap<String, String>,
    calibration: Calibration,
    /// Samples per second of the raw level
    rate: f64,
    raw_len: usize,
    levels: Vec<Level>,
}

impl ChunkedChannel {
    fn read(group: &Group, id: &str) -> Result<Self, DecodeError> {
        let mut attributes = BTreeMap::new();
        for name in STRING_ATTRIBUTES {
            if let Some(value) = read_string_attr(group, name) {
                attributes.insert(name.to_string(), value);
            }
        }
        let factor = read_f64_attr(group, FACTOR_ATTRIBUTE);
        let constant = read_f64_attr(group, CONSTANT_ATTRIBUTE);
        let rate = read_f64_attr(group, RATE_ATTRIBUTE).filter(|rate| *rate > 0.0);
        for (name, value) in [(FACTOR_ATTRIBUTE, factor), (CONSTANT_ATTRIBUTE, constant), (RATE_ATTRIBUTE, rate)] {
            if let Some(value) = value {
                attributes.insert(name.to_string(), value.to_string());
            }
        }

        let block = group.group(BLOCK_PATH)?;
        let mut levels = Vec::new();
        for name in block.member_names()? {
            if name == RAW_NAME || name.starts_with("data") {
                let len = block.dataset(&name)?.shape().first().copied().unwrap_or(0);
                levels.push(Level::new(&name, len));
            }
        }
        let raw_len = levels
            .iter()
            .find(|level| level.name == RAW_NAME)
            .or_else(|| levels.iter().max_by_key(|level| level.len))
            .map(|level| level.len)
            .unwrap_or(0);

        Ok(Self {
            id: id.to_string(),
            attributes,
            calibration: Calibration::new(factor.unwrap_or(1.0), constant.unwrap_or(0.0)),
            rate: rate.unwrap_or(1.0),
            raw_len,
            levels,
        })
    }

    fn summary(&self) -> ChannelSummary {
        let label = self
            .attributes
            .get("name")
            .or_else(|| self.attributes.get("ChannelName"))
            .cloned()
            .unwrap_or_else(|| self.id.clone());
        let unit = self
            .attributes
            .get("physicalUnit")
            .cloned()
            .unwrap_or_else(|| String::from("V"));
        ChannelSummary {
            id: self.id.clone(),
            label,
            unit,
            kind: ChannelKind::Raw,
            points: self.raw_len,
            start: 0.0,
            end: self.raw_len.saturating_sub(1) as f64 / self.rate,
            time_unit: TimeUnit::Seconds,
            sampling_rate: self.rate,
        }
    }
}

fn read_string_attr(group: &Group, name: &str) -> Option<String> {
    let attr = group.attr(name).ok()?;
    if let Ok(value) = attr.read_scalar::<VarLenUnicode>() {
        return Some(value.as_str().to_string());
    }
    attr.read_scalar::<VarLenAscii>()
        .ok()
        .map(|value| value.as_str().to_string())
}

fn read_f64_attr(group: &Group, name: &str) -> Option<f64> {
    group.attr(name).ok()?.read_scalar::<f64>().ok()
}

/// Read `[begin, end)` of a level. 2-D levels contribute their first column.
fn read_level(dataset: &H5Dataset, begin: usize, end: usize) -> hdf5::Result<Vec<u16>> {
    match dataset.ndim() {
        1 => Ok(dataset
            .read_slice_1d::<u16, _>(begin..end)?
            .iter()
            .copied()
            .collect()),
        _ => Ok(dataset
            .read_slice_2d::<u16, _>((begin..end, 0..1))?
            .iter()
            .copied()
            .collect()),
    }
}

/// Summarize the raw level of a channel, holding at most `chunk` samples at a time
fn raw_statistics(file: &File, channel: &ChunkedChannel, chunk: usize) -> hdf5::Result<Statistics> {
    let level = channel
        .levels
        .iter()
        .find(|level| level.name == RAW_NAME)
        .or_else(|| channel.levels.iter().max_by_key(|level| level.len));
    let mut accumulator = StatisticsAccumulator::default();
    if let Some(level) = level {
        let dataset = file.dataset(&format!(
            "{CHANNELS_PATH}/{}/{BLOCK_PATH}/{}",
            channel.id, level.name
        ))?;
        let chunk = chunk.max(1);
        let mut begin = 0;
        while begin < level.len {
            let end = (begin + chunk).min(level.len);
            for count in read_level(&dataset, begin, end)? {
                accumulator.push(channel.calibration.apply(count as f64));
            }
            begin = end;
        }
    }
    let summary = channel.summary();
    Ok(accumulator.finish(summary.end - summary.start))
}

/// Progressive reader over an HDF5 measurement file
#[derive(Debug)]
pub struct Hdf5Reader {
    path: PathBuf,
    file: Mutex<Option<File>>,
    channels: Vec<ChunkedChannel>,
}

impl Hdf5Reader {
    /// Open the file and read the channel directory. No samples are read here.
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let file = File::open(path)?;
        let channels_group = file.group(CHANNELS_PATH).map_err(|_| {
            DecodeError::UnsupportedLayout(format!("{path:?} has no {CHANNELS_PATH} group"))
        })?;
        let mut channels = Vec::new();
        for id in channels_group.member_names()? {
            match ChunkedChannel::read(&channels_group.group(&id)?, &id) {
                Ok(channel) => channels.push(channel),
                Err(e) => log::warn!("Skipping chunked channel {id}: {e}"),
            }
        }
        log::info!(
            "Opened chunked file {} with {} channels",
            path.display(),
            channels.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            channels,
        })
    }

    fn find(&self, id: &str) -> Result<&ChunkedChannel, ChannelError> {
        self.channels
            .iter()
            .find(|channel| channel.id == id)
            .ok_or_else(|| ChannelError::NotFound(id.to_string()))
    }
}

impl ProgressiveReader for Hdf5Reader {
    fn list_channels(&self) -> Vec<ChannelSummary> {
        let mut summaries: Vec<ChannelSummary> =
            self.channels.iter().map(ChunkedChannel::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn attributes(&self, id: &str) -> Result<BTreeMap<String, String>, ChannelError> {
        Ok(self.find(id)?.attributes.clone())
    }

    fn fetch_window(
        &self,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, ChannelError> {
        let channel = self.find(id)?;
        let read_failed = |message: String| ChannelError::ReadFailed(id.to_string(), message);
        let guard = self
            .file
            .lock()
            .map_err(|_| read_failed(String::from("reader lock was poisoned")))?;
        let file = guard
            .as_ref()
            .ok_or_else(|| read_failed(format!("{} is closed", self.path.display())))?;

        let (begin, stop) = index_range(channel.raw_len, channel.rate, start, end);
        let Some(level) = choose_level(&channel.levels, channel.raw_len, begin, stop, max_points)
            .map(|index| &channel.levels[index])
        else {
            return Ok(ChannelWindow::empty());
        };
        let factor = level.factor(channel.raw_len);
        let level_begin = ((begin as f64 / factor).floor() as usize).min(level.len);
        let level_stop = ((stop as f64 / factor).ceil() as usize).clamp(level_begin, level.len);
        log::debug!(
            "Reading {id} level {} samples {level_begin}..{level_stop}",
            level.name
        );

        let counts = file
            .dataset(&format!("{CHANNELS_PATH}/{id}/{BLOCK_PATH}/{}", level.name))
            .and_then(|dataset| read_level(&dataset, level_begin, level_stop))
            .map_err(|e| read_failed(e.to_string()))?;
        let time: Vec<f64> = (level_begin..level_begin + counts.len())
            .map(|i| i as f64 * factor / channel.rate)
            .collect();
        let values: Vec<f64> = counts
            .into_iter()
            .map(|count| channel.calibration.apply(count as f64))
            .collect();
        Ok(resample_slices(&time, &values, start, end, max_points))
    }

    fn statistics(&self, id: &str) -> Result<Statistics, ChannelError> {
        let channel = self.find(id)?;
        let read_failed = |message: String| ChannelError::ReadFailed(id.to_string(), message);
        let guard = self
            .file
            .lock()
            .map_err(|_| read_failed(String::from("reader lock was poisoned")))?;
        let file = guard
            .as_ref()
            .ok_or_else(|| read_failed(format!("{} is closed", self.path.display())))?;
        raw_statistics(file, channel, STATISTICS_CHUNK_SAMPLES).map_err(|e| read_failed(e.to_string()))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if guard.take().is_some() {
                log::debug!("Closed chunked file {}", self.path.display());
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.file.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

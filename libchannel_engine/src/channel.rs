use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use super::error::{ChannelError, DecodeError};
use super::resample::{resample, ChannelWindow};

/// The kinds of recording the engine knows how to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Scope,
    Temperature,
    Acceleration,
    Position,
    Chunked,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Scope,
        SourceKind::Temperature,
        SourceKind::Acceleration,
        SourceKind::Position,
        SourceKind::Chunked,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Scope => "scope",
            Self::Temperature => "temperature",
            Self::Acceleration => "acceleration",
            Self::Position => "position",
            Self::Chunked => "chunked",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SourceKind {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| DecodeError::UnsupportedLayout(format!("unknown source kind {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
}

impl TimeUnit {
    /// How many of this unit make up one second
    pub fn per_second(&self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Milliseconds => 1.0e3,
            Self::Microseconds => 1.0e6,
        }
    }

    pub fn from_seconds(&self, seconds: f64) -> f64 {
        seconds * self.per_second()
    }

    pub fn to_seconds(&self, value: f64) -> f64 {
        value / self.per_second()
    }

    pub fn convert(&self, value: f64, target: TimeUnit) -> f64 {
        if *self == target {
            return value;
        }
        target.from_seconds(self.to_seconds(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Raw,
    Calculated,
    Interpolated,
}

/// A named time series. The arrays cannot be changed once the channel exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub label: String,
    pub unit: String,
    pub kind: ChannelKind,
    pub time_unit: TimeUnit,
    pub sources: Vec<String>,
    time: Vec<f64>,
    values: Vec<f64>,
    sampling_rate: f64,
}

impl Channel {
    /// Create a new channel. Fails if the arrays do not have matching length.
    pub fn new(
        id: &str,
        label: &str,
        unit: &str,
        kind: ChannelKind,
        time_unit: TimeUnit,
        time: Vec<f64>,
        values: Vec<f64>,
    ) -> Result<Self, ChannelError> {
        if time.len() != values.len() {
            return Err(ChannelError::LengthMismatch(
                id.to_string(),
                time.len(),
                values.len(),
            ));
        }
        let sampling_rate = estimate_sampling_rate(&time, time_unit);
        Ok(Self {
            id: id.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            kind,
            time_unit,
            sources: Vec::new(),
            time,
            values,
            sampling_rate,
        })
    }

    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Sampling rate in Hz, estimated from the average spacing
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// First and last timestamp, None if the channel is empty
    pub fn extent(&self) -> Option<(f64, f64)> {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => Some((*first, *last)),
            _ => None,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.extent()
            .map(|(first, last)| self.time_unit.to_seconds(last - first))
            .unwrap_or(0.0)
    }

    pub fn size_bytes(&self) -> usize {
        (self.time.len() + self.values.len()) * std::mem::size_of::<f64>()
    }

    pub fn summary(&self) -> ChannelSummary {
        let (start, end) = self.extent().unwrap_or((0.0, 0.0));
        ChannelSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            unit: self.unit.clone(),
            kind: self.kind,
            points: self.len(),
            start,
            end,
            time_unit: self.time_unit,
            sampling_rate: self.sampling_rate,
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics::from_values(&self.values, self.duration_seconds())
    }
}

fn estimate_sampling_rate(time: &[f64], unit: TimeUnit) -> f64 {
    if time.len() < 2 {
        return 0.0;
    }
    let span = unit.to_seconds(time[time.len() - 1] - time[0]);
    if span <= 0.0 {
        return 0.0;
    }
    (time.len() - 1) as f64 / span
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: String,
    pub label: String,
    pub unit: String,
    pub kind: ChannelKind,
    pub points: usize,
    pub start: f64,
    pub end: f64,
    pub time_unit: TimeUnit,
    pub sampling_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub rms: f64,
    pub duration_seconds: f64,
}

impl Statistics {
    pub fn from_values(values: &[f64], duration_seconds: f64) -> Self {
        let mut accumulator = StatisticsAccumulator::default();
        accumulator.extend(values);
        accumulator.finish(duration_seconds)
    }
}

/// Running summary for values that arrive in chunks. Variance uses Welford's update so
/// long channels do not lose precision.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsAccumulator {
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    sum_sq: f64,
}

impl Default for StatisticsAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
            sum_sq: 0.0,
        }
    }
}

impl StatisticsAccumulator {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sum_sq += value * value;
    }

    pub fn extend(&mut self, values: &[f64]) {
        for value in values {
            self.push(*value);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(&self, duration_seconds: f64) -> Statistics {
        if self.count == 0 {
            return Statistics::default();
        }
        let count = self.count as f64;
        Statistics {
            count: self.count,
            min: self.min,
            max: self.max,
            mean: self.mean,
            std_dev: (self.m2 / count).sqrt(),
            rms: (self.sum_sq / count).sqrt(),
            duration_seconds,
        }
    }
}

/// Linear conversion from raw counts to a physical value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub gain: f64,
    pub offset: f64,
}

impl Calibration {
    pub fn new(gain: f64, offset: f64) -> Self {
        Self { gain, offset }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// Validate a channel id before looking it up
pub fn validate_channel_id(id: &str) -> Result<(), ChannelError> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ChannelError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// One decoded file
#[derive(Debug, Clone)]
pub struct Dataset {
    pub source: SourceKind,
    pub header: BTreeMap<String, String>,
    pub start_absolute_ms: Option<i64>,
    pub channels: FxHashMap<String, Channel>,
    /// Pre-transform series, kept for diagnostics only
    pub diagnostics: FxHashMap<String, Channel>,
    pub file_size: u64,
    pub decoded_at: time::OffsetDateTime,
    pub warnings: Vec<String>,
}

impl Dataset {
    pub fn new(source: SourceKind, file_size: u64) -> Self {
        Self {
            source,
            header: BTreeMap::new(),
            start_absolute_ms: None,
            channels: FxHashMap::default(),
            diagnostics: FxHashMap::default(),
            file_size,
            decoded_at: time::OffsetDateTime::now_utc(),
            warnings: Vec::new(),
        }
    }

    pub fn insert_channel(&mut self, channel: Channel) {
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Record a non-fatal problem found while decoding
    pub fn warn(&mut self, message: String) {
        log::warn!("{} decode: {}", self.source, message);
        self.warnings.push(message);
    }

    pub fn channel(&self, id: &str) -> Result<&Channel, ChannelError> {
        validate_channel_id(id)?;
        self.channels
            .get(id)
            .ok_or_else(|| ChannelError::NotFound(id.to_string()))
    }

    pub fn diagnostic_channel(&self, id: &str) -> Result<&Channel, ChannelError> {
        validate_channel_id(id)?;
        self.diagnostics
            .get(id)
            .ok_or_else(|| ChannelError::NotFound(id.to_string()))
    }

    /// Summaries of all served channels, sorted by id
    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        let mut summaries: Vec<ChannelSummary> =
            self.channels.values().map(Channel::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn channel_window(
        &self,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, ChannelError> {
        Ok(resample(self.channel(id)?, start, end, max_points))
    }

    /// Fetch many channels at once. Each id resolves on its own.
    pub fn bulk_channel_window(
        &self,
        ids: &[&str],
        start: f64,
        end: f64,
        max_points: usize,
    ) -> BTreeMap<String, Result<ChannelWindow, ChannelError>> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    self.channel_window(id, start, end, max_points),
                )
            })
            .collect()
    }

    pub fn statistics(&self, id: &str) -> Result<Statistics, ChannelError> {
        Ok(self.channel(id)?.statistics())
    }

    /// Approximate memory held by the channel arrays
    pub fn size_bytes(&self) -> usize {
        self.channels
            .values()
            .chain(self.diagnostics.values())
            .map(Channel::size_bytes)
            .sum()
    }
}

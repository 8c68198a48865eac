use std::collections::BTreeMap;

use super::channel::{ChannelSummary, Statistics};
use super::error::ChannelError;
use super::resample::ChannelWindow;

/// A file too large to decode up front. Channels are read on demand, one window at a
/// time, and the underlying handle is released by `close`.
///
/// Readers are shared between concurrent requests through the cache, so every method
/// takes `&self`.
pub trait ProgressiveReader: Send + Sync + std::fmt::Debug {
    fn list_channels(&self) -> Vec<ChannelSummary>;

    /// Raw attributes stored with a channel
    fn attributes(&self, id: &str) -> Result<BTreeMap<String, String>, ChannelError>;

    fn fetch_window(
        &self,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, ChannelError>;

    /// Summary statistics over every raw sample, read in bounded chunks
    fn statistics(&self, id: &str) -> Result<Statistics, ChannelError>;

    /// Release the file handle. Fetches after closing fail with `ReadFailed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One stored resolution of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    pub name: String,
    pub len: usize,
}

impl Level {
    pub fn new(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            len,
        }
    }

    /// How many raw samples one sample of this level stands for
    pub fn factor(&self, raw_len: usize) -> f64 {
        if self.len == 0 {
            return 1.0;
        }
        raw_len as f64 / self.len as f64
    }
}

/// Half-open range of sample indices covering `[start, end]` seconds at `rate` Hz.
///
/// A window that misses the data entirely covers everything.
pub fn index_range(len: usize, rate: f64, start: f64, end: f64) -> (usize, usize) {
    if len == 0 {
        return (0, 0);
    }
    let last = (len - 1) as f64;
    let lo = if start.is_finite() { (start * rate).ceil().clamp(0.0, last) } else { 0.0 };
    let hi = if end.is_finite() { (end * rate).floor().clamp(0.0, last) } else { last };
    if lo < hi {
        (lo as usize, hi as usize + 1)
    } else {
        (0, len)
    }
}

/// Pick the coarsest level still holding at least `max_points` samples over
/// `[begin, end)` raw indices. Levels must include the raw data.
pub fn choose_level(levels: &[Level], raw_len: usize, begin: usize, end: usize, max_points: usize) -> Option<usize> {
    let span = end.saturating_sub(begin) as f64;
    levels
        .iter()
        .enumerate()
        .filter(|(_, level)| level.len > 0 && span / level.factor(raw_len) >= max_points as f64)
        .min_by_key(|(_, level)| level.len)
        .map(|(index, _)| index)
        .or_else(|| {
            // Nothing coarse enough, fall back to the finest level
            levels
                .iter()
                .enumerate()
                .max_by_key(|(_, level)| level.len)
                .map(|(index, _)| index)
        })
}

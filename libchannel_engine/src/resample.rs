use serde::{Deserialize, Serialize};

use super::channel::Channel;
use super::constants::{MINMAX_RATIO_THRESHOLD, RMS_RATIO_THRESHOLD};

/// How a window was reduced to fit its point budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Exact,
    Decimation,
    MinMax,
    Rms,
}

/// A visualization-ready subset of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub time: Vec<f64>,
    pub values: Vec<f64>,
    pub strategy: Strategy,
}

impl ChannelWindow {
    pub fn empty() -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            strategy: Strategy::Exact,
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Shift every timestamp by `delta`
    pub fn shifted(mut self, delta: f64) -> Self {
        self.time.iter_mut().for_each(|t| *t += delta);
        self
    }
}

/// Pick the reduction strategy for `count` points under a budget of `max_points`
pub fn choose_strategy(count: usize, max_points: usize) -> Strategy {
    if count <= max_points {
        return Strategy::Exact;
    }
    if max_points < 2 {
        return Strategy::Decimation;
    }
    let ratio = count as f64 / max_points as f64;
    if ratio < MINMAX_RATIO_THRESHOLD {
        Strategy::Decimation
    } else if ratio < RMS_RATIO_THRESHOLD {
        Strategy::MinMax
    } else {
        Strategy::Rms
    }
}

/// Reduce the part of `channel` between `start` and `end` to at most `max_points` points.
///
/// The window is clamped to the channel extent. A window that is empty after clamping
/// falls back to the whole channel.
pub fn resample(channel: &Channel, start: f64, end: f64, max_points: usize) -> ChannelWindow {
    resample_slices(channel.time(), channel.values(), start, end, max_points)
}

/// Same as [`resample`] over bare arrays
pub fn resample_slices(
    time: &[f64],
    values: &[f64],
    start: f64,
    end: f64,
    max_points: usize,
) -> ChannelWindow {
    let n = time.len().min(values.len());
    if n == 0 || max_points == 0 {
        return ChannelWindow::empty();
    }
    let time = &time[..n];
    let values = &values[..n];

    let (first, last) = (time[0], time[n - 1]);
    let mut lo = if start.is_finite() { start.max(first) } else { first };
    let mut hi = if end.is_finite() { end.min(last) } else { last };
    if !(lo < hi) && first < last {
        lo = first;
        hi = last;
    }

    let begin = time.partition_point(|t| *t < lo);
    let stop = time.partition_point(|t| *t <= hi);
    let (begin, stop) = if begin < stop { (begin, stop) } else { (0, n) };

    let time = &time[begin..stop];
    let values = &values[begin..stop];
    match choose_strategy(time.len(), max_points) {
        Strategy::Exact => ChannelWindow {
            time: time.to_vec(),
            values: values.to_vec(),
            strategy: Strategy::Exact,
        },
        Strategy::Decimation => decimate(time, values, max_points),
        Strategy::MinMax => min_max_buckets(time, values, max_points),
        Strategy::Rms => rms_buckets(time, values, max_points),
    }
}

/// Keep every stride-th sample
pub fn decimate(time: &[f64], values: &[f64], max_points: usize) -> ChannelWindow {
    let stride = time.len().div_ceil(max_points.max(1));
    ChannelWindow {
        time: time.iter().step_by(stride).copied().collect(),
        values: values.iter().step_by(stride).copied().collect(),
        strategy: Strategy::Decimation,
    }
}

/// Emit the minimum and maximum of each bucket in the order they occurred
pub fn min_max_buckets(time: &[f64], values: &[f64], max_points: usize) -> ChannelWindow {
    let half = (max_points / 2).max(1);
    let bucket = time.len().div_ceil(half);
    let mut out_time = Vec::with_capacity(2 * half);
    let mut out_values = Vec::with_capacity(2 * half);
    for (offset, chunk) in (0..time.len()).step_by(bucket).zip(values.chunks(bucket)) {
        let mut min_idx = 0;
        let mut max_idx = 0;
        for (idx, v) in chunk.iter().enumerate() {
            if *v < chunk[min_idx] {
                min_idx = idx;
            }
            if *v > chunk[max_idx] {
                max_idx = idx;
            }
        }
        let (a, b) = if min_idx <= max_idx {
            (min_idx, max_idx)
        } else {
            (max_idx, min_idx)
        };
        out_time.push(time[offset + a]);
        out_values.push(chunk[a]);
        if a != b {
            out_time.push(time[offset + b]);
            out_values.push(chunk[b]);
        }
    }
    ChannelWindow {
        time: out_time,
        values: out_values,
        strategy: Strategy::MinMax,
    }
}

/// One point per bucket: mean time, root mean square value
pub fn rms_buckets(time: &[f64], values: &[f64], max_points: usize) -> ChannelWindow {
    let bucket = time.len().div_ceil(max_points.max(1));
    let (out_time, out_values) = time
        .chunks(bucket)
        .zip(values.chunks(bucket))
        .map(|(t, v)| {
            let n = t.len() as f64;
            let mean_time = t.iter().sum::<f64>() / n;
            let rms = (v.iter().map(|x| x * x).sum::<f64>() / n).sqrt();
            (mean_time, rms)
        })
        .unzip();
    ChannelWindow {
        time: out_time,
        values: out_values,
        strategy: Strategy::Rms,
    }
}

/// Magnitude of three co-timed axes, each reduced to the same budget first.
///
/// The result covers the shortest of the three reduced axes and uses the time axis of
/// the first one.
pub fn magnitude(
    axes: [&Channel; 3],
    start: f64,
    end: f64,
    max_points: usize,
) -> ChannelWindow {
    let [x, y, z] = axes.map(|axis| resample(axis, start, end, max_points));
    let n = x.len().min(y.len()).min(z.len());
    let values = (0..n)
        .map(|i| (x.values[i].powi(2) + y.values[i].powi(2) + z.values[i].powi(2)).sqrt())
        .collect();
    let mut time = x.time;
    time.truncate(n);
    ChannelWindow {
        time,
        values,
        strategy: x.strategy,
    }
}

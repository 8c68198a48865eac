use super::channel::{Channel, ChannelKind, Dataset, SourceKind, TimeUnit};
use super::config::EngineConfig;
use super::constants::MAX_TIME_JUMP_FACTOR;
use super::error::DecodeError;
use super::interpolate::interpolate_channel;
use super::layout::{detect_layout, parse_decimal, split_row, Layout, TimeColumn, ValueCount};

/// How the value columns of a format are named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnNames {
    /// A fixed set of axes
    Axes(&'static [&'static str]),
    /// Any number of columns, numbered from 1 after a prefix
    Numbered(&'static str),
}

/// Description of one delimited instrument format
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarFormat {
    pub source: SourceKind,
    pub columns: ColumnNames,
    pub label: &'static str,
    pub unit: &'static str,
    pub time_unit: TimeUnit,
    /// Spacing of the synthesized time axis, in `time_unit`
    pub interval: f64,
    /// Re-grid served channels at this step, in `time_unit`
    pub interpolation_step: Option<f64>,
}

impl ColumnarFormat {
    /// The format for a columnar source, or None for the binary sources
    pub fn for_source(source: SourceKind, config: &EngineConfig) -> Option<Self> {
        match source {
            SourceKind::Temperature => Some(Self {
                source,
                columns: ColumnNames::Numbered("t"),
                label: "Temperature",
                unit: "°C",
                time_unit: TimeUnit::Milliseconds,
                interval: config.temperature_interval_ms,
                interpolation_step: None,
            }),
            SourceKind::Acceleration => Some(Self {
                source,
                columns: ColumnNames::Axes(&["x", "y", "z"]),
                label: "Acceleration",
                unit: "g",
                time_unit: TimeUnit::Microseconds,
                interval: config.acceleration_interval_us,
                interpolation_step: None,
            }),
            SourceKind::Position => Some(Self {
                source,
                columns: ColumnNames::Axes(&["z"]),
                label: "Position",
                unit: "mm",
                time_unit: TimeUnit::Microseconds,
                interval: config.position_interval_us,
                interpolation_step: Some(config.position_step_us),
            }),
            SourceKind::Scope | SourceKind::Chunked => None,
        }
    }

    fn value_count(&self) -> ValueCount {
        match self.columns {
            ColumnNames::Axes(axes) => ValueCount::Exactly(axes.len()),
            ColumnNames::Numbered(_) => ValueCount::AtLeast(1),
        }
    }

    pub fn channel_id(&self, index: usize) -> String {
        match self.columns {
            ColumnNames::Axes(axes) => format!("{}_{}", self.source, axes[index]),
            ColumnNames::Numbered(prefix) => format!("{}_{}{}", self.source, prefix, index + 1),
        }
    }

    fn channel_label(&self, index: usize, header: Option<&str>) -> String {
        if let Some(name) = header.filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        match self.columns {
            ColumnNames::Axes(axes) => format!("{} {}", self.label, axes[index].to_uppercase()),
            ColumnNames::Numbered(_) => format!("{} {}", self.label, index + 1),
        }
    }
}

/// Per-row bookkeeping of what had to be thrown away
#[derive(Debug, Default)]
struct DropCounts {
    bad_time: usize,
    backwards_time: usize,
    time_spike: usize,
    bad_value: Vec<usize>,
}

impl DropCounts {
    fn rows_without_time(&self) -> usize {
        self.bad_time + self.backwards_time + self.time_spike
    }
}

struct Series {
    time: Vec<f64>,
    values: Vec<f64>,
}

// Median of the positive steps between consecutive times
fn typical_step(times: &[f64]) -> Option<f64> {
    let mut steps: Vec<f64> = times
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|step| *step > 0.0)
        .collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_by(f64::total_cmp);
    Some(steps[steps.len() / 2])
}

fn read_rows(
    format: &ColumnarFormat,
    layout: &Layout,
    lines: &[&str],
) -> (Vec<Series>, DropCounts, Option<f64>) {
    let n_values = layout.value_columns.len();
    let mut series: Vec<Series> = (0..n_values)
        .map(|_| Series {
            time: Vec::new(),
            values: Vec::new(),
        })
        .collect();
    let mut drops = DropCounts {
        bad_value: vec![0; n_values],
        ..Default::default()
    };

    let rows: Vec<Vec<&str>> = lines[layout.data_start..]
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| split_row(line, layout.delimiter))
        .collect();
    let raw_times: Vec<Option<f64>> = rows
        .iter()
        .enumerate()
        .map(|(ordinal, fields)| match layout.time_column() {
            None => Some(ordinal as f64 * format.interval),
            Some(column) => fields
                .get(column)
                .and_then(|field| parse_decimal(field, layout.delimiter)),
        })
        .collect();

    // Next parsable time after each row, used to spot a single corrupt timestamp
    let mut next_time: Vec<Option<f64>> = vec![None; raw_times.len()];
    let mut upcoming = None;
    for (index, time) in raw_times.iter().enumerate().rev() {
        next_time[index] = upcoming;
        if time.is_some() {
            upcoming = *time;
        }
    }
    let parsed: Vec<f64> = raw_times.iter().flatten().copied().collect();
    let jump_limit = typical_step(&parsed).map(|step| step * MAX_TIME_JUMP_FACTOR);

    let mut first_time: Option<f64> = None;
    let mut last_time: Option<f64> = None;
    for (index, fields) in rows.iter().enumerate() {
        let Some(raw_time) = raw_times[index] else {
            drops.bad_time += 1;
            continue;
        };
        if last_time.is_some_and(|last| raw_time < last) {
            drops.backwards_time += 1;
            continue;
        }
        // A far jump that the following row undoes is one bad row, not a new baseline
        let is_spike = match (next_time[index], jump_limit) {
            (Some(next), Some(limit)) if next < raw_time => {
                let base = last_time.unwrap_or(next);
                raw_time - base > limit && last_time.map_or(true, |last| next >= last)
            }
            _ => false,
        };
        if is_spike {
            drops.time_spike += 1;
            continue;
        }
        last_time = Some(raw_time);
        let origin = *first_time.get_or_insert(raw_time);
        let time = match layout.time {
            TimeColumn::Synthesized => raw_time,
            TimeColumn::Relative(unit) | TimeColumn::Absolute(unit) => {
                unit.convert(raw_time - origin, format.time_unit)
            }
        };

        for (slot, (output, column)) in series.iter_mut().zip(&layout.value_columns).enumerate() {
            match fields
                .get(*column)
                .and_then(|field| parse_decimal(field, layout.delimiter))
            {
                Some(value) => {
                    output.time.push(time);
                    output.values.push(value);
                }
                None => drops.bad_value[slot] += 1,
            }
        }
    }
    (series, drops, first_time)
}

/// Decode a delimited instrument file.
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, since device exports
/// often carry a legacy code page in their preamble.
pub fn decode_columnar(
    format: &ColumnarFormat,
    buffer: &[u8],
    sniff_lines: usize,
) -> Result<Dataset, DecodeError> {
    let text = String::from_utf8_lossy(buffer);
    let lines: Vec<&str> = text.lines().collect();
    let layout = detect_layout(&lines, format.value_count(), format.time_unit, sniff_lines)?;
    log::debug!("{} layout: {:?}", format.source, layout);

    let mut dataset = Dataset::new(format.source, buffer.len() as u64);
    dataset.header.insert(
        String::from("delimiter"),
        format!("{:?}", layout.delimiter).to_lowercase(),
    );
    dataset
        .header
        .insert(String::from("data_start_line"), layout.data_start.to_string());
    dataset.header.insert(
        String::from("time_column"),
        match layout.time {
            TimeColumn::Synthesized => format!("synthesized every {} {:?}", format.interval, format.time_unit),
            TimeColumn::Relative(unit) => format!("relative {unit:?}"),
            TimeColumn::Absolute(unit) => format!("epoch {unit:?}"),
        }
        .to_lowercase(),
    );

    let (series, drops, first_time) = read_rows(format, &layout, &lines);
    if let (TimeColumn::Absolute(unit), Some(origin)) = (layout.time, first_time) {
        dataset.start_absolute_ms = Some(unit.convert(origin, TimeUnit::Milliseconds).round() as i64);
    }

    for (index, Series { time, values }) in series.into_iter().enumerate() {
        let id = format.channel_id(index);
        let dropped = drops.rows_without_time() + drops.bad_value[index];
        if dropped > 0 {
            dataset.warn(format!(
                "{id}: dropped {dropped} row(s) ({} unparsable time, {} backwards time, {} time spike, {} unparsable value)",
                drops.bad_time, drops.backwards_time, drops.time_spike, drops.bad_value[index]
            ));
        }

        let header_name = layout
            .header
            .as_ref()
            .and_then(|cells| cells.get(layout.value_columns[index]))
            .map(|cell| cell.as_str());
        let channel = Channel::new(
            &id,
            &format.channel_label(index, header_name),
            format.unit,
            ChannelKind::Raw,
            format.time_unit,
            time,
            values,
        )
        .map_err(|e| DecodeError::UnsupportedLayout(e.to_string()))?;

        match format.interpolation_step {
            Some(step) => {
                let uniform = interpolate_channel(&channel, step)
                    .map_err(|e| DecodeError::UnsupportedLayout(e.to_string()))?;
                dataset.diagnostics.insert(id, channel);
                dataset.insert_channel(uniform);
            }
            None => dataset.insert_channel(channel),
        }
    }

    log::info!(
        "Decoded {} file ({}) with {} channels",
        format.source,
        human_bytes::human_bytes(buffer.len() as f64),
        dataset.channels.len()
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::now_epoch_millis;

    fn format(source: SourceKind) -> ColumnarFormat {
        ColumnarFormat::for_source(source, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_acceleration_with_preamble_and_decimal_comma() {
        let file = "Sensor ACC-3\nRate;1kHz\nx;y;z\n0,1;0,2;0,3\n0,4;x;0,6\n0,7;0,8;0,9\n";
        let dataset = decode_columnar(&format(SourceKind::Acceleration), file.as_bytes(), 20).unwrap();
        let x = dataset.channel("acceleration_x").unwrap();
        assert_eq!(x.values(), &[0.1, 0.4, 0.7]);
        assert_eq!(x.time(), &[0.0, 1000.0, 2000.0]);
        assert_eq!(x.time_unit, TimeUnit::Microseconds);
        let y = dataset.channel("acceleration_y").unwrap();
        assert_eq!(y.values(), &[0.2, 0.8]);
        assert_eq!(y.time(), &[0.0, 2000.0]);
        // Only y lost a row
        assert_eq!(dataset.warnings.len(), 1);
        assert!(dataset.warnings[0].starts_with("acceleration_y"));
        assert_eq!(y.label, "y");
    }

    #[test]
    fn test_time_prefixed_rows() {
        let file = "time (s),x,y,z\n1.0,1,2,3\n1.5,4,5,6\nbad,7,8,9\n1.2,0,0,0\n2.0,1,1,1\n";
        let dataset = decode_columnar(&format(SourceKind::Acceleration), file.as_bytes(), 20).unwrap();
        let z = dataset.channel("acceleration_z").unwrap();
        assert_eq!(z.time(), &[0.0, 500_000.0, 1_000_000.0]);
        assert_eq!(z.values(), &[3.0, 6.0, 1.0]);
        // One unparsable and one backwards time, reported once per channel
        assert_eq!(dataset.warnings.len(), 3);
        assert!(dataset.start_absolute_ms.is_none());
    }

    #[test]
    fn test_temperature_flexible_columns() {
        let file = "Time [ms]\tT1\tT2\tT3\n0\t20,5\t21,0\t22,5\n1000\t20,6\t-\t22,4\n";
        let dataset = decode_columnar(&format(SourceKind::Temperature), file.as_bytes(), 20).unwrap();
        assert_eq!(dataset.channels.len(), 3);
        let t2 = dataset.channel("temperature_t2").unwrap();
        assert_eq!(t2.values(), &[21.0]);
        assert_eq!(t2.label, "T2");
        let t3 = dataset.channel("temperature_t3").unwrap();
        assert_eq!(t3.time(), &[0.0, 1000.0]);
        assert_eq!(t3.unit, "°C");
    }

    #[test]
    fn test_epoch_time_sets_absolute_start() {
        let start = now_epoch_millis() - 60_000;
        let file = format!("{},20.0\n{},20.5\n{},21.0\n", start, start + 1000, start + 2000);
        let dataset = decode_columnar(&format(SourceKind::Temperature), file.as_bytes(), 20).unwrap();
        assert_eq!(dataset.start_absolute_ms, Some(start));
        let t1 = dataset.channel("temperature_t1").unwrap();
        assert_eq!(t1.time(), &[0.0, 1000.0, 2000.0]);
    }

    #[test]
    fn test_position_is_interpolated() {
        let file = "0\t1.0\n1100\t2.0\n1900\t3.0\n3000\t4.0\n";
        let dataset = decode_columnar(&format(SourceKind::Position), file.as_bytes(), 20).unwrap();
        let served = dataset.channel("position_z").unwrap();
        assert_eq!(served.kind, ChannelKind::Interpolated);
        assert_eq!(served.time(), &[0.0, 1000.0, 2000.0, 3000.0]);
        assert_eq!(served.values(), &[1.0, 2.0, 3.0, 4.0]);
        let raw = dataset.diagnostic_channel("position_z").unwrap();
        assert_eq!(raw.kind, ChannelKind::Raw);
        assert_eq!(raw.len(), 4);
    }

    #[test]
    fn test_untimed_temperature_with_rising_reading() {
        let file = "20.5\n20.6\n20.7\n20.9\n21.0\n";
        let dataset = decode_columnar(&format(SourceKind::Temperature), file.as_bytes(), 20).unwrap();
        let t1 = dataset.channel("temperature_t1").unwrap();
        assert_eq!(t1.values(), &[20.5, 20.6, 20.7, 20.9, 21.0]);
        assert_eq!(t1.time(), &[0.0, 1000.0, 2000.0, 3000.0, 4000.0]);

        let file = "20.5\t30.1\n20.6\t30.0\n20.7\t29.8\n20.9\t29.9\n21.0\t29.7\n";
        let dataset = decode_columnar(&format(SourceKind::Temperature), file.as_bytes(), 20).unwrap();
        let ids: Vec<String> = dataset.list_channels().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["temperature_t1", "temperature_t2"]);
        assert_eq!(dataset.channel("temperature_t1").unwrap().values()[0], 20.5);
        assert_eq!(dataset.channel("temperature_t2").unwrap().values()[0], 30.1);
    }

    #[test]
    fn test_single_time_spike_is_dropped() {
        let file = "0\t1.0\n1000\t2.0\n2000\t3.0\n3000\t4.0\n4000\t5.0\n1e300\t6.0\n6000\t7.0\n7000\t8.0\n";
        let dataset = decode_columnar(&format(SourceKind::Position), file.as_bytes(), 20).unwrap();
        let raw = dataset.diagnostic_channel("position_z").unwrap();
        assert_eq!(raw.time(), &[0.0, 1000.0, 2000.0, 3000.0, 4000.0, 6000.0, 7000.0]);
        let served = dataset.channel("position_z").unwrap();
        assert_eq!(served.len(), 8);
        assert_eq!(served.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 5.0, 7.0, 8.0]);
        assert_eq!(dataset.warnings.len(), 1);
        assert!(dataset.warnings[0].contains("1 time spike"));

        // A spike on the first row does not swallow the rest of the file
        let file = "time (us)\tz\n1e13\t0.0\n0\t1.0\n1000\t2.0\n2000\t3.0\n3000\t4.0\n";
        let dataset = decode_columnar(&format(SourceKind::Position), file.as_bytes(), 20).unwrap();
        let served = dataset.channel("position_z").unwrap();
        assert_eq!(served.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_layout_errors() {
        assert!(matches!(
            decode_columnar(&format(SourceKind::Acceleration), b"1,2\n3,4\n", 20),
            Err(DecodeError::UnsupportedLayout(_))
        ));
        assert!(matches!(
            decode_columnar(&format(SourceKind::Acceleration), b"header only\n", 20),
            Err(DecodeError::BadHeader(_))
        ));
        assert!(matches!(
            decode_columnar(&format(SourceKind::Temperature), b"", 20),
            Err(DecodeError::BadHeader(_))
        ));
    }
}

use super::channel::TimeUnit;
use super::codec::{is_plausible_epoch_millis, now_epoch_millis};
use super::constants::{MAX_TIME_HEURISTIC_VALUE, MAX_TIME_STEP_SPREAD};
use super::error::DecodeError;

// Tokens devices write when a reading is missing
const MISSING_TOKENS: [&str; 6] = ["", "x", "X", "-", "nan", "NaN"];
// Rows inspected by the time column heuristic
const HEURISTIC_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Tab,
    Semicolon,
}

impl Delimiter {
    pub fn as_char(&self) -> char {
        match self {
            Self::Comma => ',',
            Self::Tab => '\t',
            Self::Semicolon => ';',
        }
    }
}

/// Pick the delimiter from a sample of lines.
///
/// Tab and semicolon win when at least half of the lines contain them, since a comma in
/// those files is most likely a decimal separator.
pub fn sniff_delimiter(lines: &[&str]) -> Delimiter {
    let sample: Vec<&str> = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .copied()
        .collect();
    if sample.is_empty() {
        return Delimiter::Comma;
    }
    let lines_with = |c: char| sample.iter().filter(|line| line.contains(c)).count();
    let threshold = sample.len().div_ceil(2);
    let tabs = lines_with('\t');
    let semicolons = lines_with(';');
    if tabs >= threshold && tabs >= semicolons {
        Delimiter::Tab
    } else if semicolons >= threshold {
        Delimiter::Semicolon
    } else {
        Delimiter::Comma
    }
}

pub fn split_row(line: &str, delimiter: Delimiter) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n'])
        .split(delimiter.as_char())
        .map(str::trim)
        .collect()
}

/// Parse a number written with either a dot or a comma as decimal separator.
///
/// Missing-value markers and anything unparsable give None.
pub fn parse_decimal(token: &str, delimiter: Delimiter) -> Option<f64> {
    let token = token.trim().trim_matches('"');
    if MISSING_TOKENS.contains(&token) {
        return None;
    }
    let value = if delimiter != Delimiter::Comma && token.contains(',') {
        token.replace(',', ".").parse::<f64>().ok()?
    } else {
        token.parse::<f64>().ok()?
    };
    value.is_finite().then_some(value)
}

/// Where the time axis of a file comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeColumn {
    /// No time column; one is synthesized at a fixed interval
    Synthesized,
    /// First column holds relative time in `unit`
    Relative(TimeUnit),
    /// First column holds epoch time in `unit` (seconds or milliseconds)
    Absolute(TimeUnit),
}

/// The resolved shape of a delimited file
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub delimiter: Delimiter,
    /// Index of the first data line
    pub data_start: usize,
    pub time: TimeColumn,
    /// Column index of each value series
    pub value_columns: Vec<usize>,
    /// Column names from the header row, if one precedes the data
    pub header: Option<Vec<String>>,
}

impl Layout {
    pub fn time_column(&self) -> Option<usize> {
        match self.time {
            TimeColumn::Synthesized => None,
            _ => Some(0),
        }
    }
}

/// How many value columns a format expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCount {
    Exactly(usize),
    AtLeast(usize),
}

impl ValueCount {
    fn minimum(&self) -> usize {
        match self {
            Self::Exactly(n) | Self::AtLeast(n) => *n,
        }
    }
}

// A data row starts with a number and holds nothing but numbers and missing markers
fn is_data_row(fields: &[&str], delimiter: Delimiter) -> bool {
    parse_decimal(fields[0], delimiter).is_some()
        && fields
            .iter()
            .all(|f| parse_decimal(f, delimiter).is_some() || MISSING_TOKENS.contains(f))
}

/// Read a time unit out of a header cell such as `Time (ms)` or `t[µs]`
fn header_time_unit(cell: &str) -> Option<Option<TimeUnit>> {
    let lower = cell.to_lowercase();
    if !(lower.contains("time") || lower.contains("zeit") || lower == "t" || lower.starts_with("t ") || lower.starts_with("t[") || lower.starts_with("t(")) {
        return None;
    }
    let unit = lower
        .split(['(', '[', ' '])
        .skip(1)
        .map(|part| part.trim_end_matches([')', ']']).trim())
        .find_map(|unit| match unit {
            "s" | "sec" => Some(TimeUnit::Seconds),
            "ms" => Some(TimeUnit::Milliseconds),
            "us" | "µs" | "μs" => Some(TimeUnit::Microseconds),
            _ => None,
        });
    Some(unit)
}

// Every step within MAX_TIME_STEP_SPREAD of the mean step
fn has_regular_step(values: &[f64]) -> bool {
    let steps: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    if steps.len() < 2 {
        return false;
    }
    let mean = steps.iter().sum::<f64>() / steps.len() as f64;
    steps
        .iter()
        .all(|step| (step - mean).abs() <= MAX_TIME_STEP_SPREAD * mean)
}

/// Decide whether the first column of the first data rows looks like time.
///
/// With `strict` set, a small relative column must also start at zero and advance in a
/// steady step. Formats with a variable number of value columns need this, since any
/// rising reading would otherwise pass for time.
fn first_column_time(
    rows: &[Vec<&str>],
    delimiter: Delimiter,
    default_unit: TimeUnit,
    strict: bool,
) -> Option<TimeColumn> {
    let firsts: Vec<f64> = rows
        .iter()
        .take(HEURISTIC_ROWS)
        .map_while(|row| parse_decimal(row[0], delimiter))
        .collect();
    if firsts.len() < 2 || !firsts.windows(2).all(|w| w[0] < w[1]) {
        return None;
    }
    let first = firsts[0];
    if (0.0..MAX_TIME_HEURISTIC_VALUE).contains(&first) {
        if strict && !(first == 0.0 && has_regular_step(&firsts)) {
            return None;
        }
        return Some(TimeColumn::Relative(default_unit));
    }
    let now = now_epoch_millis();
    if is_plausible_epoch_millis(first as i64, now) {
        Some(TimeColumn::Absolute(TimeUnit::Milliseconds))
    } else if is_plausible_epoch_millis((first * 1000.0) as i64, now) {
        Some(TimeColumn::Absolute(TimeUnit::Seconds))
    } else {
        None
    }
}

/// Resolve the layout of a delimited file once, before any rows are parsed.
pub fn detect_layout(
    lines: &[&str],
    expected: ValueCount,
    default_time_unit: TimeUnit,
    sniff_lines: usize,
) -> Result<Layout, DecodeError> {
    let sample: Vec<&str> = lines.iter().take(sniff_lines.max(1)).copied().collect();
    let delimiter = sniff_delimiter(&sample);
    let minimum = expected.minimum().max(1);

    let data_start = lines
        .iter()
        .position(|line| {
            !line.trim().is_empty() && is_data_row(&split_row(line, delimiter), delimiter)
        })
        .ok_or_else(|| DecodeError::BadHeader(String::from("no numeric data rows found")))?;

    let header: Option<Vec<String>> = lines[..data_start]
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| split_row(line, delimiter).iter().map(|s| s.to_string()).collect());

    let rows: Vec<Vec<&str>> = lines[data_start..]
        .iter()
        .filter(|line| !line.trim().is_empty())
        .take(HEURISTIC_ROWS)
        .map(|line| split_row(line, delimiter))
        .collect();
    let width = rows[0].len();
    if width < minimum {
        return Err(DecodeError::UnsupportedLayout(format!(
            "found {width} columns but at least {minimum} are needed"
        )));
    }

    let header_unit = header
        .as_ref()
        .and_then(|cells| cells.first())
        .and_then(|cell| header_time_unit(cell));

    // A file with no room for a time column besides the values has none
    let time = if width <= minimum {
        TimeColumn::Synthesized
    } else if let Some(unit) = header_unit {
        let unit = unit.unwrap_or(default_time_unit);
        match first_column_time(&rows, delimiter, unit, false) {
            Some(TimeColumn::Absolute(absolute)) => TimeColumn::Absolute(absolute),
            _ => TimeColumn::Relative(unit),
        }
    } else {
        let strict = matches!(expected, ValueCount::AtLeast(_));
        first_column_time(&rows, delimiter, default_time_unit, strict)
            .unwrap_or(TimeColumn::Synthesized)
    };

    let first_value = match time {
        TimeColumn::Synthesized if width > minimum && matches!(expected, ValueCount::Exactly(_)) => 1,
        TimeColumn::Synthesized => 0,
        _ => 1,
    };
    let value_columns: Vec<usize> = match expected {
        ValueCount::Exactly(n) => (first_value..first_value + n).collect(),
        ValueCount::AtLeast(_) => (first_value..width).collect(),
    };
    if value_columns.is_empty() || value_columns.iter().any(|c| *c >= width) {
        return Err(DecodeError::UnsupportedLayout(format!(
            "found {width} columns, not enough for a time column plus {minimum} value column(s)"
        )));
    }

    Ok(Layout {
        delimiter,
        data_start,
        time,
        value_columns,
        header,
    })
}

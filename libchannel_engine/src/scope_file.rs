use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::channel::{Calibration, Channel, ChannelKind, Dataset, SourceKind, TimeUnit};
use super::codec::{read_var_len_string, ticks_to_epoch_millis};
use super::constants::{NANOS_PER_SECOND, NUMBER_OF_RAW_CHANNELS, SAMPLE_SIZE_BYTES};
use super::derived::compute_derived_channels;
use super::error::DecodeError;

/// The metadata block at the front of a scope dump
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeHeader {
    pub description: String,
    pub buffer_size: u32,
    pub start_ticks: i64,
    pub max_adc_value: i16,
    pub channel_range: [i32; NUMBER_OF_RAW_CHANNELS],
    pub channel_scaling: [i16; NUMBER_OF_RAW_CHANNELS],
    pub sampling_interval_ns: u32,
    pub downsampling: [i32; NUMBER_OF_RAW_CHANNELS],
    pub units: Vec<String>,
    pub labels: Vec<String>,
}

impl ScopeHeader {
    /// Parse the metadata block. Returns the header and the offset of the sample stream.
    ///
    /// Any failure here is fatal: without the metadata we cannot shape the channels.
    pub fn parse(buffer: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (description, offset) = read_var_len_string(buffer, 0)?;
        let mut cursor = Cursor::new(buffer);
        cursor.set_position(offset as u64);

        let buffer_size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(&cursor))?;
        let start_ticks = cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| truncated(&cursor))?;
        let max_adc_value = cursor
            .read_i16::<LittleEndian>()
            .map_err(|_| truncated(&cursor))?;
        let mut channel_range = [0i32; NUMBER_OF_RAW_CHANNELS];
        cursor
            .read_i32_into::<LittleEndian>(&mut channel_range)
            .map_err(|_| truncated(&cursor))?;
        let mut channel_scaling = [0i16; NUMBER_OF_RAW_CHANNELS];
        cursor
            .read_i16_into::<LittleEndian>(&mut channel_scaling)
            .map_err(|_| truncated(&cursor))?;
        let sampling_interval_ns = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(&cursor))?;
        let mut downsampling = [0i32; NUMBER_OF_RAW_CHANNELS];
        cursor
            .read_i32_into::<LittleEndian>(&mut downsampling)
            .map_err(|_| truncated(&cursor))?;

        let mut offset = cursor.position() as usize;
        let mut units = Vec::with_capacity(NUMBER_OF_RAW_CHANNELS);
        for _ in 0..NUMBER_OF_RAW_CHANNELS {
            let (unit, next) = read_var_len_string(buffer, offset)?;
            units.push(unit);
            offset = next;
        }
        let mut labels = Vec::with_capacity(NUMBER_OF_RAW_CHANNELS);
        for _ in 0..NUMBER_OF_RAW_CHANNELS {
            let (label, next) = read_var_len_string(buffer, offset)?;
            labels.push(label);
            offset = next;
        }

        let header = Self {
            description,
            buffer_size,
            start_ticks,
            max_adc_value,
            channel_range,
            channel_scaling,
            sampling_interval_ns,
            downsampling,
            units,
            labels,
        };
        header.validate()?;
        Ok((header, offset))
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.max_adc_value <= 0 {
            return Err(DecodeError::BadHeader(format!(
                "max ADC value must be positive, found {}",
                self.max_adc_value
            )));
        }
        if self.sampling_interval_ns == 0 {
            return Err(DecodeError::BadHeader(String::from(
                "sampling interval is zero",
            )));
        }
        if let Some((channel, factor)) = self
            .downsampling
            .iter()
            .enumerate()
            .find(|(_, factor)| **factor < 1)
        {
            return Err(DecodeError::UnsupportedLayout(format!(
                "channel {channel} has downsampling factor {factor}"
            )));
        }
        Ok(())
    }

    /// Number of points channel `c` holds once fully decoded
    pub fn expected_points(&self, channel: usize) -> usize {
        (self.buffer_size / self.downsampling[channel] as u32) as usize
    }

    /// Counts to physical value for channel `c` (range in mV)
    pub fn calibration(&self, channel: usize) -> Calibration {
        let gain = self.channel_range[channel] as f64
            / self.max_adc_value as f64
            / 1000.0
            * self.channel_scaling[channel] as f64;
        Calibration::new(gain, 0.0)
    }

    /// Time between two points of channel `c` in seconds
    pub fn channel_interval_seconds(&self, channel: usize) -> f64 {
        (self.sampling_interval_ns as f64 * self.downsampling[channel] as f64) / NANOS_PER_SECOND
    }

    fn label(&self, channel: usize) -> String {
        match self.labels.get(channel) {
            Some(label) if !label.is_empty() => label.clone(),
            _ => format!("Channel {channel}"),
        }
    }
}

fn truncated(cursor: &Cursor<&[u8]>) -> DecodeError {
    DecodeError::Truncated(cursor.position() as usize)
}

/// Decode a scope dump into 8 raw channels plus the derived channels.
///
/// A stream that ends early is not an error: every channel keeps what was read and a
/// warning is recorded on the dataset.
pub fn decode_scope_file(buffer: &[u8]) -> Result<Dataset, DecodeError> {
    let (header, stream_start) = ScopeHeader::parse(buffer)?;
    let mut dataset = Dataset::new(SourceKind::Scope, buffer.len() as u64);
    dataset
        .header
        .insert(String::from("description"), header.description.clone());
    dataset
        .header
        .insert(String::from("buffer_size"), header.buffer_size.to_string());
    dataset.header.insert(
        String::from("sampling_interval_ns"),
        header.sampling_interval_ns.to_string(),
    );
    dataset
        .header
        .insert(String::from("max_adc_value"), header.max_adc_value.to_string());

    dataset.start_absolute_ms = ticks_to_epoch_millis(header.start_ticks);
    if dataset.start_absolute_ms.is_none() {
        dataset.warn(format!(
            "absolute start time {:#x} is not plausible; alignment is disabled for this file",
            header.start_ticks
        ));
    }

    let samples = read_sample_stream(&header, &buffer[stream_start..], &mut dataset);
    for (c, counts) in samples.into_iter().enumerate() {
        let calibration = header.calibration(c);
        let interval = header.channel_interval_seconds(c);
        let time: Vec<f64> = (0..counts.len()).map(|i| i as f64 * interval).collect();
        let values: Vec<f64> = counts
            .into_iter()
            .map(|count| calibration.apply(count as f64))
            .collect();
        let channel = Channel::new(
            &format!("raw_{c}"),
            &header.label(c),
            &header.units[c],
            ChannelKind::Raw,
            TimeUnit::Seconds,
            time,
            values,
        )
        .map_err(|e| DecodeError::BadHeader(e.to_string()))?;
        dataset.insert_channel(channel);
    }

    compute_derived_channels(&mut dataset);
    log::info!(
        "Decoded scope file ({}) with {} channels",
        human_bytes::human_bytes(buffer.len() as f64),
        dataset.channels.len()
    );
    Ok(dataset)
}

/// Walk the interleaved stream. Channel `c` has a sample at step `j` iff `j % ds[c] == 0`
/// and it has not yet reached its `buffer_size / ds[c]` points.
fn read_sample_stream(header: &ScopeHeader, stream: &[u8], dataset: &mut Dataset) -> Vec<Vec<i16>> {
    let expected: Vec<usize> = (0..NUMBER_OF_RAW_CHANNELS)
        .map(|c| header.expected_points(c))
        .collect();
    let mut samples: Vec<Vec<i16>> = expected.iter().map(|n| Vec::with_capacity(*n)).collect();
    let mut position = 0;
    'stream: for j in 0..header.buffer_size as usize {
        for (c, channel_samples) in samples.iter_mut().enumerate() {
            if j % header.downsampling[c] as usize != 0 || channel_samples.len() >= expected[c] {
                continue;
            }
            if position + SAMPLE_SIZE_BYTES > stream.len() {
                dataset.warn(format!(
                    "sample stream ended at step {j} of {} (channel {c}); keeping partial data",
                    header.buffer_size
                ));
                break 'stream;
            }
            channel_samples.push(LittleEndian::read_i16(&stream[position..]));
            position += SAMPLE_SIZE_BYTES;
        }
    }
    samples
}

/// Serialize a header and per-channel samples in the scope dump layout.
///
/// Channels are interleaved following the downsampling rule; a channel with too few
/// samples simply ends the stream there. Used to build fixtures.
pub fn write_scope_file(header: &ScopeHeader, samples: &[Vec<i16>]) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_var_len_string(&mut bytes, &header.description);
    // Writes into a Vec cannot fail
    let _ = bytes.write_u32::<LittleEndian>(header.buffer_size);
    let _ = bytes.write_i64::<LittleEndian>(header.start_ticks);
    let _ = bytes.write_i16::<LittleEndian>(header.max_adc_value);
    for range in header.channel_range {
        let _ = bytes.write_i32::<LittleEndian>(range);
    }
    for scaling in header.channel_scaling {
        let _ = bytes.write_i16::<LittleEndian>(scaling);
    }
    let _ = bytes.write_u32::<LittleEndian>(header.sampling_interval_ns);
    for factor in header.downsampling {
        let _ = bytes.write_i32::<LittleEndian>(factor);
    }
    for c in 0..NUMBER_OF_RAW_CHANNELS {
        write_var_len_string(&mut bytes, header.units.get(c).map_or("", |s| s.as_str()));
    }
    for c in 0..NUMBER_OF_RAW_CHANNELS {
        write_var_len_string(&mut bytes, header.labels.get(c).map_or("", |s| s.as_str()));
    }

    let mut cursors = [0usize; NUMBER_OF_RAW_CHANNELS];
    'stream: for j in 0..header.buffer_size as usize {
        for c in 0..NUMBER_OF_RAW_CHANNELS {
            if header.downsampling[c] < 1
                || j % header.downsampling[c] as usize != 0
                || cursors[c] >= header.expected_points(c)
            {
                continue;
            }
            match samples.get(c).and_then(|s| s.get(cursors[c])) {
                Some(sample) => {
                    let _ = bytes.write_i16::<LittleEndian>(*sample);
                    cursors[c] += 1;
                }
                None => break 'stream,
            }
        }
    }
    bytes
}

fn write_var_len_string(bytes: &mut Vec<u8>, text: &str) {
    let mut length = text.len();
    loop {
        let byte = (length & 0x7F) as u8;
        length >>= 7;
        if length == 0 {
            bytes.push(byte);
            break;
        }
        bytes.push(byte | 0x80);
    }
    bytes.extend_from_slice(text.as_bytes());
}

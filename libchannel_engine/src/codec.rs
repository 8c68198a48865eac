use super::constants::{
    MAX_VAR_LEN_SHIFT, PLAUSIBLE_WINDOW_MILLIS, TICKS_AT_UNIX_EPOCH, TICKS_PER_MILLI,
    TICK_VALUE_MASK,
};
use super::error::DecodeError;

/// Read a string prefixed by a var-len (7 bits per byte, little end first) length.
///
/// Returns the string and the offset of the first byte after it. Strings are decoded
/// lossily; some devices write Latin-1 labels.
pub fn read_var_len_string(buffer: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let mut length: u64 = 0;
    let mut shift: u32 = 0;
    let mut position = offset;
    loop {
        let byte = *buffer
            .get(position)
            .ok_or(DecodeError::Truncated(position))?;
        position += 1;
        length |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > MAX_VAR_LEN_SHIFT {
            return Err(DecodeError::LengthOverflow(position));
        }
    }

    let end = position
        .checked_add(length as usize)
        .ok_or(DecodeError::LengthOverflow(position))?;
    if end > buffer.len() {
        return Err(DecodeError::Truncated(buffer.len()));
    }
    let text = String::from_utf8_lossy(&buffer[position..end]).into_owned();
    Ok((text, end))
}

/// Current wall-clock time in epoch milliseconds
pub fn now_epoch_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert a raw tick timestamp to epoch milliseconds.
///
/// Returns None if the result is not within a year of now, which in practice means the
/// bytes were not a timestamp at all.
pub fn ticks_to_epoch_millis(raw_ticks: i64) -> Option<i64> {
    ticks_to_epoch_millis_at(raw_ticks, now_epoch_millis())
}

/// Same as [`ticks_to_epoch_millis`] with an explicit reference time
pub fn ticks_to_epoch_millis_at(raw_ticks: i64, reference_millis: i64) -> Option<i64> {
    let ticks = raw_ticks & TICK_VALUE_MASK;
    let millis = (ticks - TICKS_AT_UNIX_EPOCH) / TICKS_PER_MILLI;
    if is_plausible_epoch_millis(millis, reference_millis) {
        Some(millis)
    } else {
        None
    }
}

pub fn is_plausible_epoch_millis(millis: i64, reference_millis: i64) -> bool {
    millis.abs_diff(reference_millis) <= PLAUSIBLE_WINDOW_MILLIS as u64
}

/// Convert epoch milliseconds back to the tick format (UTC kind flag set)
pub fn epoch_millis_to_ticks(millis: i64) -> i64 {
    (millis * TICKS_PER_MILLI + TICKS_AT_UNIX_EPOCH) | (1 << 62)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_length() {
        let buffer = [3u8, b'a', b'b', b'c', 0xFF];
        let (text, next) = read_var_len_string(&buffer, 0).unwrap();
        assert_eq!(text, "abc");
        assert_eq!(next, 4);
    }

    #[test]
    fn test_multi_byte_length() {
        let mut buffer = vec![0x80 | (200 & 0x7F), 200 >> 7];
        buffer.extend(std::iter::repeat(b'z').take(200));
        let (text, next) = read_var_len_string(&buffer, 0).unwrap();
        assert_eq!(text.len(), 200);
        assert_eq!(next, 202);
    }

    #[test]
    fn test_empty_string() {
        let buffer = [0u8, 7];
        let (text, next) = read_var_len_string(&buffer, 0).unwrap();
        assert!(text.is_empty());
        assert_eq!(next, 1);
    }

    #[test]
    fn test_truncated_prefix_and_payload() {
        assert!(matches!(
            read_var_len_string(&[0x85], 0),
            Err(DecodeError::Truncated(_))
        ));
        assert!(matches!(
            read_var_len_string(&[5, b'a', b'b'], 0),
            Err(DecodeError::Truncated(_))
        ));
        assert!(matches!(
            read_var_len_string(&[], 0),
            Err(DecodeError::Truncated(_))
        ));
    }

    #[test]
    fn test_length_overflow() {
        let buffer = [0xFFu8; 8];
        assert!(matches!(
            read_var_len_string(&buffer, 0),
            Err(DecodeError::LengthOverflow(_))
        ));
    }

    #[test]
    fn test_ticks_round_trip() {
        let reference = 1_700_000_000_000;
        let ticks = epoch_millis_to_ticks(reference + 5_000);
        assert_eq!(ticks_to_epoch_millis_at(ticks, reference), Some(reference + 5_000));
        // Sign bit must be ignored as well
        assert_eq!(
            ticks_to_epoch_millis_at(ticks | i64::MIN, reference),
            Some(reference + 5_000)
        );
    }

    #[test]
    fn test_ticks_implausible() {
        let reference = 1_700_000_000_000;
        assert_eq!(ticks_to_epoch_millis_at(0, reference), None);
        let far_future = epoch_millis_to_ticks(reference + 2 * PLAUSIBLE_WINDOW_MILLIS);
        assert_eq!(ticks_to_epoch_millis_at(far_future, reference), None);
    }
}

use super::channel::{Channel, ChannelKind};
use super::constants::{MAX_INTERPOLATED_POINTS, MAX_INTERPOLATION_EXPANSION};
use super::error::ChannelError;

/// Number of output points for a span, or None if it would exceed the output bound
fn output_len(span: f64, step: f64, input_len: usize) -> Option<usize> {
    let steps = (span / step).floor();
    let limit = input_len
        .saturating_mul(MAX_INTERPOLATION_EXPANSION)
        .min(MAX_INTERPOLATED_POINTS);
    if !steps.is_finite() || steps >= limit as f64 {
        return None;
    }
    Some(steps as usize + 1)
}

/// Re-grid an ascending series onto a fixed step using nearest-neighbour assignment.
///
/// Each source sample owns the half-step window centred on it. The cursor only moves
/// forward, so this is a single pass over both arrays. Bad input, or a span that would
/// need far more points than the input holds, gives empty output.
pub fn interpolate(time: &[f64], values: &[f64], step: f64) -> (Vec<f64>, Vec<f64>) {
    if time.is_empty() || time.len() != values.len() || !(step > 0.0) || !step.is_finite() {
        return (Vec::new(), Vec::new());
    }
    let first = time[0];
    let last = time[time.len() - 1];
    if !(last >= first) {
        return (Vec::new(), Vec::new());
    }

    let Some(n_out) = output_len(last - first, step, time.len()) else {
        return (Vec::new(), Vec::new());
    };
    let half_step = step / 2.0;
    let mut out_time = Vec::with_capacity(n_out);
    let mut out_values = Vec::with_capacity(n_out);
    let mut cursor = 0;
    for j in 0..n_out {
        let target = first + j as f64 * step;
        while cursor + 1 < time.len() && time[cursor + 1] - half_step < target {
            cursor += 1;
        }
        out_time.push(target);
        out_values.push(values[cursor]);
    }
    (out_time, out_values)
}

/// Produce a new, uniformly spaced channel from `channel`. The input is left untouched.
pub fn interpolate_channel(channel: &Channel, step: f64) -> Result<Channel, ChannelError> {
    let (time, values) = interpolate(channel.time(), channel.values(), step);
    if time.is_empty() && !channel.is_empty() {
        log::warn!(
            "{}: cannot re-grid {} points at a step of {step}, the time span is too wide",
            channel.id,
            channel.len()
        );
    }
    Ok(Channel::new(
        &channel.id,
        &channel.label,
        &channel.unit,
        ChannelKind::Interpolated,
        channel.time_unit,
        time,
        values,
    )?
    .with_sources(&[&channel.id]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TimeUnit;

    #[test]
    fn test_uniform_input_is_reproduced() {
        let time: Vec<f64> = (0..50).map(|i| i as f64 * 250.0).collect();
        let values: Vec<f64> = (0..50).map(|i| (i as f64).cos()).collect();
        let (out_time, out_values) = interpolate(&time, &values, 250.0);
        assert_eq!(out_time, time);
        assert_eq!(out_values, values);
    }

    #[test]
    fn test_single_gap_half_step_ownership() {
        let (out_time, out_values) = interpolate(&[0.0, 2000.0], &[5.0, 7.0], 1000.0);
        assert_eq!(out_time, vec![0.0, 1000.0, 2000.0]);
        assert_eq!(out_values, vec![5.0, 5.0, 7.0]);
    }

    #[test]
    fn test_boundary_belongs_to_earlier_sample() {
        // Target 1000 sits exactly on the half-step boundary of the sample at 1500
        let (_, out_values) = interpolate(&[0.0, 1500.0, 3000.0], &[1.0, 2.0, 3.0], 1000.0);
        assert_eq!(out_values, vec![1.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_irregular_input() {
        let time = [0.0, 900.0, 2100.0, 2950.0, 4000.0];
        let values = [0.0, 1.0, 2.0, 3.0, 4.0];
        let (out_time, out_values) = interpolate(&time, &values, 1000.0);
        assert_eq!(out_time.len(), 5);
        assert_eq!(out_values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_degenerate_input() {
        assert!(interpolate(&[], &[], 1000.0).0.is_empty());
        assert!(interpolate(&[0.0, 1.0], &[1.0], 1000.0).0.is_empty());
        assert!(interpolate(&[0.0, 1.0], &[1.0, 2.0], 0.0).0.is_empty());
        assert!(interpolate(&[0.0, 1.0], &[1.0, 2.0], f64::NAN).0.is_empty());
        let (time, values) = interpolate(&[10.0], &[3.0], 1000.0);
        assert_eq!((time, values), (vec![10.0], vec![3.0]));
    }

    #[test]
    fn test_runaway_span_is_bounded() {
        let (time, _) = interpolate(&[0.0, 1.0e300], &[1.0, 2.0], 1000.0);
        assert!(time.is_empty());
        let (time, _) = interpolate(&[0.0, 1.0e13], &[1.0, 2.0], 1000.0);
        assert!(time.is_empty());
        // Up to MAX_INTERPOLATION_EXPANSION points per input point is fine
        let (time, _) = interpolate(&[0.0, 1.0e6], &[1.0, 2.0], 1000.0);
        assert_eq!(time.len(), 1001);
    }

    #[test]
    fn test_channel_wrapper_keeps_input() {
        let raw = Channel::new(
            "position_z",
            "Position",
            "mm",
            ChannelKind::Raw,
            TimeUnit::Microseconds,
            vec![0.0, 1100.0, 1900.0],
            vec![1.0, 2.0, 3.0],
        )
        .unwrap();
        let uniform = interpolate_channel(&raw, 1000.0).unwrap();
        assert_eq!(uniform.kind, ChannelKind::Interpolated);
        assert_eq!(uniform.time(), &[0.0, 1000.0]);
        assert_eq!(uniform.values(), &[1.0, 2.0]);
        assert_eq!(uniform.sources, vec![String::from("position_z")]);
        assert_eq!(raw.len(), 3);
    }
}

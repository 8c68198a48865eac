// Calculated channels of the scope dump. Each one is a fixed formula over two or three
// already-decoded channels:
//
// calc_0 = -raw_0 - raw_1
// calc_1 = -raw_2 - raw_3
// calc_2 = -raw_4 - raw_5
// calc_3 = K * (|raw_2| + |raw_3| + |calc_1|)
// calc_4 = K * (|raw_4| + |raw_5| + |calc_2|)
// calc_5 = (|raw_0| + |raw_1| + |calc_0|) / K
// calc_6 = raw_6 * C1 - raw_7 * C2
//
// Order matters, calc_3..5 read calc_0..2, so DERIVED_CHANNELS is listed in dependency order.
use super::channel::{Channel, ChannelKind, Dataset};
use super::constants::{FORCE_COEFF_LOWER, FORCE_COEFF_UPPER, TRANSFORMER_RATIO};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    NegatedSum,
    ScaledAbsSum(f64),
    ReducedAbsSum(f64),
    ForceBalance(f64, f64),
}

impl Formula {
    fn apply(&self, x: &[f64]) -> f64 {
        match self {
            Self::NegatedSum => -x[0] - x[1],
            Self::ScaledAbsSum(k) => k * (x[0].abs() + x[1].abs() + x[2].abs()),
            Self::ReducedAbsSum(k) => (x[0].abs() + x[1].abs() + x[2].abs()) / k,
            Self::ForceBalance(c1, c2) => x[0] * c1 - x[1] * c2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DerivedDefinition {
    pub id: &'static str,
    pub label: &'static str,
    /// None means the unit of the first input
    pub unit: Option<&'static str>,
    pub inputs: &'static [&'static str],
    pub formula: Formula,
}

pub const DERIVED_CHANNELS: [DerivedDefinition; 7] = [
    DerivedDefinition {
        id: "calc_0",
        label: "Coil A sum",
        unit: None,
        inputs: &["raw_0", "raw_1"],
        formula: Formula::NegatedSum,
    },
    DerivedDefinition {
        id: "calc_1",
        label: "Coil B sum",
        unit: None,
        inputs: &["raw_2", "raw_3"],
        formula: Formula::NegatedSum,
    },
    DerivedDefinition {
        id: "calc_2",
        label: "Coil C sum",
        unit: None,
        inputs: &["raw_4", "raw_5"],
        formula: Formula::NegatedSum,
    },
    DerivedDefinition {
        id: "calc_3",
        label: "Coil B current",
        unit: Some("A"),
        inputs: &["raw_2", "raw_3", "calc_1"],
        formula: Formula::ScaledAbsSum(TRANSFORMER_RATIO),
    },
    DerivedDefinition {
        id: "calc_4",
        label: "Coil C current",
        unit: Some("A"),
        inputs: &["raw_4", "raw_5", "calc_2"],
        formula: Formula::ScaledAbsSum(TRANSFORMER_RATIO),
    },
    DerivedDefinition {
        id: "calc_5",
        label: "Coil A voltage",
        unit: Some("V"),
        inputs: &["raw_0", "raw_1", "calc_0"],
        formula: Formula::ReducedAbsSum(TRANSFORMER_RATIO),
    },
    DerivedDefinition {
        id: "calc_6",
        label: "Net force",
        unit: Some("N"),
        inputs: &["raw_6", "raw_7"],
        formula: Formula::ForceBalance(FORCE_COEFF_UPPER, FORCE_COEFF_LOWER),
    },
];

// Spacing of the first two samples, or 0 for a single sample
fn first_step(channel: &Channel) -> f64 {
    match channel.time() {
        [first, second, ..] => second - first,
        _ => 0.0,
    }
}

impl DerivedDefinition {
    /// Evaluate on the time axis of the most coarsely sampled input.
    ///
    /// Inputs may be decimated by different factors, so samples are paired by time, not
    /// by index. Each input contributes its nearest sample, and the output stops where
    /// any input runs out.
    pub fn compute(&self, inputs: &[&Channel]) -> Option<Channel> {
        if inputs.is_empty() {
            return None;
        }
        let steps: Vec<f64> = inputs.iter().map(|c| first_step(c)).collect();
        let reference = steps
            .iter()
            .enumerate()
            .fold(0, |best, (index, step)| if *step > steps[best] { index } else { best });
        let reference_step = steps[reference];
        let tolerances: Vec<f64> = steps
            .iter()
            .map(|step| step.max(reference_step) / 2.0 * (1.0 + 1e-9))
            .collect();

        let mut cursors = vec![0; inputs.len()];
        let mut x = [0.0; 3];
        let mut time = Vec::with_capacity(inputs[reference].len());
        let mut values = Vec::with_capacity(inputs[reference].len());
        'samples: for t in inputs[reference].time() {
            for (k, input) in inputs.iter().enumerate() {
                let input_time = input.time();
                if input_time.is_empty() {
                    break 'samples;
                }
                let cursor = &mut cursors[k];
                while *cursor + 1 < input_time.len()
                    && (input_time[*cursor + 1] - t).abs() <= (input_time[*cursor] - t).abs()
                {
                    *cursor += 1;
                }
                if (input_time[*cursor] - t).abs() > tolerances[k] {
                    break 'samples;
                }
                x[k] = input.values()[*cursor];
            }
            time.push(*t);
            values.push(self.formula.apply(&x));
        }

        let unit = match self.unit {
            Some(unit) => unit,
            None => inputs[0].unit.as_str(),
        };
        Channel::new(
            self.id,
            self.label,
            unit,
            ChannelKind::Calculated,
            inputs[0].time_unit,
            time,
            values,
        )
        .ok()
        .map(|channel| channel.with_sources(self.inputs))
    }
}

/// Add every derived channel whose inputs are present. A missing or empty input skips
/// that channel with a warning.
pub fn compute_derived_channels(dataset: &mut Dataset) {
    for definition in DERIVED_CHANNELS.iter() {
        let missing: Vec<&str> = definition
            .inputs
            .iter()
            .filter(|id| dataset.channels.get(**id).map_or(true, |c| c.is_empty()))
            .copied()
            .collect();
        if !missing.is_empty() {
            dataset.warn(format!(
                "skipping {}: missing input channel(s) {}",
                definition.id,
                missing.join(", ")
            ));
            continue;
        }

        let inputs: Vec<&Channel> = definition
            .inputs
            .iter()
            .filter_map(|id| dataset.channels.get(*id))
            .collect();
        if let Some(channel) = definition.compute(&inputs) {
            dataset.insert_channel(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{SourceKind, TimeUnit};

    fn constant(id: &str, value: f64, n: usize) -> Channel {
        Channel::new(
            id,
            id,
            "V",
            ChannelKind::Raw,
            TimeUnit::Seconds,
            (0..n).map(|i| i as f64).collect(),
            vec![value; n],
        )
        .unwrap()
    }

    fn full_dataset() -> Dataset {
        let mut dataset = Dataset::new(SourceKind::Scope, 0);
        for (c, value) in [1.0, 2.0, 3.0, -4.0, 5.0, 6.0, 0.5, 0.25].iter().enumerate() {
            dataset.insert_channel(constant(&format!("raw_{c}"), *value, 10));
        }
        dataset
    }

    #[test]
    fn test_formulas() {
        let mut dataset = full_dataset();
        compute_derived_channels(&mut dataset);
        assert!(dataset.warnings.is_empty());
        let value = |id: &str| dataset.channel(id).unwrap().values()[0];
        assert_eq!(value("calc_0"), -3.0);
        assert_eq!(value("calc_1"), 1.0);
        assert_eq!(value("calc_2"), -11.0);
        assert_eq!(value("calc_3"), TRANSFORMER_RATIO * (3.0 + 4.0 + 1.0));
        assert_eq!(value("calc_4"), TRANSFORMER_RATIO * (5.0 + 6.0 + 11.0));
        assert_eq!(value("calc_5"), (1.0 + 2.0 + 3.0) / TRANSFORMER_RATIO);
        assert_eq!(
            value("calc_6"),
            0.5 * FORCE_COEFF_UPPER - 0.25 * FORCE_COEFF_LOWER
        );
        let calc_3 = dataset.channel("calc_3").unwrap();
        assert_eq!(calc_3.kind, ChannelKind::Calculated);
        assert_eq!(calc_3.sources, vec!["raw_2", "raw_3", "calc_1"]);
    }

    #[test]
    fn test_missing_prerequisite_is_skipped() {
        let mut dataset = full_dataset();
        dataset.channels.remove("raw_2");
        compute_derived_channels(&mut dataset);
        // calc_1 and calc_3 both need raw_2
        assert_eq!(dataset.warnings.len(), 2);
        assert!(dataset.channel("calc_1").is_err());
        assert!(dataset.channel("calc_3").is_err());
        assert!(dataset.channel("calc_4").is_ok());
    }

    fn ramp(id: &str, n: usize, step: f64) -> Channel {
        Channel::new(
            id,
            id,
            "V",
            ChannelKind::Raw,
            TimeUnit::Seconds,
            (0..n).map(|i| i as f64 * step).collect(),
            (0..n).map(|i| i as f64 * step * 1000.0).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_unequal_downsampling_pairs_by_time() {
        let mut dataset = full_dataset();
        // raw_1 is decimated by 2 over the same capture
        dataset.insert_channel(ramp("raw_0", 100, 1.0e-6));
        dataset.insert_channel(ramp("raw_1", 50, 2.0e-6));
        compute_derived_channels(&mut dataset);

        let raw_0 = dataset.channel("raw_0").unwrap();
        let raw_1 = dataset.channel("raw_1").unwrap();
        let calc_0 = dataset.channel("calc_0").unwrap();
        assert_eq!(calc_0.len(), 50);
        // Still spans the whole capture
        assert_eq!(calc_0.time()[49], raw_1.time()[49]);
        // Both inputs read at t = 80 µs
        assert_eq!(calc_0.time()[40], raw_1.time()[40]);
        assert_eq!(calc_0.values()[40], -raw_0.values()[80] - raw_1.values()[40]);
        assert!((calc_0.values()[40] + 0.16).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths_use_shortest() {
        let mut dataset = full_dataset();
        dataset.insert_channel(constant("raw_1", 2.0, 5));
        compute_derived_channels(&mut dataset);
        assert_eq!(dataset.channel("calc_0").unwrap().len(), 5);
        assert_eq!(dataset.channel("calc_5").unwrap().len(), 5);
        assert_eq!(dataset.channel("calc_1").unwrap().len(), 10);
    }
}

// Scope dump layout
pub const NUMBER_OF_RAW_CHANNELS: usize = 8;
pub const SAMPLE_SIZE_BYTES: usize = 2;
pub const NANOS_PER_SECOND: f64 = 1.0e9;

// Tick time format. Ticks are 100 ns units counted from 0001-01-01; the top two bits
// carry the sign and the UTC/local kind flag.
pub const TICK_VALUE_MASK: i64 = 0x3FFF_FFFF_FFFF_FFFF;
pub const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
pub const TICKS_PER_MILLI: i64 = 10_000;
pub const PLAUSIBLE_WINDOW_MILLIS: i64 = 366 * 24 * 60 * 60 * 1000;

// Var-len string prefix guard
pub const MAX_VAR_LEN_SHIFT: u32 = 35;

// Derived channel coefficients
/// Current transformer ratio used by the coil sum channels
pub const TRANSFORMER_RATIO: f64 = 1000.0;
/// Force conversion for the upper load cell (N/V)
pub const FORCE_COEFF_UPPER: f64 = 2000.0;
/// Force conversion for the lower load cell (N/V)
pub const FORCE_COEFF_LOWER: f64 = 2000.0;

// Resampling strategy thresholds on the oversampling ratio
pub const MINMAX_RATIO_THRESHOLD: f64 = 3.0;
pub const RMS_RATIO_THRESHOLD: f64 = 10.0;

// Columnar sniffing
pub const DEFAULT_SNIFF_LINES: usize = 20;
pub const MAX_TIME_HEURISTIC_VALUE: f64 = 1.0e6;
/// Largest relative deviation from the mean step for an unlabelled column to count as time
pub const MAX_TIME_STEP_SPREAD: f64 = 0.25;
/// A time that overshoots the typical step by this factor and is followed by an earlier
/// time is treated as a corrupt row
pub const MAX_TIME_JUMP_FACTOR: f64 = 100.0;

// Interpolation output bounds
pub const MAX_INTERPOLATION_EXPANSION: usize = 1000;
pub const MAX_INTERPOLATED_POINTS: usize = 100_000_000;

// Samples read per chunk when summarizing a progressive channel
pub const STATISTICS_CHUNK_SAMPLES: usize = 1 << 20;

// Cache defaults
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

pub const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;

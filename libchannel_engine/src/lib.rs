//! # channel_engine
//!
//! channel_engine turns the raw files recorded during a test-bench experiment into named,
//! typed time series ("channels") and serves them to plotting front ends. It decodes a
//! binary oscilloscope dump and several delimited sensor exports, computes the derived
//! channels of the scope dump, reduces any window of a channel to a point budget, places
//! every source of an experiment on a common timeline, and keeps decoded files in a
//! time-limited cache so repeated requests are cheap.
//!
//! ## Installation
//!
//! Currently the only method of install is from source. Clone the repository and build
//! the CLI with `cargo install --path ./channel_engine_cli`.
//!
//! ### HDF5
//!
//! The progressive reader for large chunked measurement files is behind the `hdf5`
//! feature, which needs an HDF5 install on the build machine. Typically this will be
//! installed using a package manager (homebrew, apt, etc), and the Rust libraries will
//! auto detect the location of the HDF install. If it is not found, write the following
//! snippet into `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//! ```
//!
//! Then build with `cargo install --path ./channel_engine_cli --features hdf5`. Without
//! the feature, requests for a `chunked` source fail with an unsupported layout error.
//!
//! ## Configuration
//!
//! The engine is configured with a YAML file. `channel_engine_cli new` writes a template:
//!
//! ```yml
//! data_path: None
//! scope_file_name: scope.bin
//! temperature_file_name: temperature.csv
//! acceleration_file_name: acceleration.csv
//! position_file_name: position.csv
//! chunked_file_name: chunked.h5
//! cache_ttl_secs: 1800
//! cache_capacity: 10
//! master_clock_offset_hours: 0
//! zero_offset_sources: []
//! temperature_interval_ms: 1000.0
//! acceleration_interval_us: 1000.0
//! position_interval_us: 1000.0
//! position_step_us: 1000.0
//! sniff_lines: 20
//! ```
//!
//! Every field is optional; missing fields take the values above. Each experiment lives
//! in its own directory under `data_path`, holding one file per source with the
//! configured name. Alignment results are written next to them as `alignment.yml`.
//!
//! ## Sources and channels
//!
//! | Source         | Format                         | Channel ids                        | Time unit |
//! |----------------|--------------------------------|------------------------------------|-----------|
//! | `scope`        | binary interleaved dump        | `raw_0`..`raw_7`, `calc_0`..`calc_6` | s         |
//! | `temperature`  | delimited, one or more columns | `temperature_t1`, `temperature_t2`, ... | ms     |
//! | `acceleration` | delimited, three axes          | `acceleration_x/y/z`               | µs        |
//! | `position`     | delimited, one axis            | `position_z` (re-gridded)          | µs        |
//! | `chunked`      | HDF5, read on demand           | ids stored in the file             | s         |
//!
//! ## Alignment
//!
//! The scope dump is the master timeline. Every other source gets an offset in seconds,
//! computed from its own absolute start time when it has one, and
//! `aligned = local - offset`. Offsets can be overridden by hand; overrides survive a
//! forced recomputation.
pub mod alignment;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod columnar;
pub mod config;
pub mod constants;
pub mod derived;
pub mod engine;
pub mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5_reader;
pub mod interpolate;
pub mod layout;
pub mod progressive;
pub mod resample;
pub mod scope_file;

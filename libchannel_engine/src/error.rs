use std::path::PathBuf;
use thiserror::Error;

use super::channel::SourceKind;
use super::constants::MAX_VAR_LEN_SHIFT;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoding failed because the buffer ended early at byte {0}")]
    Truncated(usize),
    #[error("Var-len length prefix exceeded {max} bits of shift at byte {0}; stream is most likely corrupt", max=MAX_VAR_LEN_SHIFT)]
    LengthOverflow(usize),
    #[error("Decoding failed due to a bad header: {0}")]
    BadHeader(String),
    #[error("Decoding failed due to an unsupported layout: {0}")]
    UnsupportedLayout(String),
    #[error("Decoding failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[cfg(feature = "hdf5")]
    #[error("Decoding failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel {0} does not exist in the dataset")]
    NotFound(String),
    #[error("Channel id {0:?} is not a valid channel id")]
    InvalidId(String),
    #[error("Channel {0} has {1} time points but {2} values")]
    LengthMismatch(String, usize, usize),
    #[error("Channel {0} could not be read from the progressive reader: {1}")]
    ReadFailed(String, String),
}

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Experiment {0} has no master timeline")]
    NoMasterTimeline(String),
    #[error("Alignment store failed: {0}")]
    Store(String),
    #[error("Alignment store failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Alignment store failed to convert yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("In-flight decode failed: {0}")]
    DecodeInFlightFailed(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No {1} file exists for experiment {0}")]
    NotFound(String, SourceKind),
    #[error("Could not resolve file because path {0:?} does not exist")]
    BadFilePath(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine failed due to decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Engine failed due to channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Engine failed due to alignment error: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("Engine failed due to cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Engine failed to resolve a file: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Engine failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Engine decode task failed to join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

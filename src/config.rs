use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_MAXIMUM_INLINE_PUBLIC_LENGTH: u32 = 131074;
const DEFAULT_MAXIMUM_INLINE_PRIVATE_LENGTH: u32 = 64;
const MAXIMUM_INLINE_LENGTH: u32 = 16 * 1024 * 1024;
const DEFAULT_GZIP_BULK_DATA_THRESHOLD: usize = 1024;

const STUDIES_DIR: &str = "studies";
const DEDUPLICATED_DIR: &str = "deduplicated";
const INSTANCES_DIR: &str = "instances";

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration {path}: {message}")]
    Read { path: String, message: String },
}

/// Configuration of the archive.
///
/// # Fields
///
/// * `root_dir` - Archive root; studies live in `<root>/studies/<study UID>`
/// * `deduplicated_dir` - Root of the deduplicated group snapshots, `<root>/deduplicated` if unset
/// * `instances_dir` - Root of the per instance snapshots, `<root>/instances` if unset
/// * `maximum_inline_public_length` - Largest public attribute value kept inline
/// * `maximum_inline_private_length` - Largest private attribute value kept inline
/// * `write_group` - Maintain deduplicated group snapshots
/// * `write_instance_snapshots` - Write one deduplicated snapshot per instance
/// * `write_instance_metadata` - Write the full metadata of every instance next to its frames
/// * `write_study_metadata` - Regenerate the series and study query views
/// * `bulk_data_uri_prefix` - Prepended to every bulk data URI
/// * `gzip_bulk_data_threshold` - Raw bulk data larger than this is compressed
#[derive(Serialize, Deserialize, Validate, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    #[garde(skip)]
    root_dir: PathBuf,
    #[garde(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    deduplicated_dir: Option<PathBuf>,
    #[garde(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    instances_dir: Option<PathBuf>,

    #[garde(range(min = 1, max = MAXIMUM_INLINE_LENGTH))]
    maximum_inline_public_length: u32,
    #[garde(range(min = 1, max = MAXIMUM_INLINE_LENGTH))]
    maximum_inline_private_length: u32,

    #[garde(skip)]
    write_group: bool,
    #[garde(skip)]
    write_instance_snapshots: bool,
    #[garde(skip)]
    write_instance_metadata: bool,
    #[garde(skip)]
    write_study_metadata: bool,

    #[garde(skip)]
    bulk_data_uri_prefix: String,
    #[garde(skip)]
    gzip_bulk_data_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            deduplicated_dir: None,
            instances_dir: None,
            maximum_inline_public_length: DEFAULT_MAXIMUM_INLINE_PUBLIC_LENGTH,
            maximum_inline_private_length: DEFAULT_MAXIMUM_INLINE_PRIVATE_LENGTH,
            write_group: true,
            write_instance_snapshots: false,
            write_instance_metadata: false,
            write_study_metadata: true,
            bulk_data_uri_prefix: String::new(),
            gzip_bulk_data_threshold: DEFAULT_GZIP_BULK_DATA_THRESHOLD,
        }
    }
}

/// The three directories owned by one study.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StudyPaths {
    pub study_instance_uid: String,
    /// Query views, bulk data and frames.
    pub study_dir: PathBuf,
    /// Deduplicated group snapshots.
    pub deduplicated_dir: PathBuf,
    /// Per instance deduplicated snapshots.
    pub instances_dir: PathBuf,
}

impl Config {
    /// Loads a JSON configuration file, validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let read_error = |message: String| ConfigError::Read {
            path: path.display().to_string(),
            message,
        };
        let contents = fs::read_to_string(path).map_err(|err| read_error(err.to_string()))?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|err| read_error(err.to_string()))?;
        config
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(config)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn studies_dir(&self) -> PathBuf {
        self.root_dir.join(STUDIES_DIR)
    }

    pub fn deduplicated_dir(&self) -> PathBuf {
        self.deduplicated_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(DEDUPLICATED_DIR))
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.instances_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(INSTANCES_DIR))
    }

    pub fn study_paths(&self, study_instance_uid: &str) -> StudyPaths {
        StudyPaths {
            study_instance_uid: study_instance_uid.to_string(),
            study_dir: self.studies_dir().join(study_instance_uid),
            deduplicated_dir: self.deduplicated_dir().join(study_instance_uid),
            instances_dir: self.instances_dir().join(study_instance_uid),
        }
    }

    pub fn maximum_inline_public_length(&self) -> u32 {
        self.maximum_inline_public_length
    }

    pub fn maximum_inline_private_length(&self) -> u32 {
        self.maximum_inline_private_length
    }

    pub fn write_group(&self) -> bool {
        self.write_group
    }

    pub fn write_instance_snapshots(&self) -> bool {
        self.write_instance_snapshots
    }

    pub fn write_instance_metadata(&self) -> bool {
        self.write_instance_metadata
    }

    pub fn write_study_metadata(&self) -> bool {
        self.write_study_metadata
    }

    pub fn bulk_data_uri_prefix(&self) -> &str {
        &self.bulk_data_uri_prefix
    }

    pub fn gzip_bulk_data_threshold(&self) -> usize {
        self.gzip_bulk_data_threshold
    }
}

/// A builder for [`Config`].
///
/// # Example
///
/// ```
/// use dicom_dedup::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .root_dir("/data/archive")
///     .maximum_inline_private_length(256)
///     .write_instance_metadata(true)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.maximum_inline_private_length(), 256);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder(Config::default())
    }

    /// Starts from an existing configuration, e.g. one read with [`Config::from_file`].
    pub fn from_config(config: Config) -> Self {
        ConfigBuilder(config)
    }

    pub fn root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.0.root_dir = root_dir.into();
        self
    }

    pub fn deduplicated_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.0.deduplicated_dir = Some(dir.into());
        self
    }

    pub fn instances_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.0.instances_dir = Some(dir.into());
        self
    }

    pub fn maximum_inline_public_length(mut self, length: u32) -> Self {
        self.0.maximum_inline_public_length = length;
        self
    }

    pub fn maximum_inline_private_length(mut self, length: u32) -> Self {
        self.0.maximum_inline_private_length = length;
        self
    }

    pub fn write_group(mut self, write: bool) -> Self {
        self.0.write_group = write;
        self
    }

    pub fn write_instance_snapshots(mut self, write: bool) -> Self {
        self.0.write_instance_snapshots = write;
        self
    }

    pub fn write_instance_metadata(mut self, write: bool) -> Self {
        self.0.write_instance_metadata = write;
        self
    }

    pub fn write_study_metadata(mut self, write: bool) -> Self {
        self.0.write_study_metadata = write;
        self
    }

    pub fn bulk_data_uri_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.0.bulk_data_uri_prefix = prefix.into();
        self
    }

    pub fn gzip_bulk_data_threshold(mut self, threshold: usize) -> Self {
        self.0.gzip_bulk_data_threshold = threshold;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        self.0
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(self.0)
    }
}

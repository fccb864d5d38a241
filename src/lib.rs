//! Deduplicated, content addressed DICOM study archive.
//!
//! Every ingested DICOM file is converted into a DICOM JSON [`model::AttributeModel`].
//! Values too large to keep inline are written to the study directory by a
//! [`bulkdata::StudyBulkDataWriter`], and pixel data is stored frame by frame. The model is
//! then split into patient, study, series and image fragments which are stored once per
//! distinct content, plus a small instance record referencing them by hash.
//!
//! When a study is complete its state is saved as a snapshot and the DICOMweb style query
//! views (`index.json.gz`, `series/...`) are regenerated.
//!
//! # Example
//!
//! ```no_run
//! use dicom_dedup::config::ConfigBuilder;
//! use dicom_dedup::Archive;
//!
//! let config = ConfigBuilder::new().root_dir("/data/archive").build()?;
//! let mut archive = Archive::new(config);
//!
//! archive.import_file("/data/incoming/image.dcm")?;
//! archive.finish()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bulkdata;
pub mod config;
pub mod dataset;
pub mod extract;
pub mod hashing;
pub mod model;
pub mod processor;
pub mod store;
pub mod study;
pub mod tag_lists;
pub mod tags;
pub mod writer;

#[cfg(test)]
mod test_utils;

use crate::bulkdata::StudyBulkDataWriter;
use crate::config::Config;
use crate::dataset::RawDataSet;
use crate::extract::Extractor;
use crate::model::AttributeModel;
use crate::processor::{DeduplicateProcessor, Processor};
use crate::study::{RejectOutcome, StudyAggregate};
use dicom_core::Tag;
use dicom_object::DefaultDicomObject;
use log::{debug, info};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

static REJECT_PATH_REGEX: OnceLock<Regex> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Cannot import: no valid {0}")]
    CannotImport(&'static str),

    #[error("Invalid reject path: {0}")]
    InvalidRejectPath(String),

    #[error("Extraction error: {0}")]
    ExtractionError(#[from] extract::Error),

    #[error("Processing error: {0}")]
    ProcessingError(#[from] processor::Error),

    #[error("Study error: {0}")]
    StudyError(#[from] study::Error),

    #[error("Write error: {0}")]
    WriteError(#[from] writer::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] store::Error),
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// An extracted instance, ready to be ingested into its study.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedInstance {
    pub study_instance_uid: String,
    pub model: AttributeModel,
}

/// The ingestion pipeline of an archive.
///
/// Extraction only needs shared access and can run in parallel. Ingestion keeps the
/// aggregate of one study at a time: instances of a different study complete the current
/// one first, so input grouped by study is ingested with the fewest snapshot writes.
pub struct Archive<P: Processor = DeduplicateProcessor> {
    config: Config,
    extractor: Extractor,
    processor: P,
    current: Option<StudyAggregate>,
}

impl Archive<DeduplicateProcessor> {
    pub fn new(config: Config) -> Self {
        let processor = DeduplicateProcessor::new(config.clone());
        Self::with_processor(config, processor)
    }
}

impl<P: Processor> Archive<P> {
    pub fn with_processor(config: Config, processor: P) -> Self {
        Self {
            extractor: Extractor::from_config(&config),
            config,
            processor,
            current: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reads a DICOM file and extracts it, writing its bulk data and frames.
    pub fn extract_file(&self, path: impl AsRef<Path>) -> Result<ExtractedInstance> {
        let obj = dicom_object::open_file(path.as_ref())
            .map_err(|err| ArchiveError::ReadError(format!("{err}")))?;
        self.extract_object(&obj)
    }

    pub fn extract_object(&self, obj: &DefaultDicomObject) -> Result<ExtractedInstance> {
        self.extract_data_set(&RawDataSet::from_dicom_object(obj))
    }

    pub fn extract_data_set(&self, data_set: &RawDataSet) -> Result<ExtractedInstance> {
        let view = data_set.view();
        let identifier = |tag, name| {
            view.string(tag, 0)
                .filter(|uid| tags::is_valid_uid(uid))
                .ok_or(ArchiveError::CannotImport(name))
        };
        let study_instance_uid = identifier(tags::STUDY_INSTANCE_UID, "Study Instance UID")?;
        let series_instance_uid = identifier(tags::SERIES_INSTANCE_UID, "Series Instance UID")?;
        let sop_instance_uid = identifier(tags::SOP_INSTANCE_UID, "SOP Instance UID")?;
        let transfer_syntax = view.string(tags::TRANSFER_SYNTAX_UID, 0).unwrap_or_default();

        let study_dir = self.config.study_paths(&study_instance_uid).study_dir;
        let mut handler = StudyBulkDataWriter::new(
            &self.config,
            &study_dir,
            &series_instance_uid,
            &sop_instance_uid,
            &transfer_syntax,
        );
        let model = self
            .extractor
            .extract(view, &mut handler)
            .map_err(|err| match err {
                extract::Error::CannotImport => ArchiveError::CannotImport("Study Instance UID"),
                other => other.into(),
            })?;
        debug!("extracted instance {sop_instance_uid} of study {study_instance_uid}");
        Ok(ExtractedInstance {
            study_instance_uid,
            model,
        })
    }

    /// Adds an extracted instance to its study, returning whether the study changed.
    pub fn ingest(&mut self, instance: ExtractedInstance) -> Result<bool> {
        check_identifiers(&instance)?;
        let mut aggregate = self.take_study(&instance.study_instance_uid)?;
        let processed = self.processor.process(instance.model, &mut aggregate);
        self.current = Some(aggregate);
        Ok(processed?)
    }

    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let instance = self.extract_file(path)?;
        self.ingest(instance)
    }

    // Completes the current study first when it is a different one.
    fn take_study(&mut self, study_instance_uid: &str) -> Result<StudyAggregate> {
        match self.current.take() {
            Some(aggregate) if aggregate.study_instance_uid() == study_instance_uid => Ok(aggregate),
            previous => {
                if let Some(mut previous) = previous {
                    writer::complete_study(&self.config, &mut previous)?;
                }
                let mut aggregate = StudyAggregate::new(self.config.study_paths(study_instance_uid));
                aggregate.init()?;
                Ok(aggregate)
            }
        }
    }

    /// Completes the current study, if any.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut aggregate) = self.current.take() {
            writer::complete_study(&self.config, &mut aggregate)?;
        }
        Ok(())
    }

    /// Rejects the instance or series named by a path of the form
    /// `studies/<study>/series/<series>[/instances/<sop>]`.
    pub fn reject_path(&mut self, path: &str, reason: &str) -> Result<RejectOutcome> {
        let regex = REJECT_PATH_REGEX.get_or_init(|| {
            Regex::new(r"(?:^|/)studies/([^/]+)/series/([^/]+)(?:/instances/([^/]+))?/?$").unwrap()
        });
        let captures = regex
            .captures(path)
            .ok_or_else(|| ArchiveError::InvalidRejectPath(path.to_string()))?;
        let study_instance_uid = &captures[1];
        let series_instance_uid = &captures[2];
        let sop_instance_uid = captures.get(3).map(|sop| sop.as_str());
        if !tags::is_valid_uid(study_instance_uid)
            || !tags::is_valid_uid(series_instance_uid)
            || !sop_instance_uid.map_or(true, tags::is_valid_uid)
        {
            return Err(ArchiveError::InvalidRejectPath(path.to_string()));
        }

        self.finish()?;
        let mut aggregate = StudyAggregate::new(self.config.study_paths(study_instance_uid));
        aggregate.init()?;
        let outcome = aggregate.reject(series_instance_uid, sop_instance_uid, reason)?;
        if let RejectOutcome::Rejected(_) = outcome {
            writer::complete_study(&self.config, &mut aggregate)?;
        }
        Ok(outcome)
    }

    /// Removes a study from the archive.
    pub fn delete_study(&mut self, study_instance_uid: &str) -> Result<()> {
        if !tags::is_valid_uid(study_instance_uid) {
            return Err(ArchiveError::InvalidRejectPath(study_instance_uid.to_string()));
        }
        if self
            .current
            .as_ref()
            .is_some_and(|aggregate| aggregate.study_instance_uid() == study_instance_uid)
        {
            self.current = None;
        }
        let mut aggregate = StudyAggregate::new(self.config.study_paths(study_instance_uid));
        aggregate.delete()?;
        if writer::remove_from_catalogue(&self.config, study_instance_uid)? {
            info!("removed study {study_instance_uid} from the catalogue");
        }
        Ok(())
    }

    /// Rebuilds the studies catalogue, returning the number of studies.
    pub fn reindex(&self) -> Result<usize> {
        Ok(writer::reindex(&self.config)?)
    }
}

// Identifiers end up as directory names.
fn check_identifiers(instance: &ExtractedInstance) -> Result<()> {
    if !tags::is_valid_uid(&instance.study_instance_uid) {
        return Err(ArchiveError::CannotImport("Study Instance UID"));
    }
    let uid = |tag: Tag| instance.model.get_str(tag).filter(|uid| tags::is_valid_uid(uid));
    uid(tags::SERIES_INSTANCE_UID).ok_or(ArchiveError::CannotImport("Series Instance UID"))?;
    uid(tags::SOP_INSTANCE_UID).ok_or(ArchiveError::CannotImport("SOP Instance UID"))?;
    Ok(())
}

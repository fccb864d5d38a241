use crate::config::Config;
use crate::model::AttributeModel;
use crate::store::{self, JsonOptions};
use crate::study::{self, StudyAggregate};
use crate::tag_lists::{
    self, add_hash, extract, DedupKind, ExtractOptions, IMAGE_EXTRACT, PATIENT_QUERY, SERIES_EXTRACT,
    STUDY_QUERY,
};
use crate::tags;
use dicom_core::Tag;
use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    TagList(#[from] tag_lists::Error),

    #[error(transparent)]
    Study(#[from] study::Error),

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifying attributes kept in the instance record even though a fragment holds them too.
const RETAINED: &[Tag] = &[tags::SERIES_INSTANCE_UID, tags::SOP_INSTANCE_UID];

pub trait Processor {
    /// Adds one extracted instance to the aggregate of its study, returning whether the
    /// aggregate changed.
    fn process(&self, instance: AttributeModel, aggregate: &mut StudyAggregate) -> Result<bool>;
}

/// An instance split into its shared fragments and its own residual record.
#[derive(Debug, Clone, PartialEq)]
pub struct Deduplicated {
    /// Patient, study, series and image fragments, in reference order.
    pub fragments: Vec<AttributeModel>,
    /// What remains of the instance, referencing the fragments and stamped with its hash.
    pub record: AttributeModel,
}

/// Splits a full instance model into fragments and an instance record.
pub fn deduplicate(mut instance: AttributeModel) -> Result<Deduplicated> {
    let retained: Vec<_> = RETAINED
        .iter()
        .filter_map(|tag| instance.attribute(*tag).map(|attribute| (*tag, attribute.clone())))
        .collect();

    let fragments = vec![
        extract(&mut instance, DedupKind::Patient, PATIENT_QUERY.iter().copied(), ExtractOptions::REMOVE)?,
        extract(&mut instance, DedupKind::Study, STUDY_QUERY.iter().copied(), ExtractOptions::REMOVE)?,
        extract(&mut instance, DedupKind::Series, SERIES_EXTRACT.iter().copied(), ExtractOptions::REMOVE)?,
        extract(&mut instance, DedupKind::Image, IMAGE_EXTRACT.iter().copied(), ExtractOptions::REMOVE)?,
    ];

    for (tag, attribute) in retained {
        instance.insert(tag, attribute);
    }
    add_hash(&mut instance, DedupKind::Instance)?;

    Ok(Deduplicated {
        fragments,
        record: instance,
    })
}

/// The deduplicating ingestion step.
///
/// Fragments are stored once per study, then the instance record is added to the
/// aggregate. Depending on the [`Config`], a single instance snapshot and the full instance
/// metadata are written as well.
#[derive(Debug, Clone, PartialEq)]
pub struct DeduplicateProcessor {
    config: Config,
}

impl DeduplicateProcessor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn write_instance_metadata(&self, instance: &AttributeModel, aggregate: &StudyAggregate) -> Result<()> {
        let (Some(series), Some(sop)) = (
            instance.get_str(tags::SERIES_INSTANCE_UID),
            instance.get_str(tags::SOP_INSTANCE_UID),
        ) else {
            warn!("not writing instance metadata without Series and SOP Instance UIDs");
            return Ok(());
        };
        let dir = aggregate
            .paths()
            .study_dir
            .join("series")
            .join(series)
            .join("instances")
            .join(sop);
        store::write_json(&dir, "metadata", &[instance], JsonOptions::GZIP_FILE)?;
        Ok(())
    }
}

impl Processor for DeduplicateProcessor {
    fn process(&self, instance: AttributeModel, aggregate: &mut StudyAggregate) -> Result<bool> {
        if self.config.write_instance_metadata() {
            self.write_instance_metadata(&instance, aggregate)?;
        }

        let Deduplicated { fragments, record } = deduplicate(instance)?;
        let mut snapshot = Vec::with_capacity(fragments.len() + 1);
        for fragment in fragments {
            aggregate.write_fragment_once(fragment.clone())?;
            snapshot.push(fragment);
        }

        if self.config.write_instance_snapshots() {
            if let Some(hash) = tag_lists::hash_of(&record) {
                snapshot.push(record.clone());
                store::write_json(
                    &aggregate.paths().instances_dir,
                    &format!("{hash}.gz"),
                    &snapshot,
                    JsonOptions::GZIP_FILE,
                )?;
            }
        }

        let added = aggregate.add_deduplicated(record)?;
        if !added {
            debug!("instance unchanged in study {}", aggregate.study_instance_uid());
        }
        Ok(added)
    }
}

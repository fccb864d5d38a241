//! Named tag lists and the fragment extraction that deduplication is built on.

use crate::hashing::content_hash;
use crate::model::{self, AttributeModel};
use crate::tags::{self, DEDUPPED_HASH, DEDUPPED_REF, DEDUPPED_TYPE};
use dicom_core::Tag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] model::Error),

    #[error(transparent)]
    Hashing(#[from] crate::hashing::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Role of a hashed record inside a deduplicated snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DedupKind {
    Patient,
    Study,
    Series,
    Image,
    Instance,
    Info,
    Deleted,
}

impl DedupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupKind::Patient => "patient",
            DedupKind::Study => "study",
            DedupKind::Series => "series",
            DedupKind::Image => "image",
            DedupKind::Instance => "instance",
            DedupKind::Info => "info",
            DedupKind::Deleted => "deleted",
        }
    }

    /// Reads the kind stamped on a record.
    pub fn of(model: &AttributeModel) -> Option<Self> {
        model.get_str(DEDUPPED_TYPE).and_then(|kind| kind.parse().ok())
    }
}

impl fmt::Display for DedupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(DedupKind::Patient),
            "study" => Ok(DedupKind::Study),
            "series" => Ok(DedupKind::Series),
            "image" => Ok(DedupKind::Image),
            "instance" => Ok(DedupKind::Instance),
            "info" => Ok(DedupKind::Info),
            "deleted" => Ok(DedupKind::Deleted),
            other => Err(format!("unknown dedup kind: {other}")),
        }
    }
}

pub const PATIENT_QUERY: &[Tag] = &[
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
    tags::ISSUER_OF_PATIENT_ID,
    tags::PATIENT_IDENTITY_REMOVED,
    tags::DEIDENTIFICATION_METHOD_CODE_SEQUENCE,
];

pub const STUDY_QUERY: &[Tag] = &[
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_STATUS_ID,
    tags::STUDY_PRIORITY_ID,
    tags::STUDY_ID,
];

pub const SERIES_EXTRACT: &[Tag] = &[
    tags::SERIES_DESCRIPTION,
    tags::SERIES_NUMBER,
    tags::SERIES_INSTANCE_UID,
    tags::MODALITY,
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::SPECIFIC_CHARACTER_SET,
    tags::INSTITUTION_NAME,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::STATION_NAME,
    tags::OPERATORS_NAME,
    tags::MANUFACTURER_MODEL_NAME,
    tags::BODY_PART_EXAMINED,
    tags::PROTOCOL_NAME,
    tags::REQUESTED_PROCEDURE_DESCRIPTION,
];

pub const INSTANCE_QUERY: &[Tag] = &[
    tags::SOP_INSTANCE_UID,
    tags::INSTANCE_NUMBER,
    tags::SERIES_INSTANCE_UID,
    tags::STUDY_INSTANCE_UID,
    tags::CONTENT_DATE,
    tags::CONTENT_TIME,
    tags::ACQUISITION_DATE,
    tags::ACQUISITION_TIME,
    tags::ACQUISITION_NUMBER,
    tags::SAMPLES_PER_PIXEL,
    tags::PHOTOMETRIC_INTERPRETATION,
    tags::PLANAR_CONFIGURATION,
    tags::ROWS,
    tags::COLUMNS,
    tags::BITS_ALLOCATED,
    tags::BITS_STORED,
    tags::HIGH_BIT,
    tags::PIXEL_REPRESENTATION,
    tags::WINDOW_CENTER,
    tags::WINDOW_WIDTH,
    tags::WINDOW_CENTER_WIDTH_EXPLANATION,
    tags::INSTANCE_CREATION_TIME,
];

pub const IMAGE_EXTRACT: &[Tag] = &[
    tags::IMAGE_TYPE,
    tags::INSTANCE_CREATION_DATE,
    tags::SOP_CLASS_UID,
    tags::CONVERSION_TYPE,
    tags::MANUFACTURER_MODEL_NAME,
    tags::CONTENT_DATE,
    tags::ACQUISITION_DATE,
    tags::SECONDARY_CAPTURE_DEVICE_ID,
    tags::DATE_OF_SECONDARY_CAPTURE,
    tags::SECONDARY_CAPTURE_DEVICE_MANUFACTURER,
    tags::SECONDARY_CAPTURE_DEVICE_MANUFACTURER_MODEL_NAME,
    tags::SECONDARY_CAPTURE_DEVICE_SOFTWARE_VERSIONS,
    tags::SOFTWARE_VERSIONS,
    tags::SAMPLES_PER_PIXEL,
    tags::PHOTOMETRIC_INTERPRETATION,
    tags::PLANAR_CONFIGURATION,
    tags::ROWS,
    tags::COLUMNS,
    tags::BITS_ALLOCATED,
    tags::BITS_STORED,
    tags::HIGH_BIT,
    tags::PIXEL_REPRESENTATION,
    tags::WINDOW_CENTER,
    tags::WINDOW_WIDTH,
    tags::WINDOW_CENTER_WIDTH_EXPLANATION,
    tags::PATIENT_POSITION,
    tags::PATIENT_ORIENTATION,
];

/// Study query attributes including the patient level ones.
pub fn patient_study_query() -> impl Iterator<Item = Tag> {
    PATIENT_QUERY.iter().chain(STUDY_QUERY).copied()
}

/// Series query attributes: the series extract plus the owning study.
pub fn series_query() -> impl Iterator<Item = Tag> {
    std::iter::once(tags::STUDY_INSTANCE_UID).chain(SERIES_EXTRACT.iter().copied())
}

/// How [`extract`] treats the source model.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ExtractOptions {
    /// Delete the extracted attributes from the source.
    pub remove: bool,
    /// Append the fragment hash to the source's `DeduppedRef` list.
    pub add_back_ref: bool,
}

impl ExtractOptions {
    /// Copy only, as used for query views.
    pub const QUERY: ExtractOptions = ExtractOptions {
        remove: false,
        add_back_ref: false,
    };

    /// Move the attributes into the fragment and reference it from the source.
    pub const REMOVE: ExtractOptions = ExtractOptions {
        remove: true,
        add_back_ref: true,
    };
}

/// Pulls the attributes of `tag_list` out of `model` into a new, hashed fragment.
pub fn extract<I>(
    model: &mut AttributeModel,
    kind: DedupKind,
    tag_list: I,
    options: ExtractOptions,
) -> Result<AttributeModel>
where
    I: IntoIterator<Item = Tag>,
{
    let mut fragment = AttributeModel::new();
    for tag in tag_list {
        let attribute = if options.remove {
            model.take(tag)
        } else {
            model.attribute(tag).cloned()
        };
        if let Some(attribute) = attribute {
            fragment.insert(tag, attribute);
        }
    }

    let hash = add_hash(&mut fragment, kind)?;
    if options.add_back_ref {
        model.push(DEDUPPED_REF, hash)?;
    }
    Ok(fragment)
}

/// Stamps `model` with its content hash and kind, returning the hash.
///
/// A model that already carries a hash keeps it, so re-stamping is a no-op. The hash is
/// computed before any stamp is written.
pub fn add_hash(model: &mut AttributeModel, kind: DedupKind) -> Result<String> {
    if let Some(existing) = model.get_str(DEDUPPED_HASH) {
        return Ok(existing.to_string());
    }
    let hash = content_hash(model)?;
    model.set(DEDUPPED_HASH, [hash.as_str()])?;
    model.set(DEDUPPED_TYPE, [kind.as_str()])?;
    Ok(hash)
}

/// The stamped content hash of a record, if any.
pub fn hash_of(model: &AttributeModel) -> Option<&str> {
    model.get_str(DEDUPPED_HASH)
}

/// The fragment hashes a residual record depends on, in reference order.
pub fn back_refs(model: &AttributeModel) -> Vec<String> {
    model
        .get_list(DEDUPPED_REF)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Removes the deduplication block, its creator included, from a model.
pub fn strip_dedup_tags(model: &mut AttributeModel) {
    let Some(reference) = model.find_tag(DEDUPPED_REF) else {
        return;
    };
    let group = reference.group();
    let block = reference.element() & 0xFF00;
    for private in [DEDUPPED_REF, DEDUPPED_HASH, DEDUPPED_TYPE] {
        model.take(Tag(group, block | (private.tag.element() & 0x00FF)));
    }
    model.take(Tag(group, block >> 8));
}

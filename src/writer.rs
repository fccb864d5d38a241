//! Persisting study aggregates.
//!
//! The query views of a study are plain DICOM JSON lists:
//!
//! * `series/<series>/metadata.gz`: full metadata of every live instance of the series
//! * `series/<series>/series/index.json.gz`: the series query record
//! * `series/<series>/instances/index.json.gz`: the instance query records
//! * `series/index.json.gz`: the series query records of the study
//! * `index.json.gz`: the study query record
//!
//! The study query records of all studies are collected in `studies/index.json.gz`.

use crate::config::Config;
use crate::model::{self, AttributeModel};
use crate::store::{self, read_json, write_json, JsonOptions};
use crate::study::{self, StudyAggregate, STUDY_SNAPSHOT};
use crate::tag_lists::{self, extract, patient_study_query, series_query, DedupKind, ExtractOptions, INSTANCE_QUERY};
use crate::tags;
use dicom_core::Tag;
use log::{debug, info};
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

/// File name of the studies catalogue and of each study query view.
pub const INDEX_FILE: &str = "index.json.gz";

#[derive(Error, Debug)]
pub enum Error {
    #[error("study {0} has no Study Instance UID after recombination")]
    MissingStudyInstanceUid(String),

    #[error(transparent)]
    Store(#[from] store::Error),

    #[error(transparent)]
    Study(#[from] study::Error),

    #[error(transparent)]
    TagList(#[from] tag_lists::Error),

    #[error(transparent)]
    Model(#[from] model::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

struct SeriesViews {
    series_instance_uid: String,
    query: AttributeModel,
    metadata: Vec<AttributeModel>,
    instances: Vec<AttributeModel>,
}

/// Writes the group snapshot `<deduplicated>/<hash>.gz` of the aggregate.
pub fn persist_snapshot(aggregate: &mut StudyAggregate) -> Result<String> {
    let (hash, entries) = aggregate.snapshot()?;
    let name = format!("{hash}.gz");
    write_json(
        &aggregate.paths().deduplicated_dir,
        &name,
        &entries,
        JsonOptions::GZIP_FILE,
    )?;
    debug!("wrote snapshot {name} with {} entries", entries.len());
    aggregate.mark_persisted(&hash, name);
    Ok(hash)
}

/// Rewrites the series and study query views from the live instances of the aggregate.
///
/// Views of deleted instances and of series without live instances are removed. Returns the
/// study query record, or `None` when every instance is deleted, in which case the study views
/// are removed too and the study is dropped from the catalogue.
pub fn regenerate_query_views(config: &Config, aggregate: &mut StudyAggregate) -> Result<Option<AttributeModel>> {
    let study_dir = aggregate.paths().study_dir.clone();
    let study_instance_uid = aggregate.study_instance_uid().to_string();

    let mut study_query = None;
    let mut series: Vec<SeriesViews> = Vec::new();
    let mut deleted = Vec::new();
    for ordinal in 0..aggregate.number_of_instances() {
        if aggregate.is_deleted(ordinal) {
            if let Some(record) = aggregate.instance(ordinal) {
                let uid = |tag: Tag| record.get_str(tag).unwrap_or_default().to_string();
                deleted.push((uid(tags::SERIES_INSTANCE_UID), uid(tags::SOP_INSTANCE_UID)));
            }
            continue;
        }
        let mut full = aggregate.recombine(ordinal)?;
        if study_query.is_none() {
            let query = extract(&mut full, DedupKind::Study, patient_study_query(), ExtractOptions::QUERY)?;
            if query.get_str(tags::STUDY_INSTANCE_UID).is_none() {
                return Err(Error::MissingStudyInstanceUid(study_instance_uid));
            }
            study_query = Some(query);
        }

        let series_instance_uid = full
            .get_str(tags::SERIES_INSTANCE_UID)
            .unwrap_or_default()
            .to_string();
        let instance_query = extract(&mut full, DedupKind::Instance, INSTANCE_QUERY.iter().copied(), ExtractOptions::QUERY)?;
        let index = match series
            .iter()
            .position(|views| views.series_instance_uid == series_instance_uid)
        {
            Some(index) => index,
            None => {
                let query = extract(&mut full, DedupKind::Series, series_query(), ExtractOptions::QUERY)?;
                series.push(SeriesViews {
                    series_instance_uid,
                    query,
                    metadata: Vec::new(),
                    instances: Vec::new(),
                });
                series.len() - 1
            }
        };
        series[index].instances.push(instance_query);
        series[index].metadata.push(full);
    }

    remove_deleted_views(&study_dir, &deleted, &series)?;

    let Some(mut study_query) = study_query else {
        info!("study {study_instance_uid} has no live instances");
        store::remove_file(&study_dir.join(INDEX_FILE))?;
        store::remove_file(&study_dir.join("series").join(INDEX_FILE))?;
        save_study_snapshot(config, aggregate)?;
        remove_from_catalogue(config, &study_instance_uid)?;
        return Ok(None);
    };

    let mut modalities: Vec<String> = Vec::new();
    let mut series_queries = Vec::with_capacity(series.len());
    let mut number_of_instances = 0;
    for views in series {
        let mut query = views.query;
        query.set(tags::NUMBER_OF_SERIES_RELATED_INSTANCES, [views.instances.len()])?;
        if let Some(modality) = query.get_str(tags::MODALITY) {
            if !modalities.iter().any(|known| known == modality) {
                modalities.push(modality.to_string());
            }
        }

        let series_dir = study_dir.join("series").join(&views.series_instance_uid);
        write_json(&series_dir, "metadata", &views.metadata, JsonOptions::GZIP_FILE)?;
        write_json(&series_dir, "series", &[&query], JsonOptions::INDEX)?;
        write_json(&series_dir, "instances", &views.instances, JsonOptions::INDEX)?;
        number_of_instances += views.instances.len();
        series_queries.push(query);
    }
    write_json(&study_dir, "series", &series_queries, JsonOptions::INDEX)?;

    study_query.set(tags::MODALITIES_IN_STUDY, modalities.iter().map(String::as_str))?;
    study_query.set(tags::NUMBER_OF_STUDY_RELATED_INSTANCES, [number_of_instances])?;
    study_query.set(tags::NUMBER_OF_STUDY_RELATED_SERIES, [series_queries.len()])?;
    write_json(&study_dir, INDEX_FILE, &[&study_query], JsonOptions::GZIP_FILE)?;

    save_study_snapshot(config, aggregate)?;
    update_catalogue(config, &study_query)?;
    info!(
        "wrote query views of study {study_instance_uid}: {} series, {number_of_instances} instances",
        series_queries.len()
    );
    Ok(Some(study_query))
}

// Views of deleted instances, and of series left without live instances.
fn remove_deleted_views(study_dir: &Path, deleted: &[(String, String)], live: &[SeriesViews]) -> Result<()> {
    for (series_instance_uid, sop_instance_uid) in deleted {
        if !tags::is_valid_uid(series_instance_uid) {
            continue;
        }
        let series_dir = study_dir.join("series").join(series_instance_uid);
        if tags::is_valid_uid(sop_instance_uid) {
            store::remove_file(&series_dir.join("instances").join(sop_instance_uid).join("metadata.gz"))?;
        }
        if live
            .iter()
            .any(|views| &views.series_instance_uid == series_instance_uid)
        {
            continue;
        }
        store::remove_file(&series_dir.join("metadata.gz"))?;
        store::remove_file(&series_dir.join("series").join(INDEX_FILE))?;
        store::remove_file(&series_dir.join("instances").join(INDEX_FILE))?;
        debug!("removed query views of series {series_instance_uid}");
    }
    Ok(())
}

// The study snapshot records which group snapshot the query views were generated from.
fn save_study_snapshot(config: &Config, aggregate: &mut StudyAggregate) -> Result<()> {
    if config.write_group() && aggregate.dirty() {
        persist_snapshot(aggregate)?;
    }
    let info = aggregate.create_info()?;
    write_json(&aggregate.paths().study_dir, STUDY_SNAPSHOT, &[info], JsonOptions::GZIP_FILE)?;
    Ok(())
}

/// Finishes a study: saves the group snapshot and refreshes the query views when needed.
pub fn complete_study(config: &Config, aggregate: &mut StudyAggregate) -> Result<()> {
    if aggregate.number_of_instances() == 0 {
        debug!("nothing to complete for study {}", aggregate.study_instance_uid());
        return Ok(());
    }
    if config.write_group() && aggregate.dirty() {
        persist_snapshot(aggregate)?;
    }
    if config.write_study_metadata() && aggregate.dirty_metadata()? {
        regenerate_query_views(config, aggregate)?;
    }
    Ok(())
}

fn read_catalogue(config: &Config) -> Result<Vec<AttributeModel>> {
    Ok(read_json(&config.studies_dir(), INDEX_FILE)?.unwrap_or_default())
}

fn write_catalogue(config: &Config, studies: &[AttributeModel]) -> Result<()> {
    write_json(&config.studies_dir(), INDEX_FILE, studies, JsonOptions::GZIP_FILE)?;
    Ok(())
}

/// Replaces the catalogue entry of the study, or appends one.
pub fn update_catalogue(config: &Config, study_query: &AttributeModel) -> Result<()> {
    let study_instance_uid = study_query
        .get_str(tags::STUDY_INSTANCE_UID)
        .ok_or_else(|| Error::MissingStudyInstanceUid(String::new()))?;
    let mut studies = read_catalogue(config)?;
    let existing = studies
        .iter()
        .position(|study| study.get_str(tags::STUDY_INSTANCE_UID) == Some(study_instance_uid));
    match existing {
        Some(index) => studies[index] = study_query.clone(),
        None => studies.push(study_query.clone()),
    }
    write_catalogue(config, &studies)
}

/// Drops a study from the catalogue, returning whether it was listed.
pub fn remove_from_catalogue(config: &Config, study_instance_uid: &str) -> Result<bool> {
    let mut studies = read_catalogue(config)?;
    let before = studies.len();
    studies.retain(|study| study.get_str(tags::STUDY_INSTANCE_UID) != Some(study_instance_uid));
    if studies.len() == before {
        return Ok(false);
    }
    write_catalogue(config, &studies)?;
    Ok(true)
}

/// Rebuilds the catalogue from the study query views on disk, returning the study count.
pub fn reindex(config: &Config) -> Result<usize> {
    let mut studies = Vec::new();
    let study_dirs = WalkDir::new(config.studies_dir())
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir());
    for entry in study_dirs {
        let query: Option<Vec<AttributeModel>> = read_json(entry.path(), INDEX_FILE)?;
        match query.and_then(|query| query.into_iter().next()) {
            Some(study) => studies.push(study),
            None => debug!("no study query in {}", entry.path().display()),
        }
    }
    write_catalogue(config, &studies)?;
    info!("reindexed {} studies", studies.len());
    Ok(studies.len())
}

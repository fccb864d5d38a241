//! Deduplication state of one study.
//!
//! A [`StudyAggregate`] owns the instance records of a single study together with the
//! fragments they reference. Prior state is merged in by [`StudyAggregate::init`] from the
//! snapshot files of the deduplicated directories, newest first, so that a study can be
//! ingested over several runs.

use crate::config::StudyPaths;
use crate::hashing::{self, content_hash};
use crate::model::{self, AttributeModel};
use crate::store::{self, JsonOptions, ListedFile};
use crate::tag_lists::{self, add_hash, back_refs, hash_of, strip_dedup_tags, DedupKind};
use crate::tags::{self, DEDUPPED_HASH, DEDUPPED_REF, DEDUPPED_TYPE};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Study level snapshot written next to the query views.
pub const STUDY_SNAPSHOT: &str = "deduplicated.gz";

const FRAGMENT_EXTENSION: &str = ".json";

#[derive(Error, Debug)]
pub enum Error {
    #[error("instance {ordinal} out of range, the study has {count} instances")]
    OrdinalOutOfRange { ordinal: usize, count: usize },

    #[error(transparent)]
    Store(#[from] store::Error),

    #[error(transparent)]
    TagList(#[from] tag_lists::Error),

    #[error(transparent)]
    Model(#[from] model::Error),

    #[error(transparent)]
    Hashing(#[from] hashing::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a reject request matched.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectOutcome {
    /// Number of instance records now marked deleted.
    Rejected(usize),
    NoMatch,
}

#[derive(Debug)]
pub struct StudyAggregate {
    paths: StudyPaths,
    /// Instance records, indexed by ordinal.
    instances: Vec<AttributeModel>,
    sop_ordinals: HashMap<String, usize>,
    instance_hashes: HashSet<String>,
    /// Hashes already on disk, with the file they were seen in.
    known_hashes: BTreeMap<String, String>,
    fragments: BTreeMap<String, AttributeModel>,
    source_files: Vec<String>,
    new_instances_added: usize,
}

impl StudyAggregate {
    pub fn new(paths: StudyPaths) -> Self {
        Self {
            paths,
            instances: Vec::new(),
            sop_ordinals: HashMap::new(),
            instance_hashes: HashSet::new(),
            known_hashes: BTreeMap::new(),
            fragments: BTreeMap::new(),
            source_files: Vec::new(),
            new_instances_added: 0,
        }
    }

    pub fn paths(&self) -> &StudyPaths {
        &self.paths
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.paths.study_instance_uid
    }

    /// Resets the in-memory state, leaving the files alone.
    pub fn clear(&mut self) {
        self.instances.clear();
        self.sop_ordinals.clear();
        self.instance_hashes.clear();
        self.known_hashes.clear();
        self.fragments.clear();
        self.source_files.clear();
        self.new_instances_added = 0;
    }

    /// Loads the persisted group and instance snapshots of the study.
    pub fn init(&mut self) -> Result<()> {
        self.clear();
        let deduplicated_dir = self.paths.deduplicated_dir.clone();
        let instances_dir = self.paths.instances_dir.clone();
        self.read_deduplicated(&deduplicated_dir)?;
        self.read_deduplicated(&instances_dir)?;
        if !self.instances.is_empty() {
            info!(
                "loaded {} instances of study {} from {} files",
                self.instances.len(),
                self.paths.study_instance_uid,
                self.source_files.len()
            );
        }
        Ok(())
    }

    // Snapshots referenced by the info record of another snapshot are superseded by it.
    fn read_deduplicated(&mut self, dir: &Path) -> Result<()> {
        let mut loaded = Vec::new();
        for file in store::list_gz_files(dir)? {
            if self.is_known(&file.hash) {
                debug!("skipping {}, already merged", file.name);
                continue;
            }
            match store::read_json::<Vec<AttributeModel>>(dir, &file.name) {
                Ok(Some(entries)) => loaded.push((file, entries)),
                Ok(None) => {}
                Err(err @ store::Error::Json { .. }) => warn!("skipping unreadable snapshot: {err}"),
                Err(err) => return Err(err.into()),
            }
        }

        let superseded: HashSet<String> = loaded
            .iter()
            .flat_map(|(_, entries)| entries.iter())
            .filter(|entry| DedupKind::of(entry) == Some(DedupKind::Info))
            .flat_map(back_refs)
            .collect();
        for (file, entries) in loaded {
            if superseded.contains(&file.hash) {
                debug!("skipping {}, superseded", file.name);
                continue;
            }
            self.merge_snapshot(file, entries)?;
        }
        Ok(())
    }

    fn merge_snapshot(&mut self, file: ListedFile, entries: Vec<AttributeModel>) -> Result<()> {
        self.known_hashes.insert(file.hash, file.name.clone());
        self.source_files.push(file.name);

        for entry in entries {
            match DedupKind::of(&entry) {
                Some(DedupKind::Instance | DedupKind::Deleted) => {
                    self.internal_add_deduplicated(entry)?;
                }
                Some(DedupKind::Info) => {
                    for hash in back_refs(&entry) {
                        let name = format!("{hash}.gz");
                        self.known_hashes.entry(hash).or_insert(name);
                    }
                }
                _ => match hash_of(&entry).map(str::to_string) {
                    Some(hash) => {
                        match fragment_file_name(&hash) {
                            Ok(name) => {
                                self.known_hashes.entry(hash.clone()).or_insert(name);
                            }
                            Err(err) => warn!("fragment {hash} has no stored location: {err}"),
                        }
                        self.fragments.entry(hash).or_insert(entry);
                    }
                    None => warn!("ignoring snapshot entry without hash"),
                },
            }
        }
        Ok(())
    }

    /// Adds a newly ingested instance record, see [`Self::internal_add_deduplicated`].
    pub fn add_deduplicated(&mut self, record: AttributeModel) -> Result<bool> {
        let added = self.internal_add_deduplicated(record)?;
        if added {
            self.new_instances_added += 1;
        }
        Ok(added)
    }

    /// Inserts an instance record, returning whether anything changed.
    ///
    /// Records whose hash was already seen are ignored. A record for a known SOP Instance
    /// UID replaces the previous one at the same ordinal.
    pub fn internal_add_deduplicated(&mut self, mut record: AttributeModel) -> Result<bool> {
        let hash = add_hash(&mut record, DedupKind::Instance)?;
        if self.instance_hashes.contains(&hash) {
            debug!("instance {hash} already present");
            return Ok(false);
        }
        let Some(sop_instance_uid) = record.get_str(tags::SOP_INSTANCE_UID).map(str::to_string) else {
            warn!("instance {hash} has no SOP Instance UID, skipped");
            return Ok(false);
        };

        self.known_hashes.insert(hash.clone(), format!("{hash}.gz"));
        self.instance_hashes.insert(hash);
        match self.sop_ordinals.get(&sop_instance_uid) {
            Some(&ordinal) => {
                debug!("replacing instance {sop_instance_uid} at {ordinal}");
                self.instances[ordinal] = record;
            }
            None => {
                self.sop_ordinals.insert(sop_instance_uid, self.instances.len());
                self.instances.push(record);
            }
        }
        Ok(true)
    }

    pub fn sop_exists(&self, sop_instance_uid: &str) -> bool {
        self.sop_ordinals.contains_key(sop_instance_uid)
    }

    pub fn number_of_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn ordinal_of(&self, sop_instance_uid: &str) -> Option<usize> {
        self.sop_ordinals.get(sop_instance_uid).copied()
    }

    /// The stored record of an ordinal, before recombination.
    pub fn instance(&self, ordinal: usize) -> Option<&AttributeModel> {
        self.instances.get(ordinal)
    }

    pub fn is_deleted(&self, ordinal: usize) -> bool {
        self.instances
            .get(ordinal)
            .is_some_and(|record| DedupKind::of(record) == Some(DedupKind::Deleted))
    }

    pub fn is_known(&self, hash: &str) -> bool {
        self.known_hashes.contains_key(hash)
    }

    /// Rebuilds the full attribute model of an instance from its record and fragments.
    ///
    /// Attributes of the record win over fragment attributes, and earlier fragments over
    /// later ones. The bookkeeping block is not part of the result.
    pub fn recombine(&mut self, ordinal: usize) -> Result<AttributeModel> {
        let mut combined = self
            .instances
            .get(ordinal)
            .cloned()
            .ok_or(Error::OrdinalOutOfRange {
                ordinal,
                count: self.instances.len(),
            })?;
        let refs = back_refs(&combined);
        strip_dedup_tags(&mut combined);

        for hash in refs {
            let Some(fragment) = self.get_or_load_extract(&hash)? else {
                continue;
            };
            let mut fragment = fragment.clone();
            strip_dedup_tags(&mut fragment);
            for (tag, attribute) in fragment {
                if !combined.contains(tag) {
                    combined.insert(tag, attribute);
                }
            }
        }
        Ok(combined)
    }

    /// A fragment by hash, from the cache or else from the study's bulk data.
    pub fn get_or_load_extract(&mut self, hash: &str) -> Result<Option<&AttributeModel>> {
        if !self.fragments.contains_key(hash) {
            let loaded = store::read_hash_data::<AttributeModel>(
                &self.paths.study_dir,
                hash,
                &format!("{FRAGMENT_EXTENSION}.gz"),
            )?;
            match loaded {
                Some(fragment) => {
                    self.fragments.insert(hash.to_string(), fragment);
                }
                None => {
                    warn!("fragment {hash} of study {} not found", self.paths.study_instance_uid);
                    return Ok(None);
                }
            }
        }
        Ok(self.fragments.get(hash))
    }

    /// Stores a fragment unless its hash is already on disk, returning the hash.
    pub fn write_fragment_once(&mut self, mut fragment: AttributeModel) -> Result<String> {
        let kind = DedupKind::of(&fragment).unwrap_or(DedupKind::Image);
        let hash = add_hash(&mut fragment, kind)?;
        if !self.is_known(&hash) {
            let location = store::hash_path(&hash, FRAGMENT_EXTENSION)?;
            let name = format!("{}.gz", location.uri());
            store::write_json(
                &location.dir_in(&self.paths.study_dir),
                &location.file_name,
                &fragment,
                JsonOptions::GZIP_FILE,
            )?;
            debug!("stored {kind} fragment {hash}");
            self.known_hashes.insert(hash.clone(), name);
        }
        self.fragments.entry(hash.clone()).or_insert(fragment);
        Ok(hash)
    }

    /// Marks the matching instances as deleted, keeping their content.
    ///
    /// Without a SOP Instance UID every instance of the series is rejected.
    pub fn reject(
        &mut self,
        series_instance_uid: &str,
        sop_instance_uid: Option<&str>,
        reason: &str,
    ) -> Result<RejectOutcome> {
        let mut rejected = 0;
        for ordinal in 0..self.instances.len() {
            let combined = self.recombine(ordinal)?;
            if combined.get_str(tags::SERIES_INSTANCE_UID) != Some(series_instance_uid) {
                continue;
            }
            if sop_instance_uid.is_some_and(|sop| combined.get_str(tags::SOP_INSTANCE_UID) != Some(sop)) {
                continue;
            }
            let record = &mut self.instances[ordinal];
            if DedupKind::of(record) != Some(DedupKind::Deleted) {
                record.set(DEDUPPED_TYPE, [DedupKind::Deleted.as_str()])?;
                self.new_instances_added += 1;
            }
            rejected += 1;
        }

        if rejected == 0 {
            warn!(
                "nothing to reject for series {series_instance_uid} instance {}",
                sop_instance_uid.unwrap_or("*")
            );
            return Ok(RejectOutcome::NoMatch);
        }
        info!("rejected {rejected} instances of series {series_instance_uid}: {reason}");
        Ok(RejectOutcome::Rejected(rejected))
    }

    /// True when there are unsaved instances, or the state was merged from several files.
    pub fn dirty(&self) -> bool {
        self.new_instances_added > 0 || self.source_files.len() > 1
    }

    /// True when the query views may be out of date.
    pub fn dirty_metadata(&self) -> Result<bool> {
        if self.dirty() {
            return Ok(true);
        }
        let entries =
            match store::read_json::<Vec<AttributeModel>>(&self.paths.study_dir, STUDY_SNAPSHOT) {
                Ok(Some(entries)) => entries,
                Ok(None) | Err(store::Error::Json { .. }) => return Ok(true),
                Err(err) => return Err(err.into()),
            };
        let info_hash = entries
            .first()
            .filter(|entry| DedupKind::of(entry) == Some(DedupKind::Info))
            .and_then(hash_of);
        let Some(info_hash) = info_hash else {
            return Ok(true);
        };
        Ok(!self
            .source_files
            .first()
            .is_some_and(|name| name.contains(info_hash)))
    }

    /// The info record describing the current instance list.
    ///
    /// It references every known hash that is not one of the instances, so a later load can
    /// skip the files those hashes name.
    pub fn create_info(&self) -> Result<AttributeModel> {
        let hash = content_hash(&self.instances)?;
        let refs: Vec<&str> = self
            .known_hashes
            .keys()
            .filter(|known| **known != hash && !self.instance_hashes.contains(*known))
            .map(String::as_str)
            .collect();

        let mut info = AttributeModel::new();
        info.set(DEDUPPED_REF, refs)?;
        info.set(DEDUPPED_HASH, [hash.as_str()])?;
        info.set(DEDUPPED_TYPE, [DedupKind::Info.as_str()])?;
        Ok(info)
    }

    /// The content of a group snapshot: the info record, the fragments, then the instances.
    pub fn snapshot(&self) -> Result<(String, Vec<AttributeModel>)> {
        let info = self.create_info()?;
        let hash = hash_of(&info).unwrap_or_default().to_string();
        let mut entries = Vec::with_capacity(1 + self.fragments.len() + self.instances.len());
        entries.push(info);
        entries.extend(self.fragments.values().cloned());
        entries.extend(self.instances.iter().cloned());
        Ok((hash, entries))
    }

    /// Records that the current state was written as `file_name`.
    pub fn mark_persisted(&mut self, hash: &str, file_name: String) {
        self.known_hashes.insert(hash.to_string(), file_name.clone());
        self.source_files = vec![file_name];
        self.new_instances_added = 0;
    }

    /// Removes every directory of the study and forgets its state.
    pub fn delete(&mut self) -> Result<()> {
        store::remove_dir_all(&self.paths.study_dir)?;
        store::remove_dir_all(&self.paths.deduplicated_dir)?;
        store::remove_dir_all(&self.paths.instances_dir)?;
        info!("deleted study {}", self.paths.study_instance_uid);
        self.clear();
        Ok(())
    }
}

fn fragment_file_name(hash: &str) -> Result<String> {
    Ok(format!("{}.gz", store::hash_path(hash, FRAGMENT_EXTENSION)?.uri()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ConfigBuilder;
    use crate::model::{Attribute, Scalar};
    use crate::processor::{deduplicate, Deduplicated};
    use crate::test_utils::{ingest_instance, make_instance, model_of, raw_instance};
    use crate::writer::persist_snapshot;
    use dicom_core::VR;
    use std::fs;
    use tempfile::{tempdir, TempDir};
    use walkdir::WalkDir;

    const STUDY: &str = "1.2.3";
    const SERIES: &str = "1.2.3.1";

    fn aggregate(root: &TempDir) -> StudyAggregate {
        let config = ConfigBuilder::new().root_dir(root.path()).build().unwrap();
        StudyAggregate::new(config.study_paths(STUDY))
    }

    fn fragment_files(aggregate: &StudyAggregate) -> usize {
        WalkDir::new(aggregate.paths().study_dir.join(store::BULKDATA_DIR))
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count()
    }

    #[test]
    fn test_same_instance_stored_once() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);

        assert!(ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1")));
        let files = fragment_files(&study);
        assert!(!ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1")));

        assert_eq!(study.number_of_instances(), 1);
        assert_eq!(fragment_files(&study), files);
        // patient, study, series and image fragments
        assert_eq!(files, 4);
    }

    #[test]
    fn test_shared_fragments() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);

        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.2"));

        assert_eq!(study.number_of_instances(), 2);
        assert_eq!(fragment_files(&study), 4);
        assert!(study.sop_exists("1.2.3.1.2"));
        assert!(!study.sop_exists("1.2.3.1.3"));
    }

    #[test]
    fn test_same_sop_replaces_in_place() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);

        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.2"));
        let changed = model_of(
            raw_instance(STUDY, SERIES, "1.2.3.1.1").element(tags::INSTANCE_NUMBER, Some(VR::IS), b"7 "),
        );
        assert!(ingest_instance(&mut study, changed));

        assert_eq!(study.number_of_instances(), 2);
        assert_eq!(study.ordinal_of("1.2.3.1.1"), Some(0));
        let combined = study.recombine(0).unwrap();
        assert_eq!(combined.get_scalar(tags::INSTANCE_NUMBER), Some(&Scalar::Int(7)));
    }

    #[test]
    fn test_recombine_round_trip() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        let original = make_instance(STUDY, SERIES, "1.2.3.1.1");

        ingest_instance(&mut study, original.clone());

        assert_eq!(study.recombine(0).unwrap(), original);
    }

    #[test]
    fn test_recombine_prefers_record() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));

        let refs = back_refs(study.instance(0).unwrap());
        let mut record = study.instance(0).unwrap().clone();
        strip_dedup_tags(&mut record);
        record.insert(tags::MODALITY, Attribute::values(VR::CS, ["MR"]));
        record.set(DEDUPPED_REF, refs.iter().map(String::as_str)).unwrap();
        assert!(study.add_deduplicated(record).unwrap());
        assert_eq!(study.number_of_instances(), 1);

        let combined = study.recombine(0).unwrap();
        assert_eq!(combined.get_str(tags::MODALITY), Some("MR"));
        assert_eq!(combined.get_str(tags::PATIENT_ID), Some("PID-1"));
    }

    #[test]
    fn test_recombine_out_of_range() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        assert!(matches!(
            study.recombine(3),
            Err(Error::OrdinalOutOfRange { ordinal: 3, count: 0 })
        ));
    }

    #[test]
    fn test_missing_fragment_loads_nothing() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        let hash = "0".repeat(64);
        assert!(study.get_or_load_extract(&hash).unwrap().is_none());
    }

    #[test]
    fn test_fragment_loaded_from_disk() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        let refs = back_refs(study.instance(0).unwrap());

        let mut fresh = aggregate(&root);
        let fragment = fresh.get_or_load_extract(&refs[0]).unwrap().unwrap();
        assert_eq!(hash_of(fragment), Some(refs[0].as_str()));
    }

    #[test]
    fn test_missing_sop_instance_uid_is_skipped() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        let mut record = AttributeModel::new();
        record.insert(tags::MODALITY, Attribute::values(VR::CS, ["CT"]));

        assert!(!study.add_deduplicated(record).unwrap());
        assert_eq!(study.number_of_instances(), 0);
        assert!(!study.dirty());
    }

    #[test]
    fn test_reject() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.2"));

        let outcome = study.reject(SERIES, Some("1.2.3.1.2"), "test").unwrap();
        assert_eq!(outcome, RejectOutcome::Rejected(1));
        assert!(!study.is_deleted(0));
        assert!(study.is_deleted(1));
        // content is kept
        assert_eq!(study.recombine(1).unwrap().get_str(tags::PATIENT_ID), Some("PID-1"));

        assert_eq!(study.reject(SERIES, Some("9.9"), "test").unwrap(), RejectOutcome::NoMatch);
        assert_eq!(study.reject("9.9", None, "test").unwrap(), RejectOutcome::NoMatch);
        assert_eq!(study.reject(SERIES, None, "test").unwrap(), RejectOutcome::Rejected(2));
    }

    #[test]
    fn test_dirty_tracking() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        assert!(!study.dirty());

        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        assert!(study.dirty());
        assert!(study.dirty_metadata().unwrap());

        persist_snapshot(&mut study).unwrap();
        assert!(!study.dirty());
        // no study snapshot yet
        assert!(study.dirty_metadata().unwrap());
    }

    #[test]
    fn test_init_reloads_snapshot() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.2"));
        study.reject(SERIES, Some("1.2.3.1.2"), "test").unwrap();
        persist_snapshot(&mut study).unwrap();

        let mut reloaded = aggregate(&root);
        reloaded.init().unwrap();

        assert_eq!(reloaded.number_of_instances(), 2);
        assert!(!reloaded.dirty());
        assert!(reloaded.is_deleted(1));
        assert_eq!(reloaded.recombine(0).unwrap(), make_instance(STUDY, SERIES, "1.2.3.1.1"));
        assert!(!ingest_instance(&mut reloaded, make_instance(STUDY, SERIES, "1.2.3.1.1")));
    }

    #[test]
    fn test_init_skips_superseded_snapshots() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        persist_snapshot(&mut study).unwrap();
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.2"));
        persist_snapshot(&mut study).unwrap();

        let snapshots = fs::read_dir(&study.paths().deduplicated_dir).unwrap().count();
        assert_eq!(snapshots, 2);

        let mut reloaded = aggregate(&root);
        reloaded.init().unwrap();
        assert_eq!(reloaded.number_of_instances(), 2);
        assert!(!reloaded.dirty());
    }

    #[test]
    fn test_reloaded_fragments_are_not_rewritten() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        persist_snapshot(&mut study).unwrap();
        let refs = back_refs(study.instance(0).unwrap());

        let mut reloaded = aggregate(&root);
        reloaded.init().unwrap();
        assert!(refs.iter().all(|hash| reloaded.is_known(hash)));

        store::remove_dir_all(&reloaded.paths().study_dir.join(store::BULKDATA_DIR)).unwrap();
        let Deduplicated { fragments, .. } =
            deduplicate(make_instance(STUDY, SERIES, "1.2.3.1.1")).unwrap();
        for fragment in fragments {
            let hash = reloaded.write_fragment_once(fragment).unwrap();
            assert!(refs.contains(&hash));
        }
        assert_eq!(fragment_files(&reloaded), 0);
    }

    #[test]
    fn test_snapshot_never_supersedes_itself() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        persist_snapshot(&mut study).unwrap();

        // the same study ingested elsewhere, with one more instance
        let other_root = tempdir().unwrap();
        let mut other = aggregate(&other_root);
        ingest_instance(&mut other, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        ingest_instance(&mut other, make_instance(STUDY, SERIES, "1.2.3.1.2"));
        let other_hash = persist_snapshot(&mut other).unwrap();
        let name = format!("{other_hash}.gz");
        fs::copy(
            other.paths().deduplicated_dir.join(&name),
            study.paths().deduplicated_dir.join(&name),
        )
        .unwrap();

        let mut merged = aggregate(&root);
        merged.init().unwrap();
        assert_eq!(merged.number_of_instances(), 2);
        assert!(merged.dirty());
        let info = merged.create_info().unwrap();
        assert_eq!(hash_of(&info), Some(other_hash.as_str()));
        assert!(!back_refs(&info).contains(&other_hash));

        assert_eq!(persist_snapshot(&mut merged).unwrap(), other_hash);
        let mut reloaded = aggregate(&root);
        reloaded.init().unwrap();
        assert_eq!(reloaded.number_of_instances(), 2);
        assert!(!reloaded.dirty());
    }

    #[test]
    fn test_create_info() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));

        let info = study.create_info().unwrap();
        assert_eq!(DedupKind::of(&info), Some(DedupKind::Info));
        // the four fragments, not the instance
        assert_eq!(back_refs(&info).len(), 4);
        let instance_hash = hash_of(study.instance(0).unwrap()).unwrap();
        assert!(!back_refs(&info).iter().any(|hash| hash == instance_hash));
    }

    #[test]
    fn test_delete() {
        let root = tempdir().unwrap();
        let mut study = aggregate(&root);
        ingest_instance(&mut study, make_instance(STUDY, SERIES, "1.2.3.1.1"));
        persist_snapshot(&mut study).unwrap();

        study.delete().unwrap();

        assert_eq!(study.number_of_instances(), 0);
        assert!(!study.paths().study_dir.exists());
        assert!(!study.paths().deduplicated_dir.exists());
        // deleting twice is fine
        study.delete().unwrap();
    }
}

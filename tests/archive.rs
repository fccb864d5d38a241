use dicom_core::value::PixelFragmentSequence;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dedup::config::{Config, ConfigBuilder};
use dicom_dedup::dataset::RawDataSetBuilder;
use dicom_dedup::model::{AttributeModel, AttributeValue, Scalar};
use dicom_dedup::store::{read_json, BULKDATA_DIR};
use dicom_dedup::study::{RejectOutcome, StudyAggregate};
use dicom_dedup::tag_lists::DedupKind;
use dicom_dedup::writer::INDEX_FILE;
use dicom_dedup::{tags, Archive, ArchiveError, ExtractedInstance};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};
use walkdir::WalkDir;

const STUDY: &str = "1.2.826.0.1.3680043.2.1125.1";
const SERIES: &str = "1.2.826.0.1.3680043.2.1125.1.1";

fn config(root: &TempDir) -> Config {
    ConfigBuilder::new().root_dir(root.path()).build().unwrap()
}

fn instance(study: &str, series: &str, sop: &str) -> RawDataSetBuilder {
    RawDataSetBuilder::new()
        .element(tags::TRANSFER_SYNTAX_UID, Some(VR::UI), b"1.2.840.10008.1.2.1")
        .element(tags::SOP_CLASS_UID, Some(VR::UI), b"1.2.840.10008.5.1.4.1.1.2")
        .element(tags::SOP_INSTANCE_UID, Some(VR::UI), sop.as_bytes())
        .element(tags::MODALITY, Some(VR::CS), b"CT")
        .element(tags::STUDY_DESCRIPTION, Some(VR::LO), b"CT")
        .element(tags::SERIES_DESCRIPTION, Some(VR::LO), b"Axial ")
        .element(tags::PATIENT_NAME, Some(VR::PN), b"Doe")
        .element(tags::PATIENT_ID, Some(VR::LO), b"PID-7")
        .element(tags::STUDY_INSTANCE_UID, Some(VR::UI), study.as_bytes())
        .element(tags::SERIES_INSTANCE_UID, Some(VR::UI), series.as_bytes())
        .element(tags::SAMPLES_PER_PIXEL, Some(VR::US), &1_u16.to_le_bytes())
        .element(tags::ROWS, Some(VR::US), &2_u16.to_le_bytes())
        .element(tags::COLUMNS, Some(VR::US), &2_u16.to_le_bytes())
        .element(tags::BITS_ALLOCATED, Some(VR::US), &8_u16.to_le_bytes())
}

fn ingest(archive: &mut Archive, builder: RawDataSetBuilder) -> (ExtractedInstance, bool) {
    let extracted = archive.extract_data_set(&builder.build()).unwrap();
    let added = archive.ingest(extracted.clone()).unwrap();
    (extracted, added)
}

fn read_list(dir: &Path, name: &str) -> Vec<AttributeModel> {
    read_json(dir, name).unwrap().unwrap()
}

fn reload(config: &Config, study: &str) -> StudyAggregate {
    let mut aggregate = StudyAggregate::new(config.study_paths(study));
    aggregate.init().unwrap();
    aggregate
}

fn stored_fragment_kinds(config: &Config, study: &str) -> HashMap<DedupKind, usize> {
    let bulkdata = config.study_paths(study).study_dir.join(BULKDATA_DIR);
    let mut kinds = HashMap::new();
    for entry in WalkDir::new(bulkdata).into_iter().filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type().is_file() || !name.ends_with(".json.gz") {
            continue;
        }
        let parent = entry.path().parent().unwrap();
        let fragment: AttributeModel = read_json(parent, &name).unwrap().unwrap();
        *kinds.entry(DedupKind::of(&fragment).unwrap()).or_insert(0) += 1;
    }
    kinds
}

#[test]
fn test_shared_fragments_stored_once() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.2"));
    archive.finish().unwrap();

    let kinds = stored_fragment_kinds(&config, STUDY);
    assert_eq!(kinds.get(&DedupKind::Patient), Some(&1));
    assert_eq!(kinds.get(&DedupKind::Study), Some(&1));
    assert_eq!(kinds.get(&DedupKind::Series), Some(&1));
    assert_eq!(kinds.get(&DedupKind::Image), Some(&1));

    let aggregate = reload(&config, STUDY);
    assert_eq!(aggregate.number_of_instances(), 2);

    let series_dir = config.study_paths(STUDY).study_dir.join("series");
    let series = read_list(&series_dir, INDEX_FILE);
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].get_str(tags::SERIES_DESCRIPTION), Some("Axial"));
    assert_eq!(
        series[0].get_scalar(tags::NUMBER_OF_SERIES_RELATED_INSTANCES),
        Some(&Scalar::from(2_usize))
    );
}

#[test]
fn test_same_instance_ingested_twice() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    let (_, first) = ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    let (_, second) = ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    assert!(first);
    assert!(!second);
    archive.finish().unwrap();

    assert_eq!(reload(&config, STUDY).number_of_instances(), 1);
    let snapshots = fs::read_dir(config.study_paths(STUDY).deduplicated_dir).unwrap().count();
    assert_eq!(snapshots, 1);
}

#[test]
fn test_changed_instance_replaces_in_place() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.2"));
    let changed = instance(STUDY, SERIES, "1.2.3.1").element(tags::INSTANCE_NUMBER, Some(VR::IS), b"7 ");
    let (_, replaced) = ingest(&mut archive, changed);
    assert!(replaced);
    archive.finish().unwrap();

    let mut aggregate = reload(&config, STUDY);
    assert_eq!(aggregate.number_of_instances(), 2);
    assert_eq!(aggregate.ordinal_of("1.2.3.1"), Some(0));
    let combined = aggregate.recombine(0).unwrap();
    assert_eq!(combined.get_scalar(tags::INSTANCE_NUMBER), Some(&Scalar::Int(7)));
}

#[test]
fn test_recombination_after_reload() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    let pixels = instance(STUDY, SERIES, "1.2.3.1").element(tags::PIXEL_DATA, Some(VR::OB), &[1, 2, 3, 4]);
    let (extracted, _) = ingest(&mut archive, pixels);
    archive.finish().unwrap();

    let mut aggregate = reload(&config, STUDY);
    let combined = aggregate.recombine(0).unwrap();
    assert_eq!(combined, extracted.model);

    let pixel_data = combined.attribute(tags::PIXEL_DATA).unwrap();
    let uri = format!("series/{SERIES}/instances/1.2.3.1/frames");
    assert_eq!(pixel_data.value, AttributeValue::BulkDataUri(uri.clone()));
    let frame = config.study_paths(STUDY).study_dir.join(uri).join("1.gz");
    assert!(frame.is_file());
}

#[test]
fn test_rejected_instance_kept_but_hidden() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.2"));
    archive.finish().unwrap();

    let path = format!("studies/{STUDY}/series/{SERIES}/instances/1.2.3.2");
    assert_eq!(archive.reject_path(&path, "duplicate").unwrap(), RejectOutcome::Rejected(1));

    let study_dir = config.study_paths(STUDY).study_dir;
    let instances = read_list(&study_dir.join("series").join(SERIES).join("instances"), INDEX_FILE);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].get_str(tags::SOP_INSTANCE_UID), Some("1.2.3.1"));

    let mut aggregate = reload(&config, STUDY);
    let ordinal = aggregate.ordinal_of("1.2.3.2").unwrap();
    assert!(aggregate.is_deleted(ordinal));
    let combined = aggregate.recombine(ordinal).unwrap();
    assert_eq!(combined.get_str(tags::STUDY_DESCRIPTION), Some("CT"));
}

#[test]
fn test_reject_whole_series_removes_study_from_catalogue() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.2"));
    archive.finish().unwrap();

    let path = format!("studies/{STUDY}/series/{SERIES}");
    assert_eq!(archive.reject_path(&path, "wrong patient").unwrap(), RejectOutcome::Rejected(2));
    assert!(read_list(&config.studies_dir(), INDEX_FILE).is_empty());
    assert_eq!(archive.reject_path(&path, "again").unwrap(), RejectOutcome::Rejected(2));

    let study_dir = config.study_paths(STUDY).study_dir;
    assert!(!study_dir.join(INDEX_FILE).exists());
    assert!(!study_dir.join("series").join(SERIES).join("metadata.gz").exists());
    assert_eq!(archive.reindex().unwrap(), 0);
}

#[test]
fn test_rejected_series_leaves_other_series_visible() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());
    let other_series = "1.2.826.0.1.3680043.2.1125.1.2";

    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    ingest(&mut archive, instance(STUDY, other_series, "1.2.3.2"));
    archive.finish().unwrap();

    let path = format!("studies/{STUDY}/series/{other_series}");
    assert_eq!(archive.reject_path(&path, "wrong series").unwrap(), RejectOutcome::Rejected(1));

    let study_dir = config.study_paths(STUDY).study_dir;
    let series = read_list(&study_dir.join("series"), INDEX_FILE);
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].get_str(tags::SERIES_INSTANCE_UID), Some(SERIES));

    let rejected_dir = study_dir.join("series").join(other_series);
    assert!(!rejected_dir.join("metadata.gz").exists());
    assert!(!rejected_dir.join("series").join(INDEX_FILE).exists());
    assert!(!rejected_dir.join("instances").join(INDEX_FILE).exists());
    assert_eq!(read_list(&config.studies_dir(), INDEX_FILE).len(), 1);
}

#[test]
fn test_import_resumes_across_runs() {
    let root = tempdir().unwrap();
    let config = config(&root);

    let mut archive = Archive::new(config.clone());
    ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    archive.finish().unwrap();

    let mut archive = Archive::new(config.clone());
    let (_, known) = ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    assert!(!known);
    let (_, added) = ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.2"));
    assert!(added);
    archive.finish().unwrap();

    let aggregate = reload(&config, STUDY);
    assert_eq!(aggregate.number_of_instances(), 2);
    assert!(!aggregate.dirty());
    let study = &read_list(&config.studies_dir(), INDEX_FILE)[0];
    assert_eq!(
        study.get_scalar(tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
        Some(&Scalar::from(2_usize))
    );
}

#[test]
fn test_catalogue_and_reindex() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());

    ingest(&mut archive, instance("1.2.3", "1.2.3.1", "1.2.3.1.1"));
    ingest(&mut archive, instance("1.2.4", "1.2.4.1", "1.2.4.1.1"));
    archive.finish().unwrap();

    let studies = read_list(&config.studies_dir(), INDEX_FILE);
    let uids: Vec<_> = studies.iter().filter_map(|s| s.get_str(tags::STUDY_INSTANCE_UID)).collect();
    assert_eq!(uids, vec!["1.2.3", "1.2.4"]);
    assert_eq!(studies[0].get_str(tags::PATIENT_ID), Some("PID-7"));

    fs::remove_file(config.studies_dir().join(INDEX_FILE)).unwrap();
    assert_eq!(archive.reindex().unwrap(), 2);
    assert_eq!(read_list(&config.studies_dir(), INDEX_FILE), studies);

    archive.delete_study("1.2.3").unwrap();
    let remaining = read_list(&config.studies_dir(), INDEX_FILE);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get_str(tags::STUDY_INSTANCE_UID), Some("1.2.4"));
}

#[test]
fn test_instance_snapshots_and_metadata() {
    let root = tempdir().unwrap();
    let config = ConfigBuilder::new()
        .root_dir(root.path())
        .write_instance_snapshots(true)
        .write_instance_metadata(true)
        .build()
        .unwrap();
    let mut archive = Archive::new(config.clone());
    let (extracted, _) = ingest(&mut archive, instance(STUDY, SERIES, "1.2.3.1"));
    archive.finish().unwrap();

    let paths = config.study_paths(STUDY);
    let snapshots: Vec<_> = fs::read_dir(&paths.instances_dir).unwrap().collect();
    assert_eq!(snapshots.len(), 1);

    let metadata_dir = paths.study_dir.join("series").join(SERIES).join("instances").join("1.2.3.1");
    assert_eq!(read_list(&metadata_dir, "metadata.gz"), vec![extracted.model]);
}

#[test]
fn test_unreadable_file_is_a_read_error() {
    let root = tempdir().unwrap();
    let archive = Archive::new(config(&root));
    let path = root.path().join("not-dicom.txt");
    fs::write(&path, b"hello").unwrap();

    assert!(matches!(archive.extract_file(&path), Err(ArchiveError::ReadError(_))));
}

fn write_part10_file(path: &Path, sop: &str, fragments: Vec<Vec<u8>>) {
    let mut obj = InMemDicomObject::new_empty();
    let mut put = |tag, vr, value: &str| obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    put(tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.7");
    put(tags::SOP_INSTANCE_UID, VR::UI, sop);
    put(tags::STUDY_INSTANCE_UID, VR::UI, STUDY);
    put(tags::SERIES_INSTANCE_UID, VR::UI, SERIES);
    put(tags::MODALITY, VR::CS, "OT");
    put(tags::PATIENT_NAME, VR::PN, "Doe^Jane");
    put(tags::PATIENT_ID, VR::LO, "PID-9");
    put(tags::STUDY_DESCRIPTION, VR::LO, "Secondary capture");
    put(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "YBR_FULL_422");
    for (tag, value) in [
        (tags::SAMPLES_PER_PIXEL, 3_u16),
        (tags::ROWS, 8),
        (tags::COLUMNS, 8),
        (tags::BITS_ALLOCATED, 8),
    ] {
        obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PixelFragmentSequence::new(Vec::<u32>::new(), fragments),
    ));

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
                .media_storage_sop_instance_uid(sop)
                .transfer_syntax("1.2.840.10008.1.2.4.50"),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

#[test]
fn test_import_part10_file_with_encapsulated_pixel_data() {
    let root = tempdir().unwrap();
    let config = config(&root);
    let mut archive = Archive::new(config.clone());
    let path = root.path().join("image.dcm");
    let fragments = vec![vec![0xFF, 0xD8, 1, 2, 3, 4], vec![5, 6, 0xFF, 0xD9]];
    write_part10_file(&path, "1.2.3.9", fragments.clone());

    assert!(archive.import_file(&path).unwrap());
    archive.finish().unwrap();

    let studies = read_list(&config.studies_dir(), INDEX_FILE);
    assert_eq!(studies.len(), 1);
    assert_eq!(studies[0].get_str(tags::PATIENT_ID), Some("PID-9"));

    let mut aggregate = reload(&config, STUDY);
    let combined = aggregate.recombine(0).unwrap();
    assert_eq!(combined.get_str(tags::SOP_INSTANCE_UID), Some("1.2.3.9"));
    assert_eq!(
        combined.get_str(tags::AVAILABLE_TRANSFER_SYNTAX_UID),
        Some("1.2.840.10008.1.2.4.50")
    );
    let uri = format!("series/{SERIES}/instances/1.2.3.9/frames");
    assert_eq!(
        combined.attribute(tags::PIXEL_DATA).unwrap().value,
        AttributeValue::BulkDataUri(uri.clone())
    );

    let frame = fs::read(config.study_paths(STUDY).study_dir.join(uri).join("1")).unwrap();
    let jpeg = fragments.concat();
    assert!(frame.windows(jpeg.len()).any(|window| window == jpeg.as_slice()));
    let body = String::from_utf8_lossy(&frame);
    assert!(body.contains("Content-Type: image/jpeg;transfer-syntax=1.2.840.10008.1.2.4.50"));
}


use crate::dataset::RawDataSetBuilder;
use crate::extract::{BulkDataHandler, BulkDataOptions, Extractor};
use crate::model::AttributeModel;
use crate::processor::{deduplicate, Deduplicated};
use crate::store;
use crate::study::StudyAggregate;
use crate::tags;
use dicom_core::VR;

/// A small explicit VR little endian CT instance without pixel data.
pub(crate) fn raw_instance(study: &str, series: &str, sop: &str) -> RawDataSetBuilder {
    RawDataSetBuilder::new()
        .element(tags::TRANSFER_SYNTAX_UID, Some(VR::UI), b"1.2.840.10008.1.2.1")
        .element(tags::SOP_CLASS_UID, Some(VR::UI), b"1.2.840.10008.5.1.4.1.1.2")
        .element(tags::SOP_INSTANCE_UID, Some(VR::UI), sop.as_bytes())
        .element(tags::MODALITY, Some(VR::CS), b"CT")
        .element(tags::PATIENT_NAME, Some(VR::PN), b"Doe^John")
        .element(tags::PATIENT_ID, Some(VR::LO), b"PID-1")
        .element(tags::STUDY_INSTANCE_UID, Some(VR::UI), study.as_bytes())
        .element(tags::SERIES_INSTANCE_UID, Some(VR::UI), series.as_bytes())
        .element(tags::INSTANCE_NUMBER, Some(VR::IS), b"1 ")
        .element(tags::SAMPLES_PER_PIXEL, Some(VR::US), &1_u16.to_le_bytes())
        .element(tags::ROWS, Some(VR::US), &2_u16.to_le_bytes())
        .element(tags::COLUMNS, Some(VR::US), &2_u16.to_le_bytes())
        .element(tags::BITS_ALLOCATED, Some(VR::US), &8_u16.to_le_bytes())
}

/// The attribute model of [`raw_instance`].
pub(crate) fn make_instance(study: &str, series: &str, sop: &str) -> AttributeModel {
    model_of(raw_instance(study, series, sop))
}

pub(crate) fn model_of(builder: RawDataSetBuilder) -> AttributeModel {
    let data_set = builder.build();
    Extractor::default()
        .extract(data_set.view(), &mut RecordingHandler::default())
        .unwrap()
}

/// Stores the fragments of `instance` and adds its record, like the ingestion pipeline.
pub(crate) fn ingest_instance(aggregate: &mut StudyAggregate, instance: AttributeModel) -> bool {
    let Deduplicated { fragments, record } = deduplicate(instance).unwrap();
    for fragment in fragments {
        aggregate.write_fragment_once(fragment).unwrap();
    }
    aggregate.add_deduplicated(record).unwrap()
}

/// Keeps everything it is handed in memory.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    pub frames: Vec<(usize, Vec<u8>)>,
    pub videos: Vec<(Vec<u8>, String)>,
    pub bulk: Vec<(Vec<u8>, Option<String>)>,
}

impl BulkDataHandler for RecordingHandler {
    fn bulkdata(&mut self, bytes: &[u8], options: &BulkDataOptions) -> store::Result<String> {
        self.bulk.push((bytes.to_vec(), options.mime_type.clone()));
        Ok(format!("bulk/{}", self.bulk.len() - 1))
    }

    fn image_frame(&mut self, frame: &[u8], index: usize) -> store::Result<String> {
        self.frames.push((index, frame.to_vec()));
        Ok("frames".to_string())
    }

    fn video(&mut self, stream: &[u8], extension: &str) -> store::Result<String> {
        self.videos.push((stream.to_vec(), extension.to_string()));
        Ok(format!("video.{extension}"))
    }
}

//! Writing externalised content of one instance into its study directory.

use crate::config::Config;
use crate::extract::{BulkDataHandler, BulkDataOptions};
use crate::hashing::{Blake3Hasher, Hasher};
use crate::store::{self, extension_for_mime, hash_path, write_atomic};
use log::debug;
use std::path::{Path, PathBuf};

pub const MULTIPART_BOUNDARY: &str = "BOUNDARY_FIXED_32934857949532587";

const UNCOMPRESSED_TRANSFER_SYNTAXES: &[&str] = &[
    "1.2.840.10008.1.2",
    "1.2.840.10008.1.2.1",
    "1.2.840.10008.1.2.1.99",
    "1.2.840.10008.1.2.2",
];

pub fn is_uncompressed(transfer_syntax: &str) -> bool {
    UNCOMPRESSED_TRANSFER_SYNTAXES.contains(&transfer_syntax)
}

/// Media type of a single frame encoded in the given transfer syntax.
pub fn frame_content_type(transfer_syntax: &str) -> &'static str {
    match transfer_syntax {
        "1.2.840.10008.1.2.4.50" | "1.2.840.10008.1.2.4.51" | "1.2.840.10008.1.2.4.57"
        | "1.2.840.10008.1.2.4.70" => "image/jpeg",
        "1.2.840.10008.1.2.4.80" | "1.2.840.10008.1.2.4.81" => "image/jls",
        "1.2.840.10008.1.2.4.90" | "1.2.840.10008.1.2.4.91" => "image/jp2",
        "1.2.840.10008.1.2.4.92" | "1.2.840.10008.1.2.4.93" => "image/jpx",
        "1.2.840.10008.1.2.4.201" | "1.2.840.10008.1.2.4.202" | "1.2.840.10008.1.2.4.203" => {
            "image/jphc"
        }
        "1.2.840.10008.1.2.5" => "image/dicom-rle",
        _ => "application/octet-stream",
    }
}

/// Wraps a frame in a single part multipart body.
pub fn multipart_frame(frame: &[u8], content_type: &str, transfer_syntax: &str) -> Vec<u8> {
    let header = format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: {content_type};transfer-syntax={transfer_syntax}\r\n\r\n"
    );
    let trailer = format!("\r\n--{MULTIPART_BOUNDARY}--");
    let mut body = Vec::with_capacity(header.len() + frame.len() + trailer.len());
    body.extend_from_slice(header.as_bytes());
    body.extend_from_slice(frame);
    body.extend_from_slice(trailer.as_bytes());
    body
}

/// Writes bulk data, frames and video of one instance below `<study>`.
///
/// * raw bulk data is content addressed: `bulkdata/<3>/<2>/<rest>.raw`
/// * frames go to `series/<series>/instances/<sop>/frames/<n>`, numbered from 1
/// * video goes to `series/<series>/instances/<sop>/pixeldata.<ext>`
///
/// Returned URIs are relative to the study and start with the configured prefix.
#[derive(Debug, Clone)]
pub struct StudyBulkDataWriter {
    study_dir: PathBuf,
    instance_path: String,
    transfer_syntax: String,
    uri_prefix: String,
    gzip_threshold: usize,
}

impl StudyBulkDataWriter {
    pub fn new(
        config: &Config,
        study_dir: &Path,
        series_instance_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax: &str,
    ) -> Self {
        Self {
            study_dir: study_dir.to_path_buf(),
            instance_path: format!("series/{series_instance_uid}/instances/{sop_instance_uid}"),
            transfer_syntax: transfer_syntax.to_string(),
            uri_prefix: config.bulk_data_uri_prefix().to_string(),
            gzip_threshold: config.gzip_bulk_data_threshold(),
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("{}{path}", self.uri_prefix)
    }

    fn instance_dir(&self) -> PathBuf {
        self.study_dir.join(&self.instance_path)
    }
}

impl BulkDataHandler for StudyBulkDataWriter {
    fn bulkdata(&mut self, bytes: &[u8], options: &BulkDataOptions) -> store::Result<String> {
        let hash = Blake3Hasher::new().hash(bytes);
        let location = hash_path(&hash, extension_for_mime(options.mime_type.as_deref()))?;
        let dir = location.dir_in(&self.study_dir);
        let gzip = bytes.len() > self.gzip_threshold;

        let stored = dir.join(&location.file_name).is_file()
            || dir.join(format!("{}.gz", location.file_name)).is_file();
        if stored {
            debug!("bulk data {hash} already stored");
        } else {
            write_atomic(&dir, &location.file_name, bytes, gzip)?;
        }
        Ok(self.uri(&location.uri()))
    }

    fn image_frame(&mut self, frame: &[u8], index: usize) -> store::Result<String> {
        let content_type = frame_content_type(&self.transfer_syntax);
        let body = multipart_frame(frame, content_type, &self.transfer_syntax);
        write_atomic(
            &self.instance_dir().join("frames"),
            &(index + 1).to_string(),
            &body,
            is_uncompressed(&self.transfer_syntax),
        )?;
        Ok(self.uri(&format!("{}/frames", self.instance_path)))
    }

    fn video(&mut self, stream: &[u8], extension: &str) -> store::Result<String> {
        let name = format!("pixeldata.{extension}");
        write_atomic(&self.instance_dir(), &name, stream, false)?;
        Ok(self.uri(&format!(
            "{}/{name}?length={}&offset=0",
            self.instance_path,
            stream.len()
        )))
    }
}

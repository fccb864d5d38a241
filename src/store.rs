//! Content addressed file storage.
//!
//! Everything the archive writes goes through [`write_atomic`]: data lands in a temporary
//! file in the target directory and is renamed to its final name once complete, so a
//! reader never sees a partially written file under its real name.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Directory, relative to a study, holding content addressed blobs.
pub const BULKDATA_DIR: &str = "bulkdata";

const SHARD_FIRST: usize = 3;
const SHARD_SECOND: usize = 5;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Location of a blob inside a study, derived from its hash.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HashPath {
    /// `bulkdata/<3 chars>/<2 chars>`, always with forward slashes.
    pub dir: String,
    /// Remaining hash characters plus the extension.
    pub file_name: String,
}

impl HashPath {
    /// The study relative URI of the blob.
    pub fn uri(&self) -> String {
        format!("{}/{}", self.dir, self.file_name)
    }

    pub fn dir_in(&self, study_dir: &Path) -> PathBuf {
        study_dir.join(&self.dir)
    }
}

/// Shards a content hash into a two level directory and a file name.
pub fn hash_path(hash: &str, extension: &str) -> Result<HashPath> {
    if hash.len() <= SHARD_SECOND || !hash.is_ascii() {
        return Err(Error::InvalidHash(hash.to_string()));
    }
    Ok(HashPath {
        dir: format!(
            "{BULKDATA_DIR}/{}/{}",
            &hash[..SHARD_FIRST],
            &hash[SHARD_FIRST..SHARD_SECOND]
        ),
        file_name: format!("{}{}", &hash[SHARD_SECOND..], extension),
    })
}

/// File extension for bulk data of the given MIME type.
pub fn extension_for_mime(mime_type: Option<&str>) -> &'static str {
    match mime_type.map(str::trim) {
        Some("application/pdf") => ".pdf",
        Some("text/xml") | Some("application/xml") => ".xml",
        Some("application/json") => ".json",
        Some("text/plain") => ".txt",
        Some("image/jpeg") => ".jpg",
        Some("image/png") => ".png",
        Some("model/stl") => ".stl",
        _ => ".raw",
    }
}

/// Writes `bytes` to `dir/name`, creating `dir` when needed.
///
/// With `gzip` (or when the name already mentions `.gz`) the content is compressed and
/// `.gz` is appended to the name if missing. Returns the final path.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8], gzip: bool) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let has_gz = name.contains(".gz");
    let final_name = if gzip && !has_gz {
        format!("{name}.gz")
    } else {
        name.to_string()
    };
    let target = dir.join(final_name);

    let mut temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)
        .map_err(io_error(dir))?;
    if gzip || has_gz {
        let mut encoder = GzEncoder::new(temp.as_file_mut(), Compression::default());
        encoder.write_all(bytes).map_err(io_error(&target))?;
        encoder.finish().map_err(io_error(&target))?;
    } else {
        temp.write_all(bytes).map_err(io_error(&target))?;
    }
    temp.as_file().sync_all().map_err(io_error(&target))?;
    temp.persist(&target).map_err(|err| Error::Io {
        path: target.clone(),
        source: err.error,
    })?;
    Ok(target)
}

/// Placement of a JSON document.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct JsonOptions {
    pub gzip: bool,
    /// Write `dir/name/index.json.gz` instead of `dir/name`.
    pub index: bool,
}

impl JsonOptions {
    pub const INDEX: JsonOptions = JsonOptions {
        gzip: true,
        index: true,
    };

    pub const GZIP_FILE: JsonOptions = JsonOptions {
        gzip: true,
        index: false,
    };
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self::INDEX
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    dir: &Path,
    name: &str,
    data: &T,
    options: JsonOptions,
) -> Result<PathBuf> {
    let bytes = serde_json::to_vec(data).map_err(|source| Error::Json {
        path: dir.join(name),
        source,
    })?;
    if options.index {
        write_atomic(&dir.join(name), "index.json.gz", &bytes, true)
    } else {
        write_atomic(dir, name, &bytes, options.gzip)
    }
}

/// Reads a JSON document, gunzipping names containing `.gz`.
///
/// A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Option<T>> {
    let path = dir.join(name);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(&path)(err)),
    };
    let data = if name.contains(".gz") {
        let mut decoded = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(io_error(&path))?;
        decoded
    } else {
        raw
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| Error::Json { path, source })
}

/// Reads a content addressed JSON blob of a study.
pub fn read_hash_data<T: DeserializeOwned>(
    study_dir: &Path,
    hash: &str,
    extension: &str,
) -> Result<Option<T>> {
    let location = hash_path(hash, extension)?;
    read_json(&location.dir_in(study_dir), &location.file_name)
}

/// A compressed JSON file found by [`list_gz_files`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListedFile {
    pub name: String,
    /// The name up to its `.gz` suffix.
    pub hash: String,
    pub modified: SystemTime,
}

/// Lists the `.gz` files of a directory, newest first. A missing directory lists nothing.
pub fn list_gz_files(dir: &Path) -> Result<Vec<ListedFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir)(err)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(gz_index) = name.find(".gz").filter(|index| *index > 0) else {
            continue;
        };
        let metadata = entry.metadata().map_err(io_error(&entry.path()))?;
        if !metadata.is_file() {
            continue;
        }
        files.push(ListedFile {
            hash: name[..gz_index].to_string(),
            modified: metadata.modified().map_err(io_error(&entry.path()))?,
            name,
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// Removes a directory tree, ignoring one that does not exist.
pub fn remove_dir_all(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(dir)(err)),
        _ => Ok(()),
    }
}

/// Removes a file, ignoring one that does not exist.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(path)(err)),
        _ => Ok(()),
    }
}

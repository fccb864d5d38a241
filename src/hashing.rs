use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("Invalid input: {}", .0.to_lowercase())]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("{err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Produces the content identity of a byte string.
pub trait Hasher {
    fn hash(&self, input: &[u8]) -> String;

    /// Hashes the compact JSON serialisation of `value`.
    ///
    /// Attribute models serialise in tag order with normalised value lists, so two models
    /// holding the same attributes always hash the same.
    fn hash_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.hash(&bytes))
    }
}

/// Blake3 hasher rendering digests as 64 lower case hex digits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Blake3Hasher;

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {}
    }
}

impl Hasher for Blake3Hasher {
    fn hash(&self, input: &[u8]) -> String {
        blake3::hash(input).to_hex().to_string()
    }
}

/// Content hash of any serialisable value with the default hasher.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Blake3Hasher::new().hash_json(value)
}

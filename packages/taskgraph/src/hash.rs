//! Hashing operations and types.

use std::{fs::File, io, path::Path};

use sha2::{Digest as _, Sha256};
use strum::{Display, EnumString};
use tracing::trace;

/// How a task identifies the files it reads and writes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HashAlgorithm {
    /// Identify a file by its `(path, size, mtime)` stat alone. Cheap, but
    /// tied to the file's location and timestamp.
    #[default]
    SizeTimestamp,
    /// Identify a file by a sha256 digest of its content.
    Sha256,
    /// Identify a file by a blake3 digest of its content.
    Blake3,
}

impl HashAlgorithm {
    /// Whether this algorithm digests file content (as opposed to stat
    /// metadata). Content algorithms are what enable artifact reuse across
    /// target paths.
    pub fn is_content(self) -> bool {
        !matches!(self, HashAlgorithm::SizeTimestamp)
    }
}

/// Digest the contents of the file at `path` with `alg`, as a hex string.
///
/// Returns `None` for [`HashAlgorithm::SizeTimestamp`], which never reads
/// file content.
pub fn content_digest(alg: HashAlgorithm, path: &Path) -> io::Result<Option<String>> {
    let digest = match alg {
        HashAlgorithm::SizeTimestamp => return Ok(None),
        HashAlgorithm::Sha256 => {
            let mut reader = io::BufReader::new(File::open(path)?);
            let mut hasher = Sha256::new();
            io::copy(&mut reader, &mut hasher)?;
            hex::encode(hasher.finalize())
        }
        HashAlgorithm::Blake3 => {
            let mut reader = io::BufReader::new(File::open(path)?);
            let mut hasher = blake3::Hasher::new();
            io::copy(&mut reader, &mut hasher)?;
            hex::encode(hasher.finalize().as_bytes())
        }
    };
    trace!(?path, %alg, %digest, "hashed file content");
    Ok(Some(digest))
}

/// Digest the contents of a buffer with `alg`, as a hex string.
pub fn buffer_digest(alg: HashAlgorithm, buffer: &[u8]) -> Option<String> {
    match alg {
        HashAlgorithm::SizeTimestamp => None,
        HashAlgorithm::Sha256 => Some(hex::encode(Sha256::digest(buffer))),
        HashAlgorithm::Blake3 => Some(hex::encode(blake3::hash(buffer).as_bytes())),
    }
}

/// Hash an ordered sequence of fields into a stable hex digest.
///
/// Fields are framed with a separator byte so that shifting bytes between
/// adjacent fields changes the digest. Fingerprints always use blake3 here
/// regardless of the task's content [`HashAlgorithm`]; the algorithm still
/// participates as one of the hashed fields.
pub(crate) fn digest_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in fields {
        hasher.update(field.as_ref());
        hasher.update(&[0x1f]);
    }
    hex::encode(hasher.finalize().as_bytes())
}

//! File stat summarization.
//!
//! A [`FileRecord`] is the unit of filesystem evidence behind every
//! fingerprint and every memo record: enough of a stat to decide whether a
//! file changed, plus a content digest when the task's hash algorithm asks
//! for one. [`file_stats`] walks an argument tree lazily and emits a record
//! for every path value that names an existing filesystem entry.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    hash::{HashAlgorithm, content_digest},
    path::MAX_PATH_LEN,
    value::TaskValue,
};

/// A point-in-time summary of a filesystem entry.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ns: i64,
    /// Present when the record was taken with a content [`HashAlgorithm`]
    /// and the entry is a regular file.
    pub content_hash: Option<String>,
}

impl FileRecord {
    /// Stat `path`, producing a record if it names an existing entry.
    ///
    /// - Missing entries and paths longer than the OS limit yield `None`.
    /// - Regular files get a content digest when `alg` is a content
    ///   algorithm.
    /// - Directories get a synthetic record from their own stat (never a
    ///   content digest) unless `ignore_directories` is set.
    pub fn for_path(
        path: &Path,
        alg: HashAlgorithm,
        ignore_directories: bool,
    ) -> io::Result<Option<FileRecord>> {
        if path.as_os_str().len() > MAX_PATH_LEN {
            return Ok(None);
        }
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            // Over-long paths surface differently per OS; either way they
            // are not something a task can declare.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => return Ok(None),
            Err(err) => return Err(err),
        };

        let mtime = FileTime::from_last_modification_time(&metadata);
        let mtime_ns = mtime.unix_seconds() * 1_000_000_000 + i64::from(mtime.nanoseconds());

        let record = if metadata.is_file() {
            FileRecord {
                path: path.to_path_buf(),
                size: metadata.len(),
                mtime_ns,
                content_hash: content_digest(alg, path)?,
            }
        } else if metadata.is_dir() && !ignore_directories {
            FileRecord {
                path: path.to_path_buf(),
                size: metadata.len(),
                mtime_ns,
                content_hash: None,
            }
        } else {
            return Ok(None);
        };

        trace!(?path, size = record.size, "took file record");
        Ok(Some(record))
    }

    /// The string contributed to a fingerprint by this record.
    ///
    /// Content-hashed files are identified by digest alone, so renaming or
    /// re-creating a file with identical bytes does not change identity.
    /// Stat-identified entries keep their path: two files with equal sizes
    /// and timestamps at different locations are still different inputs.
    pub(crate) fn identity(&self) -> String {
        match &self.content_hash {
            Some(digest) => format!("content:{digest}"),
            None => format!("{}|{}|{}", self.path.display(), self.size, self.mtime_ns),
        }
    }

    /// Whether the on-disk entry still matches this record.
    ///
    /// Content records compare size and digest (timestamps may drift under
    /// copies); stat records compare size and mtime.
    pub(crate) fn still_matches(&self, alg: HashAlgorithm) -> bool {
        match FileRecord::for_path(&self.path, alg, false) {
            Ok(Some(current)) => {
                if current.size != self.size {
                    false
                } else if self.content_hash.is_some() {
                    current.content_hash == self.content_hash
                } else {
                    current.mtime_ns == self.mtime_ns
                }
            }
            _ => false,
        }
    }
}

/// Lazily walk `values`, emitting a [`FileRecord`] for every path value
/// that names an existing filesystem entry.
///
/// Paths in `ignore` are skipped entirely. Sequences are visited in order
/// and mappings in key order; non-path scalars never contribute.
pub fn file_stats<'a>(
    values: impl IntoIterator<Item = &'a TaskValue>,
    alg: HashAlgorithm,
    ignore: &'a BTreeSet<PathBuf>,
    ignore_directories: bool,
) -> FileStats<'a> {
    let mut stack: Vec<&'a TaskValue> = values.into_iter().collect();
    stack.reverse();
    FileStats {
        stack,
        alg,
        ignore,
        ignore_directories,
    }
}

/// Iterator returned by [`file_stats`].
pub struct FileStats<'a> {
    stack: Vec<&'a TaskValue>,
    alg: HashAlgorithm,
    ignore: &'a BTreeSet<PathBuf>,
    ignore_directories: bool,
}

impl Iterator for FileStats<'_> {
    type Item = io::Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(value) = self.stack.pop() {
            match value {
                TaskValue::Scalar(_) => {}
                TaskValue::Seq(items) => self.stack.extend(items.iter().rev()),
                TaskValue::Map(entries) => self.stack.extend(entries.values().rev()),
                TaskValue::Path(path) => {
                    if self.ignore.contains(path.as_path()) {
                        continue;
                    }
                    match FileRecord::for_path(path, self.alg, self.ignore_directories) {
                        Ok(Some(record)) => return Some(Ok(record)),
                        Ok(None) => {}
                        Err(err) => return Some(Err(err)),
                    }
                }
            }
        }
        None
    }
}

//! Deterministic task identity.
//!
//! Two digests are derived from a submission, both over the same canonical
//! value encoding:
//!
//! - The **submission digest** is computed synchronously in `add_task`,
//!   before any filesystem inspection. It is the identity used for
//!   same-graph deduplication and the duplicate-target mismatch check.
//! - The **fingerprint** is assigned exactly once, when a task becomes
//!   ready (every dependency terminal and non-failed). It folds in file
//!   stat evidence for path arguments and the fingerprints of
//!   dependencies, and is the key under which completions are memoized.
//!
//! The fingerprint concatenates five blocks in fixed order — function
//! identity, arguments and keyword arguments, declared output targets,
//! dependency fingerprints, hash algorithm — and that order is the sole
//! source of determinism.
//!
//! Path values render by role: a declared target collapses to a constant
//! marker (so submissions differing only in output location can share a
//! fingerprint and reuse each other's artifacts), an ignored path collapses
//! to a different marker, an existing file contributes its
//! [`FileRecord`] identity, and anything else contributes its normalized
//! literal form. Scalars are never inspected, no matter how much they look
//! like paths.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::PathBuf,
};

use derive_more::Display;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    hash::{HashAlgorithm, digest_fields},
    stat::{FileRecord, file_stats},
    value::TaskValue,
};

/// Bumped when the canonical encoding changes shape; keeps stale memo
/// records from older layouts from matching.
const FORMAT_VERSION: &str = "tg1";

/// A task's content-addressed identity, as a stable hex string.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Fingerprint(raw.into())
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The hashable parts of one submission. All paths are pre-normalized and
/// `targets` is sorted.
pub(crate) struct TaskIdentity<'a> {
    pub op: Option<(&'a str, &'a str)>,
    pub args: &'a [TaskValue],
    pub kwargs: &'a BTreeMap<String, TaskValue>,
    pub targets: &'a [PathBuf],
    pub ignore: &'a BTreeSet<PathBuf>,
    pub alg: HashAlgorithm,
}

/// Identity digest available at submission time. No filesystem access.
pub(crate) fn submission_digest<'a>(
    identity: &TaskIdentity<'_>,
    dep_digests: impl IntoIterator<Item = &'a str>,
) -> String {
    digest(identity, None, "-", dep_digests)
}

/// The full fingerprint of a ready task. Gathers file stat evidence for
/// every path argument outside the target and ignore sets.
pub(crate) fn task_fingerprint<'a>(
    identity: &TaskIdentity<'_>,
    dep_fingerprints: impl IntoIterator<Item = &'a str>,
) -> io::Result<Fingerprint> {
    let mut excluded: BTreeSet<PathBuf> = identity.ignore.clone();
    excluded.extend(identity.targets.iter().cloned());

    let values = identity.args.iter().chain(identity.kwargs.values());
    let mut records = BTreeMap::new();
    for record in file_stats(values, identity.alg, &excluded, false) {
        let record = record?;
        records.insert(record.path.clone(), record);
    }

    let target_block = identity.targets.len().to_string();
    let fingerprint = digest(identity, Some(&records), &target_block, dep_fingerprints);
    trace!(%fingerprint, records = records.len(), "computed task fingerprint");
    Ok(Fingerprint(fingerprint))
}

fn digest<'a>(
    identity: &TaskIdentity<'_>,
    records: Option<&BTreeMap<PathBuf, FileRecord>>,
    target_block: &str,
    dep_block: impl IntoIterator<Item = &'a str>,
) -> String {
    let context = Encoder {
        targets: identity.targets,
        ignore: identity.ignore,
        records,
    };

    let mut args = String::new();
    for value in identity.args {
        context.encode(value, &mut args);
        args.push(',');
    }

    let mut kwargs = String::new();
    for (key, value) in identity.kwargs {
        kwargs.push_str(key);
        kwargs.push('=');
        context.encode(value, &mut kwargs);
        kwargs.push(',');
    }

    let (op_name, op_version) = identity.op.unwrap_or_default();
    let deps = dep_block.into_iter().sorted().join(",");
    let alg = identity.alg.to_string();

    digest_fields([
        FORMAT_VERSION,
        op_name,
        op_version,
        args.as_str(),
        kwargs.as_str(),
        target_block,
        deps.as_str(),
        alg.as_str(),
    ])
}

struct Encoder<'a> {
    targets: &'a [PathBuf],
    ignore: &'a BTreeSet<PathBuf>,
    records: Option<&'a BTreeMap<PathBuf, FileRecord>>,
}

impl Encoder<'_> {
    fn encode(&self, value: &TaskValue, out: &mut String) {
        match value {
            TaskValue::Scalar(literal) => {
                out.push_str("s(");
                out.push_str(literal);
                out.push(')');
            }
            TaskValue::Seq(items) => {
                out.push_str("l(");
                for item in items {
                    self.encode(item, out);
                    out.push(',');
                }
                out.push(')');
            }
            TaskValue::Map(entries) => {
                out.push_str("m(");
                for (key, item) in entries {
                    out.push_str(key);
                    out.push('=');
                    self.encode(item, out);
                    out.push(',');
                }
                out.push(')');
            }
            TaskValue::Path(path) => {
                if self.targets.binary_search(path).is_ok() {
                    out.push_str("t()");
                } else if self.ignore.contains(path) {
                    out.push_str("g()");
                } else if let Some(record) = self.records.and_then(|r| r.get(path)) {
                    out.push_str("f(");
                    out.push_str(&record.identity());
                    out.push(')');
                } else {
                    out.push_str("p(");
                    out.push_str(&path.display().to_string());
                    out.push(')');
                }
            }
        }
    }
}

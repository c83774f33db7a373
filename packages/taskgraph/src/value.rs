//! Task argument values.
//!
//! Arguments cross the submission boundary as a tagged variant rather than
//! opaque language values: the fingerprint normalizer is a total function
//! over this tree, and nothing that is not explicitly a [`TaskValue::Path`]
//! is ever mistaken for one. Scalars carry their literal string form, which
//! is exactly what contributes to the fingerprint.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::path::normalize;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum TaskValue {
    /// A scalar in its literal string form.
    Scalar(String),
    /// An ordered sequence; order is significant for identity.
    Seq(Vec<TaskValue>),
    /// A string-keyed mapping; keys are hashed in sorted order.
    Map(BTreeMap<String, TaskValue>),
    /// A filesystem path. Only this variant is ever stat-scanned.
    Path(PathBuf),
}

impl TaskValue {
    /// A path value. Use this (or `From<PathBuf>`) for any argument that
    /// names a file; a plain string argument is a scalar and is never
    /// treated as a path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        TaskValue::Path(path.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaskValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            TaskValue::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_str()?.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_str()?.parse().ok()
    }

    /// Rewrite every [`TaskValue::Path`] in the tree to its normalized
    /// absolute form. Runs once at submission so hashing stays pure.
    pub(crate) fn normalized(&self) -> io::Result<TaskValue> {
        Ok(match self {
            TaskValue::Scalar(s) => TaskValue::Scalar(s.clone()),
            TaskValue::Seq(items) => {
                TaskValue::Seq(items.iter().map(|v| v.normalized()).collect::<io::Result<_>>()?)
            }
            TaskValue::Map(entries) => TaskValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.normalized()?)))
                    .collect::<io::Result<_>>()?,
            ),
            TaskValue::Path(p) => TaskValue::Path(normalize(p)?),
        })
    }
}

impl From<&str> for TaskValue {
    fn from(value: &str) -> Self {
        TaskValue::Scalar(value.to_owned())
    }
}

impl From<String> for TaskValue {
    fn from(value: String) -> Self {
        TaskValue::Scalar(value)
    }
}

impl From<bool> for TaskValue {
    fn from(value: bool) -> Self {
        TaskValue::Scalar(value.to_string())
    }
}

macro_rules! scalar_from {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for TaskValue {
                fn from(value: $ty) -> Self {
                    TaskValue::Scalar(value.to_string())
                }
            }
        )+
    };
}

scalar_from!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32, f64);

impl From<PathBuf> for TaskValue {
    fn from(value: PathBuf) -> Self {
        TaskValue::Path(value)
    }
}

impl From<&Path> for TaskValue {
    fn from(value: &Path) -> Self {
        TaskValue::Path(value.to_path_buf())
    }
}

impl<T: Into<TaskValue>> From<Vec<T>> for TaskValue {
    fn from(values: Vec<T>) -> Self {
        TaskValue::Seq(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<TaskValue>> From<BTreeMap<String, T>> for TaskValue {
    fn from(entries: BTreeMap<String, T>) -> Self {
        TaskValue::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

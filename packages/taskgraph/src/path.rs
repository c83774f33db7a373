//! Path normalization for task submissions.
//!
//! Callers may name the same file as a relative path in one run and an
//! absolute path in the next; identity hashing requires one canonical
//! spelling. Every path crossing the submission boundary is normalized
//! here: anchored at the current working directory and cleaned lexically.
//! Symlinks are deliberately not resolved — declared targets usually do
//! not exist yet.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

/// Longest byte length we are willing to treat as a plausible path.
/// Anything longer is user data that merely looks stringy, not a
/// filesystem location.
pub(crate) const MAX_PATH_LEN: usize = 4096;

/// Normalize `path` to an absolute, lexically clean form.
pub fn normalize(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean(&absolute))
}

/// Resolve `.` and `..` components without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            // A leading `..` on an absolute path has nowhere to go; drop it.
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

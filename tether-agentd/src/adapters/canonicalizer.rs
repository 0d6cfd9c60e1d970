use crate::ports::canonicalizer::{CanonicalizeError, PathCanonicalizer};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves symlinks for the longest existing ancestor of a path and appends
/// the remaining components lexically, so paths that do not exist yet (a file
/// about to be written) still canonicalize.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCanonicalizer;

impl PathCanonicalizer for FsCanonicalizer {
    fn canonicalize(&self, path: &Path) -> Result<PathBuf, CanonicalizeError> {
        if !path.is_absolute() {
            return Err(CanonicalizeError::Relative(path.to_path_buf()));
        }
        let components: Vec<Component<'_>> = path.components().collect();
        for split in (1..=components.len()).rev() {
            let prefix: PathBuf = components[..split].iter().collect();
            match std::fs::canonicalize(&prefix) {
                Ok(mut resolved) => {
                    for component in &components[split..] {
                        push_lexically(&mut resolved, *component);
                    }
                    return Ok(resolved);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // A link whose target is missing would be followed by a later
                    // write, so its lexical position proves nothing.
                    if std::fs::symlink_metadata(&prefix).is_ok() {
                        return Err(CanonicalizeError::DanglingSymlink(prefix));
                    }
                }
                Err(source) => {
                    return Err(CanonicalizeError::Io {
                        path: prefix,
                        source,
                    })
                }
            }
        }
        Err(CanonicalizeError::Io {
            path: path.to_path_buf(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }
}

/// Collapses `.` and `..` without touching the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalCanonicalizer;

impl PathCanonicalizer for LexicalCanonicalizer {
    fn canonicalize(&self, path: &Path) -> Result<PathBuf, CanonicalizeError> {
        if !path.is_absolute() {
            return Err(CanonicalizeError::Relative(path.to_path_buf()));
        }
        let mut out = PathBuf::new();
        for component in path.components() {
            push_lexically(&mut out, component);
        }
        Ok(out)
    }
}

fn push_lexically(path: &mut PathBuf, component: Component<'_>) {
    match component {
        Component::CurDir => {}
        Component::ParentDir => {
            path.pop();
        }
        other => path.push(other.as_os_str()),
    }
}

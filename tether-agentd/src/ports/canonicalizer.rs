use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum CanonicalizeError {
    #[error("path is not absolute: {0}")]
    Relative(PathBuf),
    #[error("symlink does not resolve: {0}")]
    DanglingSymlink(PathBuf),
    #[error("cannot resolve {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Maps an absolute path to the form permission checks compare against.
pub trait PathCanonicalizer: Send + Sync {
    fn canonicalize(&self, path: &Path) -> Result<PathBuf, CanonicalizeError>;
}

use std::path::Path;

use crate::error::{IdentityError, Result};

/// Answers whether an artifact is present on disk.
///
/// Implementations must not cache: the external PKI tool mutates the key
/// directory between checks of the same run.
pub trait StateProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsStateProbe;

impl StateProbe for FsStateProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Delete `path`, treating an already-absent file as success. Returns whether
/// a file was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IdentityError::fs(path, e)),
    }
}

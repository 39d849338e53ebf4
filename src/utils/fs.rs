// File system utilities

use std::{
    fs,
    io::{self, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::debug;

/// Ensure a directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        debug!("Creating directory: {}", path.display());
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Replace `path` with `contents` in one step.
///
/// The bytes go to a temporary file in the same directory which is then
/// renamed over the target, so readers see either the old file or the new
/// one, never a partial write.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;

    debug!("Writing file: {}", path.display());
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

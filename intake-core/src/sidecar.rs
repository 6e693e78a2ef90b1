//! Diagnostic sidecar files written beside sources that failed.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use crate::entry::FileEntry;

/// Suffix appended to a source file name to form its sidecar name.
pub const SIDECAR_SUFFIX: &str = ".err";

/// `<dir>/<name>` becomes `<dir>/<name>.err`.
pub fn sidecar_path_for(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    source.with_file_name(name)
}

/// Write the entry's rendered event log to its sidecar, replacing any
/// previous sidecar for the same source. The source itself is not touched.
pub async fn write_sidecar(entry: &FileEntry) -> io::Result<PathBuf> {
    let path = sidecar_path_for(entry.source_path());
    let mut body = entry.to_log_string();
    body.push('\n');
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

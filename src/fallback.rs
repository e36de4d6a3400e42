//! Guarantees a result document exists once every attempt has failed.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{
    error::SupervisorError,
    validate::{is_json_document, ResultDocument},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// No document existed; the synthetic error document was written.
    WroteSynthetic,
    /// The script left its own JSON report; it was kept as is.
    KeptScriptReport,
    /// A non-JSON leftover was replaced by the synthetic document.
    ReplacedInvalid,
}

/// Called only after the retry loop is exhausted.
pub fn report_exhaustion(
    output_path: &Path,
    max_attempts: u32,
) -> Result<FallbackAction, SupervisorError> {
    let action = if !output_path.exists() {
        FallbackAction::WroteSynthetic
    } else if is_json_document(output_path) {
        info!(path = %output_path.display(), "keeping the script's own error report");
        return Ok(FallbackAction::KeptScriptReport);
    } else {
        warn!(path = %output_path.display(), "replacing unparseable output with an error report");
        FallbackAction::ReplacedInvalid
    };

    let doc = ResultDocument::execution_failed(max_attempts);
    write_document(output_path, &doc)?;
    info!(path = %output_path.display(), "wrote fallback error document");
    Ok(action)
}

/// Write `doc` via a sibling temp file and rename, so readers never observe
/// a half-written document.
pub fn write_document(path: &Path, doc: &ResultDocument) -> Result<(), SupervisorError> {
    let body = serde_json::to_string_pretty(doc)?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let write_err = |source| SupervisorError::Write {
        what: "result document",
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(&parent).map_err(write_err)?;
    let mut tmp = NamedTempFile::new_in(&parent).map_err(write_err)?;
    tmp.write_all(body.as_bytes()).map_err(write_err)?;
    tmp.write_all(b"\n").map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

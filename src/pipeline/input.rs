//! Source validation: check that an uploaded or command-line document is
//! something the converter can work with before a run claims any resources.

use crate::config::PipelineConfig;
use crate::error::NarrateError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate a local source document: it must exist, be readable, and carry
/// one of the configured extensions.
pub fn validate_source(path: &Path, config: &PipelineConfig) -> Result<PathBuf, NarrateError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !config.accepts_extension(&extension) {
        return Err(NarrateError::UnsupportedDocument {
            path: path.to_path_buf(),
            allowed: config.allowed_extensions.clone(),
        });
    }

    if !path.is_file() {
        return Err(NarrateError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }

    match std::fs::File::open(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(NarrateError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(NarrateError::io(path, e)),
    }

    debug!("Accepted source document: {}", path.display());
    Ok(path.to_path_buf())
}

/// Reduce an uploaded filename to a safe basename.
///
/// Directory components are dropped and anything outside
/// `[A-Za-z0-9._-]` becomes `_`. Returns `None` when nothing usable remains.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_' || c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

//! Job id generation and path-segment sanitization
//!
//! Every externally supplied string that becomes part of an object key or
//! a filesystem path goes through this module before use. Generated ids
//! already conform by construction; caller-provided values (output
//! subdirs, character names, ids received over HTTP) are the attack
//! surface.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::JobKind;

/// Upper bound for any single path segment, including job ids.
pub const MAX_SEGMENT_LEN: usize = 96;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("value is empty")]
    Empty,

    #[error("value exceeds {MAX_SEGMENT_LEN} characters ({0})")]
    TooLong(usize),

    #[error("invalid character {0:?} in path segment")]
    InvalidChar(char),

    #[error("path escapes its root: {0}")]
    Traversal(String),
}

pub type Result<T> = std::result::Result<T, IdError>;

/// Generate a fresh job id of the shape `<kind>_<YYYYMMDD>_<HHMMSS>_<random8>`.
///
/// Lexicographic order of ids equals creation order (to the second),
/// which is what makes the worker's oldest-first pick work.
pub fn generate(kind: JobKind) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", kind.as_str(), stamp, &suffix[..8])
}

/// Validate a single path segment: `[A-Za-z0-9_-]`, non-empty, length-bounded.
///
/// Rejection, not lossy rewriting: a traversal attempt must surface as an
/// error, never be silently flattened into a different valid name.
pub fn sanitize_segment(value: &str) -> Result<&str> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(IdError::TooLong(value.len()));
    }
    for ch in value.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '-' {
            return Err(IdError::InvalidChar(ch));
        }
    }
    Ok(value)
}

/// Validate a store-relative file path (scripts, assets).
///
/// Segments may additionally contain `.` for file extensions, but `.`/`..`
/// segments, empty segments, and absolute paths are rejected.
pub fn sanitize_rel_path(value: &str) -> Result<&str> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.starts_with('/') {
        return Err(IdError::Traversal(value.to_string()));
    }
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(IdError::Traversal(value.to_string()));
        }
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(IdError::TooLong(segment.len()));
        }
        for ch in segment.chars() {
            if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '-' && ch != '.' {
                return Err(IdError::InvalidChar(ch));
            }
        }
    }
    Ok(value)
}

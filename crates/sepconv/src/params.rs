//! Hierarchical parameter naming.
//!
//! Every owned tensor is addressed in a named weight map as `<scope>/<leaf>`, where the scope is
//! the owning layer's name and nested components extend it (`block1/batch_norm/mean`).

use crate::error::{LayerError, Result};

pub const PATH_SEPARATOR: char = '/';

fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    let reason = if segment.is_empty() {
        format!("{kind} segments must be non-empty")
    } else if !segment.is_ascii() {
        format!("{kind} segments must be ASCII, got '{segment}'")
    } else if segment.chars().any(char::is_whitespace) {
        format!("{kind} segments must not contain whitespace, got '{segment}'")
    } else {
        return Ok(());
    };
    Err(LayerError::configuration(segment, reason))
}

/// Checks a (possibly nested) scope such as `block1` or `block1/batch_norm`.
pub fn validate_scope(scope: &str) -> Result<()> {
    for segment in scope.split(PATH_SEPARATOR) {
        validate_segment("scope", segment)?;
    }
    Ok(())
}

/// Joins a scope and a local leaf name into a fully-qualified parameter path.
pub fn with_name_path(scope: &str, leaf: &str) -> Result<String> {
    validate_scope(scope)?;
    validate_segment("leaf", leaf)?;
    if leaf.contains(PATH_SEPARATOR) {
        return Err(LayerError::configuration(
            leaf,
            format!("leaf names must not contain '{PATH_SEPARATOR}'"),
        ));
    }
    let mut path = String::with_capacity(scope.len() + 1 + leaf.len());
    path.push_str(scope);
    path.push(PATH_SEPARATOR);
    path.push_str(leaf);
    Ok(path)
}

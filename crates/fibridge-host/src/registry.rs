//! Path Registry: virtual paths to data sources.
//!
//! The virtual namespace is kept strictly separate from any filesystem:
//! paths are normalized to a single canonical `/a/b` form and traversal
//! segments are rejected outright rather than resolved.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::source::SourceHandle;

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// A hosted file as seen by the session.
#[derive(Clone)]
pub struct HostedEntry {
    pub virtual_path: String,
    pub source: SourceHandle,
    pub size_bytes: u64,
    pub media_type: String,
}

impl std::fmt::Debug for HostedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedEntry")
            .field("virtual_path", &self.virtual_path)
            .field("source", &self.source.identity())
            .field("size_bytes", &self.size_bytes)
            .field("media_type", &self.media_type)
            .finish()
    }
}

/// Normalize a virtual path.
///
/// Enforces a leading slash, collapses repeated slashes, and rejects `.`,
/// `..`, backslashes, NUL bytes and paths with no file segment.
pub fn normalize_path(path: &str) -> Result<String, RegistryError> {
    let invalid = |reason| RegistryError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if path.contains('\\') {
        return Err(invalid("contains a backslash"));
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(invalid("contains a traversal segment"));
        }
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        return Err(invalid("has no file segment"));
    }
    Ok(normalized)
}

/// Registry of hosted paths, ordered so that replays are deterministic.
#[derive(Debug, Default)]
pub struct PathRegistry {
    entries: BTreeMap<String, HostedEntry>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `path` and return the stored entry.
    ///
    /// Idempotent for the same source identity; a different source at a
    /// path already in use is rejected so in-flight readers are never
    /// silently redirected.
    pub fn register(
        &mut self,
        path: &str,
        source: SourceHandle,
        media_type: Option<&str>,
    ) -> Result<HostedEntry, RegistryError> {
        let virtual_path = normalize_path(path)?;

        if let Some(existing) = self.entries.get(&virtual_path) {
            if existing.source.identity() != source.identity() {
                return Err(RegistryError::PathConflict(virtual_path));
            }
            debug!("{} already hosted, registration is a no-op", virtual_path);
            return Ok(existing.clone());
        }

        let media_type = media_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_media_type(&virtual_path));

        let entry = HostedEntry {
            virtual_path: virtual_path.clone(),
            size_bytes: source.size(),
            source,
            media_type,
        };

        info!(
            "Hosting {} ({} bytes, {})",
            entry.virtual_path, entry.size_bytes, entry.media_type
        );
        self.entries.insert(virtual_path, entry.clone());
        Ok(entry)
    }

    /// Look up a path (normalized first).
    pub fn resolve(&self, path: &str) -> Result<&HostedEntry, RegistryError> {
        let virtual_path =
            normalize_path(path).map_err(|_| RegistryError::NotFound(path.to_string()))?;
        self.entries
            .get(&virtual_path)
            .ok_or(RegistryError::NotFound(virtual_path))
    }

    /// Stop hosting a path.
    pub fn unregister(&mut self, path: &str) -> Result<HostedEntry, RegistryError> {
        let virtual_path = normalize_path(path)?;
        self.entries
            .remove(&virtual_path)
            .ok_or(RegistryError::NotFound(virtual_path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &HostedEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn guess_media_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_MEDIA_TYPE)
        .to_string()
}

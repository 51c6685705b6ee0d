//! Catalog sources that map an external content id to torrent candidates.
//!
//! Providers are registered by name at startup. Looking up a name that was
//! never registered is an error callers must handle, not a panic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A torrent offered by a catalog for one content id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentCandidate {
    pub name: String,
    pub source_link: String,
    /// Quality label, e.g. "720p"
    pub quality: String,
    pub size_bytes: u64,
    pub seeders: u32,
    pub leechers: u32,
}

/// Errors from catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown catalog source: {name}")]
    UnknownSource { name: String },

    #[error("No {quality} candidate for {external_id}")]
    NoCandidate {
        external_id: String,
        quality: String,
    },

    #[error("Catalog source {source_name} failed: {reason}")]
    Provider { source_name: String, reason: String },
}

/// Provider of torrent candidates for an external id.
#[async_trait]
pub trait CatalogSource: Send + Sync + fmt::Debug {
    /// Registry key of this source.
    fn name(&self) -> &str;

    /// All candidates known for `external_id`.
    ///
    /// # Errors
    ///
    /// - `CatalogError::Provider` - The provider could not be queried
    async fn candidates(&self, external_id: &str) -> Result<Vec<TorrentCandidate>, CatalogError>;
}

/// Best-seeded candidate of the requested quality.
///
/// Ties on seeders go to the candidate with more leechers, then to the one
/// listed first.
pub fn select_candidate<'a>(
    candidates: &'a [TorrentCandidate],
    quality: &str,
) -> Option<&'a TorrentCandidate> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.quality.eq_ignore_ascii_case(quality))
        .max_by(|(ia, a), (ib, b)| {
            a.seeders
                .cmp(&b.seeders)
                .then(a.leechers.cmp(&b.leechers))
                .then(ib.cmp(ia))
        })
        .map(|(_, candidate)| candidate)
}

/// Catalog sources keyed by name.
#[derive(Debug, Default, Clone)]
pub struct CatalogRegistry {
    sources: HashMap<String, Arc<dyn CatalogSource>>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `source` under its own name, replacing any previous one.
    pub fn register(&mut self, source: Arc<dyn CatalogSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    /// # Errors
    ///
    /// - `CatalogError::UnknownSource` - No source registered under `name`
    pub fn source(&self, name: &str) -> Result<Arc<dyn CatalogSource>, CatalogError> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownSource {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Queries `source_name` and picks the best candidate of `quality`.
    ///
    /// # Errors
    ///
    /// - `CatalogError::UnknownSource` - No source registered under `source_name`
    /// - `CatalogError::Provider` - The provider failed
    /// - `CatalogError::NoCandidate` - Nothing of that quality was offered
    pub async fn find_candidate(
        &self,
        source_name: &str,
        external_id: &str,
        quality: &str,
    ) -> Result<TorrentCandidate, CatalogError> {
        let source = self.source(source_name)?;
        let candidates = source.candidates(external_id).await?;
        debug!(
            source = source_name,
            external_id,
            count = candidates.len(),
            "Catalog candidates fetched"
        );

        select_candidate(&candidates, quality)
            .cloned()
            .ok_or_else(|| CatalogError::NoCandidate {
                external_id: external_id.to_string(),
                quality: quality.to_string(),
            })
    }
}

/// Source backed by a fixed table, for development and tests.
#[derive(Debug, Clone)]
pub struct StaticCatalogSource {
    name: String,
    entries: HashMap<String, Vec<TorrentCandidate>>,
}

impl StaticCatalogSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn with_candidates(
        mut self,
        external_id: impl Into<String>,
        candidates: Vec<TorrentCandidate>,
    ) -> Self {
        self.entries.insert(external_id.into(), candidates);
        self
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn candidates(&self, external_id: &str) -> Result<Vec<TorrentCandidate>, CatalogError> {
        Ok(self.entries.get(external_id).cloned().unwrap_or_default())
    }
}

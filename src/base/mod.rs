//! Base snapshot provider
//!
//! A build starts from a base snapshot named by a `name[:tag]` reference.
//! Providers turn references into filesystem content; the builder turns that
//! content into the root layer of the chain.

pub mod resolve;

pub use resolve::{list_available_bases, AvailableBase, DirectoryBaseProvider};

use crate::digest::Digest;
use crate::error::{StrataError, StrataResult};
use crate::layer::{Layer, LayerDelta};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Tag used when a reference has none
pub const DEFAULT_TAG: &str = "latest";

/// Reserved name of the empty base
pub const SCRATCH: &str = "scratch";

/// A `name:tag` base reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseRef {
    pub name: String,
    pub tag: String,
}

impl BaseRef {
    /// Parse `name[:tag]`
    pub fn parse(s: &str) -> StrataResult<Self> {
        let s = s.trim();
        // A colon after the last slash separates the tag
        let (name, tag) = match s.rfind(':') {
            Some(pos) if !s[pos..].contains('/') => (&s[..pos], &s[pos + 1..]),
            _ => (s, DEFAULT_TAG),
        };
        validate_name(s, name)?;
        validate_tag(s, tag)?;
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn is_scratch(&self) -> bool {
        self.name == SCRATCH
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl std::str::FromStr for BaseRef {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(reference: &str, reason: impl Into<String>) -> StrataError {
    StrataError::BaseResolution {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

fn validate_name(reference: &str, name: &str) -> StrataResult<()> {
    if name.is_empty() {
        return Err(invalid(reference, "name cannot be empty"));
    }
    if name.starts_with('/') || name.contains("..") || name.contains("//") {
        return Err(invalid(
            reference,
            "name must not start with '/' or contain '..'",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
    {
        return Err(invalid(
            reference,
            "name must contain only alphanumerics, '.', '_', '-' or '/'",
        ));
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> StrataResult<()> {
    if tag.is_empty() {
        return Err(invalid(reference, "tag cannot be empty"));
    }
    if tag.contains("..")
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(
            reference,
            "tag must contain only alphanumerics, '.', '_' or '-'",
        ));
    }
    Ok(())
}

/// Where a base snapshot was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// The empty `scratch` base
    Scratch,
    /// A locally built image with a matching tag
    LocalImage,
    /// `.strata/bases/` next to the build context
    ProjectLocal,
    /// A configured or user-global bases directory
    Directory,
    /// Registered in memory
    Static,
}

impl fmt::Display for BaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scratch => write!(f, "scratch"),
            Self::LocalImage => write!(f, "local image"),
            Self::ProjectLocal => write!(f, "project"),
            Self::Directory => write!(f, "directory"),
            Self::Static => write!(f, "static"),
        }
    }
}

/// Resolved base content
#[derive(Debug, Clone)]
pub struct BaseSnapshot {
    pub reference: BaseRef,
    pub source: BaseSource,
    pub delta: LayerDelta,
    pub digest: Digest,
}

impl BaseSnapshot {
    pub fn new(reference: BaseRef, source: BaseSource, delta: LayerDelta) -> Self {
        let digest = delta.digest();
        Self {
            reference,
            source,
            delta,
            digest,
        }
    }

    /// Root layer of a chain built on this base
    pub fn into_layer(self) -> Layer {
        Layer::new(
            None,
            format!("FROM {}", self.reference),
            self.digest,
            self.delta,
        )
    }
}

/// Resolves base references to snapshots
#[async_trait]
pub trait BaseProvider: Send + Sync {
    async fn resolve(&self, reference: &BaseRef) -> StrataResult<BaseSnapshot>;
}

/// In-memory bases, for embedding and tests
#[derive(Default)]
pub struct StaticBaseProvider {
    bases: RwLock<HashMap<BaseRef, LayerDelta>>,
}

impl StaticBaseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: BaseRef, delta: LayerDelta) {
        self.bases.write().insert(reference, delta);
    }

    pub fn with(self, reference: &str, delta: LayerDelta) -> StrataResult<Self> {
        self.insert(BaseRef::parse(reference)?, delta);
        Ok(self)
    }
}

#[async_trait]
impl BaseProvider for StaticBaseProvider {
    async fn resolve(&self, reference: &BaseRef) -> StrataResult<BaseSnapshot> {
        if reference.is_scratch() {
            return Ok(BaseSnapshot::new(
                reference.clone(),
                BaseSource::Scratch,
                LayerDelta::new(),
            ));
        }
        let delta = self
            .bases
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| invalid(&reference.to_string(), "not registered"))?;
        Ok(BaseSnapshot::new(reference.clone(), BaseSource::Static, delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Entry;

    #[test]
    fn parse_with_and_without_tag() {
        let r = BaseRef::parse("base:v1").unwrap();
        assert_eq!((r.name.as_str(), r.tag.as_str()), ("base", "v1"));

        let r = BaseRef::parse("python").unwrap();
        assert_eq!(r.tag, DEFAULT_TAG);
        assert_eq!(r.to_string(), "python:latest");

        let r = BaseRef::parse("library/debian:12.5").unwrap();
        assert_eq!(r.name, "library/debian");
    }

    #[test]
    fn parse_rejects_traversal_and_junk() {
        assert!(BaseRef::parse("../etc").is_err());
        assert!(BaseRef::parse("/abs").is_err());
        assert!(BaseRef::parse("base:").is_err());
        assert!(BaseRef::parse("ba se").is_err());
        assert!(BaseRef::parse("").is_err());
    }

    #[test]
    fn base_layer_id_tracks_content() {
        let r = BaseRef::parse("base:v1").unwrap();
        let mut a = LayerDelta::new();
        a.insert("etc/os-release", Entry::file(0o644, "ID=a"));
        let mut b = LayerDelta::new();
        b.insert("etc/os-release", Entry::file(0o644, "ID=b"));

        let la = BaseSnapshot::new(r.clone(), BaseSource::Static, a).into_layer();
        let lb = BaseSnapshot::new(r, BaseSource::Static, b).into_layer();
        assert_ne!(la.id, lb.id);
        assert!(la.is_root());
    }

    #[tokio::test]
    async fn static_provider_resolves_registered() {
        let provider = StaticBaseProvider::new()
            .with("base:v1", LayerDelta::new())
            .unwrap();
        let snap = provider.resolve(&BaseRef::parse("base:v1").unwrap()).await.unwrap();
        assert_eq!(snap.source, BaseSource::Static);

        let err = provider
            .resolve(&BaseRef::parse("other").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::BaseResolution { .. }));

        let scratch = provider.resolve(&BaseRef::parse("scratch").unwrap()).await.unwrap();
        assert!(scratch.delta.is_empty());
    }
}

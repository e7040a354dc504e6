//! Filesystem layers
//!
//! A layer is an immutable delta plus the metadata that ties it into a chain:
//! its parent's id, the instruction that produced it and the digest of that
//! instruction's inputs. Layer ids are derived from exactly those three
//! values, so equal build steps always produce equal ids.
//!
//! Chains are plain vectors (the parent of layer `i` is layer `i - 1`) and
//! are only ever appended to.

pub mod archive;
pub mod delta;
pub mod snapshot;
pub mod store;
pub mod view;

pub use delta::{Entry, LayerDelta};
pub use snapshot::Snapshot;
pub use store::LayerStore;
pub use view::UnifiedView;

use crate::digest::{Digest, DigestBuilder};
use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(Digest);

impl LayerId {
    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn hex(&self) -> &str {
        self.0.hex()
    }

    pub fn short(&self) -> &str {
        self.0.short()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Parse a `sha256:<hex>` layer id
    pub fn parse(s: &str) -> Option<Self> {
        Digest::parse(s).map(Self)
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An immutable filesystem layer
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    /// Instruction text that produced the layer
    pub created_by: String,
    /// Digest of the instruction's inputs
    pub input_digest: Digest,
    /// Digest of the delta itself
    pub diff_digest: Digest,
    pub created_at: DateTime<Utc>,
    pub delta: LayerDelta,
}

impl Layer {
    /// Id of the layer that `created_by` produces from `input` on top of `parent`
    pub fn derive_id(parent: Option<&LayerId>, created_by: &str, input: &Digest) -> LayerId {
        let mut hasher = DigestBuilder::new();
        hasher
            .str_field(parent.map(LayerId::as_str).unwrap_or(""))
            .str_field(created_by)
            .str_field(input.as_str());
        LayerId(hasher.finish())
    }

    pub fn new(
        parent: Option<LayerId>,
        created_by: String,
        input_digest: Digest,
        delta: LayerDelta,
    ) -> Self {
        let id = Self::derive_id(parent.as_ref(), &created_by, &input_digest);
        Self {
            id,
            parent,
            created_by,
            input_digest,
            diff_digest: delta.digest(),
            created_at: Utc::now(),
            delta,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn size_bytes(&self) -> u64 {
        self.delta.size_bytes()
    }

    /// Serializable metadata of this layer
    pub fn record(&self) -> LayerRecord {
        LayerRecord {
            id: self.id.clone(),
            parent: self.parent.clone(),
            created_by: self.created_by.clone(),
            input_digest: self.input_digest.clone(),
            diff_digest: self.diff_digest.clone(),
            entries: self.delta.len(),
            size_bytes: self.size_bytes(),
            created_at: self.created_at,
        }
    }

    /// Rebuild a layer from its record and archived delta, verifying both
    pub fn from_record(record: LayerRecord, delta: LayerDelta) -> StrataResult<Self> {
        let expected = Self::derive_id(
            record.parent.as_ref(),
            &record.created_by,
            &record.input_digest,
        );
        if expected != record.id {
            return Err(StrataError::LayerCorrupt {
                id: record.id.to_string(),
                reason: "record does not hash to its id".to_string(),
            });
        }
        let actual = delta.digest();
        if actual != record.diff_digest {
            return Err(StrataError::LayerCorrupt {
                id: record.id.to_string(),
                reason: format!(
                    "archive digest {} does not match {}",
                    actual.short(),
                    record.diff_digest.short()
                ),
            });
        }
        Ok(Self {
            id: record.id,
            parent: record.parent,
            created_by: record.created_by,
            input_digest: record.input_digest,
            diff_digest: record.diff_digest,
            created_at: record.created_at,
            delta,
        })
    }
}

/// Persisted layer metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub created_by: String,
    pub input_digest: Digest,
    pub diff_digest: Digest,
    pub entries: usize,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Append-only chain of layers, base first
#[derive(Debug, Clone, Default)]
pub struct LayerChain {
    layers: Vec<Arc<Layer>>,
}

impl LayerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer whose parent must be the current top
    pub fn push(&mut self, layer: Arc<Layer>) -> StrataResult<()> {
        let top = self.top().map(|l| &l.id);
        if layer.parent.as_ref() != top {
            return Err(StrataError::Internal(format!(
                "layer {} does not extend chain top {}",
                layer.id.short(),
                top.map(LayerId::short).unwrap_or("<empty>")
            )));
        }
        self.layers.push(layer);
        Ok(())
    }

    pub fn top(&self) -> Option<&Arc<Layer>> {
        self.layers.last()
    }

    pub fn top_id(&self) -> Option<&LayerId> {
        self.top().map(|l| &l.id)
    }

    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    pub fn ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Digest over the layer ids, base first
    pub fn digest(&self) -> Digest {
        let mut hasher = DigestBuilder::new();
        for layer in &self.layers {
            hasher.str_field(layer.id.as_str());
        }
        hasher.finish()
    }

    /// Flattened filesystem of the whole chain
    pub fn view(&self) -> UnifiedView {
        UnifiedView::from_deltas(self.layers.iter().map(|l| &l.delta))
    }
}

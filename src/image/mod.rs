//! Image assembly
//!
//! An image is the final layer chain of a build plus the launch metadata
//! collected along the way. Its id covers the layer ids, the content digest
//! of every layer and the metadata. Two builds produce the same image id only
//! when they end on the same chain with the same content and metadata.

pub mod store;

pub use store::{ImageStore, ImageSummary};

use crate::digest::{Digest, DigestBuilder};
use crate::error::{StrataError, StrataResult};
use crate::layer::{LayerChain, LayerId, UnifiedView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Digest);

impl ImageId {
    pub fn hex(&self) -> &str {
        self.0.hex()
    }

    pub fn short(&self) -> &str {
        self.0.short()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Digest::parse(s).map(Self)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Launch metadata recorded by the build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Absolute image path the container starts in
    pub working_dir: String,
    /// Argv run when no override is given
    pub default_command: Option<Vec<String>>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            working_dir: "/".to_string(),
            default_command: None,
        }
    }
}

/// An immutable built image
#[derive(Debug, Clone)]
pub struct Image {
    pub id: ImageId,
    pub chain: LayerChain,
    pub config: ImageConfig,
    pub created_at: DateTime<Utc>,
}

impl Image {
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.chain.ids()
    }

    /// Digest over the layer chain alone
    pub fn chain_digest(&self) -> Digest {
        self.chain.digest()
    }

    pub fn working_dir(&self) -> &str {
        &self.config.working_dir
    }

    pub fn default_command(&self) -> Option<&[String]> {
        self.config.default_command.as_deref()
    }

    /// Flattened filesystem
    pub fn view(&self) -> UnifiedView {
        self.chain.view()
    }

    pub fn size_bytes(&self) -> u64 {
        self.chain.layers().iter().map(|l| l.size_bytes()).sum()
    }
}

/// Image id of a chain plus config
pub fn image_id(chain: &LayerChain, config: &ImageConfig) -> StrataResult<ImageId> {
    let mut hasher = DigestBuilder::new();
    for layer in chain.layers() {
        hasher
            .str_field(layer.id.as_str())
            .str_field(layer.diff_digest.as_str());
    }
    hasher.field(&serde_json::to_vec(config)?);
    Ok(ImageId(hasher.finish()))
}

/// Fold a finished chain and its metadata into an image.
///
/// A missing default command is allowed; such an image needs a command
/// override at launch.
pub fn assemble(chain: LayerChain, config: ImageConfig) -> StrataResult<Image> {
    if chain.is_empty() {
        return Err(StrataError::ImageAssembly(
            "layer chain is empty".to_string(),
        ));
    }
    if !config.working_dir.starts_with('/') {
        return Err(StrataError::ImageAssembly(format!(
            "working directory '{}' is not absolute",
            config.working_dir
        )));
    }
    if matches!(&config.default_command, Some(argv) if argv.is_empty()) {
        return Err(StrataError::ImageAssembly(
            "default command is empty".to_string(),
        ));
    }

    let id = image_id(&chain, &config)?;
    Ok(Image {
        id,
        chain,
        config,
        created_at: Utc::now(),
    })
}

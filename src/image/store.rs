//! Local image store
//!
//! ```text
//! <root>/images/<image-id>.json   image manifest with its layer records
//! <root>/images/tags.json         tag -> image id
//! <root>/layers/blobs/...         delta archives shared by all images
//! ```
//!
//! Layer records live in the manifest rather than in a shared index, so two
//! images whose layers share an id but not their content never collide.

use crate::base::BaseRef;
use crate::digest::Digest;
use crate::error::{StrataError, StrataResult};
use crate::image::{Image, ImageConfig, ImageId};
use crate::layer::{LayerChain, LayerRecord, LayerStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Minimum id prefix accepted when resolving images
const MIN_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageManifest {
    id: ImageId,
    layers: Vec<LayerRecord>,
    config: ImageConfig,
    created_at: DateTime<Utc>,
}

/// Listing entry
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub id: ImageId,
    pub tags: Vec<String>,
    pub layers: usize,
    pub size_bytes: u64,
    pub config: ImageConfig,
    pub created_at: DateTime<Utc>,
}

/// Images and their layers on disk
#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    layers: LayerStore,
    tags_lock: Mutex<()>,
}

impl ImageStore {
    pub fn open(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let root = root.into();
        let images = root.join("images");
        fs::create_dir_all(&images)
            .map_err(|e| StrataError::io(format!("creating {}", images.display()), e))?;
        let layers = LayerStore::open(root.join("layers"))?;
        Ok(Self {
            root,
            layers,
            tags_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, id: &ImageId) -> PathBuf {
        self.root
            .join("images")
            .join(format!("{}.json", id.hex()))
    }

    fn tags_path(&self) -> PathBuf {
        self.root.join("images").join("tags.json")
    }

    /// Persist an image and point `tags` at it
    pub fn save(&self, image: &Image, tags: &[BaseRef]) -> StrataResult<()> {
        for layer in image.chain.layers() {
            self.layers.put_archive(layer)?;
        }

        let manifest = ImageManifest {
            id: image.id.clone(),
            layers: image.chain.layers().iter().map(|l| l.record()).collect(),
            config: image.config.clone(),
            created_at: image.created_at,
        };
        let path = self.manifest_path(&image.id);
        if !path.is_file() {
            write_atomic(&path, &serde_json::to_vec_pretty(&manifest)?)?;
        }

        for tag in tags {
            self.set_tag(tag, &image.id)?;
        }
        info!("Saved image {} ({} layers)", image.id.short(), manifest.layers.len());
        Ok(())
    }

    /// Resolve a tag, full id or unique id prefix
    pub fn resolve(&self, reference: &str) -> StrataResult<ImageId> {
        if let Ok(tag) = BaseRef::parse(reference) {
            if let Some(id) = self.read_tags()?.get(&tag.to_string()) {
                return Ok(id.clone());
            }
        }

        let hex = reference
            .strip_prefix("sha256:")
            .unwrap_or(reference)
            .to_ascii_lowercase();
        if hex.len() < MIN_PREFIX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::ImageNotFound(reference.to_string()));
        }

        let matches: Vec<ImageId> = self
            .manifests()?
            .into_iter()
            .map(|m| m.id)
            .filter(|id| id.hex().starts_with(&hex))
            .collect();
        match matches.as_slice() {
            [] => Err(StrataError::ImageNotFound(reference.to_string())),
            [only] => Ok(only.clone()),
            _ => Err(StrataError::ImageAmbiguous {
                reference: reference.to_string(),
                count: matches.len(),
            }),
        }
    }

    /// Load an image with all of its layers
    pub fn load(&self, id: &ImageId) -> StrataResult<Image> {
        let manifest = self.manifest(id)?;
        let mut chain = LayerChain::new();
        for record in manifest.layers {
            chain.push(Arc::new(self.layers.load(record)?))?;
        }
        Ok(Image {
            id: manifest.id,
            chain,
            config: manifest.config,
            created_at: manifest.created_at,
        })
    }

    /// Resolve and load in one step
    pub fn get(&self, reference: &str) -> StrataResult<Image> {
        let id = self.resolve(reference)?;
        self.load(&id)
    }

    /// Image a tag points at, if any
    pub fn lookup_tag(&self, tag: &BaseRef) -> StrataResult<Option<ImageId>> {
        Ok(self.read_tags()?.get(&tag.to_string()).cloned())
    }

    /// Point `tag` at `id`, moving it off any previous image
    pub fn set_tag(&self, tag: &BaseRef, id: &ImageId) -> StrataResult<()> {
        if !self.manifest_path(id).is_file() {
            return Err(StrataError::ImageNotFound(id.to_string()));
        }
        let _guard = self.tags_lock.lock();
        let mut tags = self.read_tags()?;
        tags.insert(tag.to_string(), id.clone());
        self.write_tags(&tags)?;
        debug!("Tagged {} as {}", id.short(), tag);
        Ok(())
    }

    pub fn list(&self) -> StrataResult<Vec<ImageSummary>> {
        let tags = self.read_tags()?;
        let mut summaries = Vec::new();
        for manifest in self.manifests()? {
            let size_bytes = manifest.layers.iter().map(|r| r.size_bytes).sum();
            summaries.push(ImageSummary {
                tags: tags
                    .iter()
                    .filter(|(_, id)| **id == manifest.id)
                    .map(|(tag, _)| tag.clone())
                    .collect(),
                layers: manifest.layers.len(),
                id: manifest.id,
                size_bytes,
                config: manifest.config,
                created_at: manifest.created_at,
            });
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Remove an image, its tags and the layers no other image uses
    pub fn remove(&self, reference: &str) -> StrataResult<ImageId> {
        let id = self.resolve(reference)?;
        let manifest = self.manifest(&id)?;

        {
            let _guard = self.tags_lock.lock();
            let mut tags = self.read_tags()?;
            tags.retain(|_, target| *target != id);
            self.write_tags(&tags)?;
        }

        let path = self.manifest_path(&id);
        fs::remove_file(&path)
            .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;

        let still_used: HashSet<Digest> = self
            .manifests()?
            .into_iter()
            .flat_map(|m| m.layers)
            .map(|r| r.diff_digest)
            .collect();
        for record in manifest.layers {
            if !still_used.contains(&record.diff_digest) {
                self.layers.remove_archive(&record.diff_digest);
            }
        }

        info!("Removed image {}", id.short());
        Ok(id)
    }

    fn manifest(&self, id: &ImageId) -> StrataResult<ImageManifest> {
        let path = self.manifest_path(id);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::ImageNotFound(id.to_string())
            } else {
                StrataError::io(format!("reading {}", path.display()), e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn manifests(&self) -> StrataResult<Vec<ImageManifest>> {
        let dir = self.root.join("images");
        let read_dir =
            fs::read_dir(&dir).map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?;

        let mut manifests = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            let is_manifest = path.extension().and_then(|e| e.to_str()) == Some("json")
                && path.file_name().and_then(|n| n.to_str()) != Some("tags.json");
            if !is_manifest {
                continue;
            }
            if let Some(manifest) = fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<ImageManifest>(&c).ok())
            {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }

    fn read_tags(&self) -> StrataResult<BTreeMap<String, ImageId>> {
        let path = self.tags_path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StrataError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn write_tags(&self, tags: &BTreeMap<String, ImageId>) -> StrataResult<()> {
        write_atomic(&self.tags_path(), &serde_json::to_vec_pretty(tags)?)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> StrataResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| StrataError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(bytes)
        .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| StrataError::io(format!("publishing {}", path.display()), e.error))?;
    Ok(())
}

//! Base resolution from local sources
//!
//! Resolves base references by searching, first match wins:
//! 1. `scratch`: the empty filesystem
//! 2. Local images: an image tagged with the reference, flattened
//! 3. Project-local: `{context}/.strata/bases/{name}/{tag}/`
//! 4. Configured directories, then `{data_dir}/strata/bases/{name}/{tag}/`

use crate::base::{BaseProvider, BaseRef, BaseSnapshot, BaseSource};
use crate::error::{StrataError, StrataResult};
use crate::image::ImageStore;
use crate::layer::LayerDelta;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Directory-backed base provider
pub struct DirectoryBaseProvider {
    project_dir: Option<PathBuf>,
    search_dirs: Vec<PathBuf>,
    images: Option<Arc<ImageStore>>,
}

impl DirectoryBaseProvider {
    pub fn new() -> Self {
        Self {
            project_dir: None,
            search_dirs: Vec::new(),
            images: None,
        }
    }

    /// Look in `{dir}/.strata/bases/` first
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Additional bases directory, searched in insertion order
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    /// Allow locally built images as bases
    pub fn with_images(mut self, images: Arc<ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    fn candidates(&self, reference: &BaseRef) -> Vec<(PathBuf, BaseSource)> {
        let mut candidates = Vec::new();
        if let Some(project) = &self.project_dir {
            candidates.push((
                bases_dir(project).join(&reference.name).join(&reference.tag),
                BaseSource::ProjectLocal,
            ));
        }
        for dir in &self.search_dirs {
            candidates.push((
                dir.join(&reference.name).join(&reference.tag),
                BaseSource::Directory,
            ));
        }
        candidates
    }
}

impl Default for DirectoryBaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// `.strata/bases` below a project directory
pub fn bases_dir(project: &Path) -> PathBuf {
    project.join(".strata").join("bases")
}

#[async_trait]
impl BaseProvider for DirectoryBaseProvider {
    async fn resolve(&self, reference: &BaseRef) -> StrataResult<BaseSnapshot> {
        // 1. Scratch
        if reference.is_scratch() {
            return Ok(BaseSnapshot::new(
                reference.clone(),
                BaseSource::Scratch,
                LayerDelta::new(),
            ));
        }

        // 2. Local images
        if let Some(images) = &self.images {
            if let Some(id) = images.lookup_tag(reference)? {
                let image = images.load(&id)?;
                debug!("Base {} resolved to local image {}", reference, id.short());
                return Ok(BaseSnapshot::new(
                    reference.clone(),
                    BaseSource::LocalImage,
                    image.view().into_delta(),
                ));
            }
        }

        // 3 + 4. Directories
        let candidates = self.candidates(reference);
        for (dir, source) in &candidates {
            if !dir.is_dir() {
                continue;
            }
            let root = dir.clone();
            let delta = tokio::task::spawn_blocking(move || LayerDelta::capture_dir(&root))
                .await
                .map_err(|e| StrataError::Internal(format!("base capture task failed: {}", e)))?
                .map_err(|e| StrataError::BaseResolution {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })?;
            debug!("Base {} resolved from {}", reference, dir.display());
            return Ok(BaseSnapshot::new(reference.clone(), source.clone(), delta));
        }

        let mut searched: Vec<String> = Vec::new();
        if self.images.is_some() {
            searched.push("local images".to_string());
        }
        searched.extend(candidates.iter().map(|(d, _)| d.display().to_string()));

        Err(StrataError::BaseResolution {
            reference: reference.to_string(),
            reason: if searched.is_empty() {
                "no base sources configured".to_string()
            } else {
                format!("not found in {}", searched.join(", "))
            },
        })
    }
}

/// A discoverable base
#[derive(Debug, Clone)]
pub struct AvailableBase {
    pub reference: BaseRef,
    pub source: BaseSource,
}

/// List bases available from directories, deduplicated in resolution order
pub async fn list_available_bases(
    project_dir: Option<&Path>,
    search_dirs: &[PathBuf],
) -> Vec<AvailableBase> {
    let mut seen = std::collections::HashSet::new();
    let mut bases = Vec::new();

    let mut roots: Vec<(PathBuf, BaseSource)> = Vec::new();
    if let Some(project) = project_dir {
        roots.push((bases_dir(project), BaseSource::ProjectLocal));
    }
    roots.extend(search_dirs.iter().map(|d| (d.clone(), BaseSource::Directory)));

    for (root, source) in roots {
        for (name, tag) in scan_bases_dir(&root).await {
            let Ok(reference) = BaseRef::parse(&format!("{}:{}", name, tag)) else {
                continue;
            };
            if seen.insert(reference.clone()) {
                bases.push(AvailableBase {
                    reference,
                    source: source.clone(),
                });
            }
        }
    }

    bases
}

/// `(name, tag)` pairs of `{root}/{name}/{tag}/` directories
async fn scan_bases_dir(root: &Path) -> Vec<(String, String)> {
    let mut found = Vec::new();
    let Ok(mut names) = tokio::fs::read_dir(root).await else {
        return found;
    };
    while let Ok(Some(name)) = names.next_entry().await {
        if !name.path().is_dir() {
            continue;
        }
        let Ok(mut tags) = tokio::fs::read_dir(name.path()).await else {
            continue;
        };
        while let Ok(Some(tag)) = tags.next_entry().await {
            if tag.path().is_dir() {
                found.push((
                    name.file_name().to_string_lossy().into_owned(),
                    tag.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
    }
    found.sort();
    found
}

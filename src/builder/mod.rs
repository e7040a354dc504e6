//! Layer builder
//!
//! Executes a build descriptor one instruction at a time against a growing
//! layer chain. Layer-producing steps consult the injected cache under a key
//! made of the parent layer id, the instruction text and an input digest:
//!
//! | Instruction | Input digest |
//! |---|---|
//! | `FROM` | base snapshot content |
//! | `COPY` | selected context files |
//! | `RUN` | parent filesystem view plus build environment |
//!
//! Because every key includes the parent id, a miss early in the descriptor
//! turns every later step into a miss as well. `WORKDIR` and `CMD` only
//! update metadata. Any failure aborts the build; a failed step never
//! reaches the cache.

mod executor;

pub use executor::COMMAND_NOT_FOUND;

use crate::base::BaseProvider;
use crate::cache::{CacheKey, LayerCache};
use crate::context::BuildContext;
use crate::descriptor::{BuildDescriptor, Instruction};
use crate::digest::DigestBuilder;
use crate::error::{StrataError, StrataResult};
use crate::image::{assemble, Image, ImageConfig};
use crate::layer::{Layer, LayerChain, LayerDelta, LayerId};
use crate::paths;
use crate::sandbox::Isolation;
use executor::RunRequest;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Progress notifications emitted during a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    StepStarted {
        /// 1-based instruction index
        index: usize,
        total: usize,
        instruction: String,
    },
    StepFinished {
        index: usize,
        status: StepStatus,
        layer: Option<LayerId>,
    },
    /// One line of RUN output
    Output(String),
}

/// How a step was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Base snapshot resolved
    Base,
    /// Metadata only, no layer
    Metadata,
    /// Layer reused from the cache
    CacheHit,
    /// Layer produced by executing the step
    Built,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "BASE"),
            Self::Metadata => write!(f, "META"),
            Self::CacheHit => write!(f, "CACHED"),
            Self::Built => write!(f, "RUN"),
        }
    }
}

/// Per-step result of a successful build
#[derive(Debug, Clone)]
pub struct StepReport {
    pub index: usize,
    pub instruction: String,
    pub status: StepStatus,
    pub layer: Option<LayerId>,
}

/// A finished build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image: Image,
    pub steps: Vec<StepReport>,
}

impl BuildOutcome {
    /// Number of steps served from the cache
    pub fn cache_hits(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::CacheHit)
            .count()
    }

    /// Number of steps that had to be executed
    pub fn built(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Built)
            .count()
    }
}

/// Mutable state of one build
struct BuildState {
    chain: LayerChain,
    working_dir: String,
    default_command: Option<Vec<String>>,
}

impl BuildState {
    fn new() -> Self {
        Self {
            chain: LayerChain::new(),
            working_dir: "/".to_string(),
            default_command: None,
        }
    }

    fn parent(&self) -> Option<LayerId> {
        self.chain.top_id().cloned()
    }
}

/// Runs build descriptors
pub struct Builder {
    bases: Arc<dyn BaseProvider>,
    cache: Option<Arc<dyn LayerCache>>,
    isolation: Isolation,
    env: BTreeMap<String, String>,
    work_dir: PathBuf,
}

impl Builder {
    /// Builder without a cache; every step executes
    pub fn new(bases: Arc<dyn BaseProvider>) -> Self {
        Self {
            bases,
            cache: None,
            isolation: Isolation::None,
            env: BTreeMap::new(),
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn LayerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Environment set for RUN steps; part of their cache key
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Directory that holds scratch roots of RUN steps
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn cache(&self) -> Option<&Arc<dyn LayerCache>> {
        self.cache.as_ref()
    }

    /// Build `descriptor` against the context directory
    pub async fn build(
        &self,
        descriptor: &BuildDescriptor,
        context_dir: &Path,
    ) -> StrataResult<BuildOutcome> {
        self.build_with_progress(descriptor, context_dir, &|_| {})
            .await
    }

    /// Build with progress notifications
    pub async fn build_with_progress(
        &self,
        descriptor: &BuildDescriptor,
        context_dir: &Path,
        on_event: &(dyn Fn(BuildEvent) + Send + Sync),
    ) -> StrataResult<BuildOutcome> {
        let root = context_dir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || BuildContext::capture(&root))
            .await
            .map_err(|e| StrataError::Internal(format!("context capture task failed: {}", e)))??;
        self.build_context(descriptor, &context, on_event).await
    }

    /// Build against an already captured context
    pub async fn build_context(
        &self,
        descriptor: &BuildDescriptor,
        context: &BuildContext,
        on_event: &(dyn Fn(BuildEvent) + Send + Sync),
    ) -> StrataResult<BuildOutcome> {
        let total = descriptor.len();
        let mut state = BuildState::new();
        let mut steps = Vec::with_capacity(total);

        for (idx, instruction) in descriptor.instructions().iter().enumerate() {
            let index = idx + 1;
            let text = instruction.to_string();
            on_event(BuildEvent::StepStarted {
                index,
                total,
                instruction: text.clone(),
            });

            let (status, layer) = self
                .execute(&mut state, instruction, context, on_event)
                .await
                .map_err(|e| e.at_step(index, &text))?;
            debug!("Step {}/{} {}: {}", index, total, status, text);

            on_event(BuildEvent::StepFinished {
                index,
                status,
                layer: layer.clone(),
            });
            steps.push(StepReport {
                index,
                instruction: text,
                status,
                layer,
            });
        }

        let config = ImageConfig {
            working_dir: state.working_dir,
            default_command: state.default_command,
        };
        let image = assemble(state.chain, config)?;
        info!(
            "Built image {} ({} layers, {} cached steps)",
            image.id.short(),
            image.chain.len(),
            steps.iter().filter(|s| s.status == StepStatus::CacheHit).count()
        );
        Ok(BuildOutcome { image, steps })
    }

    async fn execute(
        &self,
        state: &mut BuildState,
        instruction: &Instruction,
        context: &BuildContext,
        on_event: &(dyn Fn(BuildEvent) + Send + Sync),
    ) -> StrataResult<(StepStatus, Option<LayerId>)> {
        match instruction {
            Instruction::SetBase(reference) => {
                let snapshot = self.bases.resolve(reference).await?;
                debug!(
                    "Resolved base {} from {} ({})",
                    reference,
                    snapshot.source,
                    snapshot.digest.short()
                );
                let layer = Arc::new(snapshot.into_layer());
                let id = layer.id.clone();
                state.chain.push(layer)?;
                Ok((StepStatus::Base, Some(id)))
            }
            Instruction::SetWorkingDirectory(path) => {
                state.working_dir = paths::resolve(&state.working_dir, path)?;
                Ok((StepStatus::Metadata, None))
            }
            Instruction::SetDefaultCommand(argv) => {
                state.default_command = Some(argv.clone());
                Ok((StepStatus::Metadata, None))
            }
            Instruction::CopySubset { sources, dest } => {
                let selection = context.select(sources)?;
                let dest = paths::resolve(&state.working_dir, dest)?;
                let key = CacheKey::new(
                    state.parent(),
                    format!("COPY {} {}", serde_json::to_string(sources)?, dest),
                    selection.digest.clone(),
                );
                if let Some(hit) = self.lookup(state, &key)? {
                    return Ok(hit);
                }

                let delta = selection.to_delta().rebase(paths::relative(&dest));
                debug!("Copying {} files to {}", selection.len(), dest);
                self.commit(state, &key, delta)
            }
            Instruction::RunCommand(argv) => {
                let view = state.chain.view();
                let view_digest = tokio::task::spawn_blocking(move || view.digest())
                    .await
                    .map_err(|e| StrataError::Internal(format!("digest task failed: {}", e)))?;
                let mut input = DigestBuilder::new();
                input.str_field(view_digest.as_str());
                for (name, value) in &self.env {
                    input.str_field(name).str_field(value);
                }
                let key = CacheKey::new(
                    state.parent(),
                    format!(
                        "RUN {} in {}",
                        serde_json::to_string(argv)?,
                        state.working_dir
                    ),
                    input.finish(),
                );
                if let Some(hit) = self.lookup(state, &key)? {
                    return Ok(hit);
                }

                let request = RunRequest {
                    argv,
                    working_dir: &state.working_dir,
                    env: &self.env,
                    isolation: self.isolation,
                    work_dir: &self.work_dir,
                };
                let forward = |line: String| on_event(BuildEvent::Output(line));
                let delta = executor::run(&state.chain, request, &forward).await?;
                self.commit(state, &key, delta)
            }
        }
    }

    fn lookup(
        &self,
        state: &mut BuildState,
        key: &CacheKey,
    ) -> StrataResult<Option<(StepStatus, Option<LayerId>)>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        match cache.lookup(key)? {
            Some(layer) => {
                debug!("Cache hit {} for {}", layer.id.short(), key.instruction);
                let id = layer.id.clone();
                state.chain.push(layer)?;
                Ok(Some((StepStatus::CacheHit, Some(id))))
            }
            None => {
                debug!("Cache miss {} for {}", key.fingerprint().short(), key.instruction);
                Ok(None)
            }
        }
    }

    fn commit(
        &self,
        state: &mut BuildState,
        key: &CacheKey,
        delta: LayerDelta,
    ) -> StrataResult<(StepStatus, Option<LayerId>)> {
        let mut layer = Arc::new(Layer::new(
            key.parent.clone(),
            key.instruction.clone(),
            key.input.clone(),
            delta,
        ));
        info!(
            "Created layer {} ({} entries) for {}",
            layer.id.short(),
            layer.delta.len(),
            layer.created_by
        );
        if let Some(cache) = &self.cache {
            layer = cache.publish(key, layer)?;
        }
        let id = layer.id.clone();
        state.chain.push(layer)?;
        Ok((StepStatus::Built, Some(id)))
    }
}

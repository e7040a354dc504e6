//! Error types for strata
//!
//! All modules use `StrataResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Max number of output lines kept on a failed build command.
const COMMAND_OUTPUT_TAIL_LINES: usize = 50;

/// All errors that can occur in strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Descriptor errors
    #[error("Stratafile line {line}: {reason}")]
    DescriptorParse { line: usize, reason: String },

    #[error("Stratafile line {line}: unknown instruction '{keyword}'")]
    UnknownInstruction { line: usize, keyword: String },

    #[error("Invalid build descriptor: {0}")]
    DescriptorInvalid(String),

    // Build errors
    #[error("Build context error for '{path}': {reason}")]
    ContextRead { path: String, reason: String },

    #[error("Cannot resolve base snapshot '{reference}': {reason}")]
    BaseResolution { reference: String, reason: String },

    #[error("Command `{command}` exited with code {code}")]
    CommandExecution {
        command: String,
        code: i32,
        output: String,
    },

    #[error("Step {step} ({instruction}) failed: {source}")]
    BuildStep {
        step: usize,
        instruction: String,
        #[source]
        source: Box<StrataError>,
    },

    // Layer and cache errors
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Corrupt layer {id}: {reason}")]
    LayerCorrupt { id: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    // Image errors
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Ambiguous image reference '{reference}' matches {count} images")]
    ImageAmbiguous { reference: String, count: usize },

    #[error("Cannot assemble image: {0}")]
    ImageAssembly(String),

    // Launch errors
    #[error("Launch failed for image {image}: {reason}")]
    Launch { image: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: String, reason: String },

    // Process errors
    #[error("Command failed to start: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a build context read error
    pub fn context_read(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContextRead {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a launch error
    pub fn launch(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Launch {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Create a command execution error, keeping only the tail of the output
    pub fn command_exec(command: impl Into<String>, code: i32, output: &[String]) -> Self {
        let start = output.len().saturating_sub(COMMAND_OUTPUT_TAIL_LINES);
        Self::CommandExecution {
            command: command.into(),
            code,
            output: output[start..].join("\n"),
        }
    }

    /// Wrap an error with the failing build step
    pub fn at_step(self, step: usize, instruction: impl Into<String>) -> Self {
        Self::BuildStep {
            step,
            instruction: instruction.into(),
            source: Box::new(self),
        }
    }

    /// The underlying error, with any build-step wrapper removed
    pub fn cause(&self) -> &StrataError {
        match self {
            Self::BuildStep { source, .. } => source.cause(),
            other => other,
        }
    }

    /// The 1-based instruction index a build failed at, if any
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            Self::BuildStep { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Captured output of a failed build command
    pub fn captured_output(&self) -> Option<&str> {
        match self.cause() {
            Self::CommandExecution { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.cause() {
            Self::UnknownInstruction { .. } => {
                Some("Supported instructions: FROM, WORKDIR, COPY, RUN, CMD")
            }
            Self::BaseResolution { .. } => {
                Some("Place the base filesystem under .strata/bases/<name>/<tag>/ or build and tag it first")
            }
            Self::ContextRead { .. } => Some("Check the COPY sources and .strataignore"),
            Self::Launch { .. } => Some("Override the command with: strata run IMAGE -- <command>"),
            Self::ImageNotFound(_) => Some("List images with: strata images"),
            _ => None,
        }
    }
}

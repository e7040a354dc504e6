//! Build descriptors
//!
//! A descriptor is the ordered instruction list of one build. It is usually
//! parsed from a `Stratafile` but can be built directly from instructions.

mod parser;

use crate::base::BaseRef;
use crate::error::{StrataError, StrataResult};
use std::fmt;
use std::path::Path;

/// Default descriptor file name inside a build context
pub const DEFAULT_DESCRIPTOR: &str = "Stratafile";

/// Shell used for shell-form RUN and CMD
pub const SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// One build instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM name[:tag]`
    SetBase(BaseRef),
    /// `WORKDIR path`
    SetWorkingDirectory(String),
    /// `COPY src... dest`
    CopySubset { sources: Vec<String>, dest: String },
    /// `RUN ...`
    RunCommand(Vec<String>),
    /// `CMD ...`
    SetDefaultCommand(Vec<String>),
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::SetBase(_) => "FROM",
            Self::SetWorkingDirectory(_) => "WORKDIR",
            Self::CopySubset { .. } => "COPY",
            Self::RunCommand(_) => "RUN",
            Self::SetDefaultCommand(_) => "CMD",
        }
    }

    /// Whether executing the instruction adds a filesystem layer
    pub fn produces_layer(&self) -> bool {
        matches!(
            self,
            Self::SetBase(_) | Self::CopySubset { .. } | Self::RunCommand(_)
        )
    }

    /// Shell-form text if `argv` is `/bin/sh -c <text>`
    fn shell_text(argv: &[String]) -> Option<&str> {
        match argv {
            [sh, flag, text] if sh == SHELL[0] && flag == SHELL[1] => Some(text.as_str()),
            _ => None,
        }
    }
}

fn write_argv(f: &mut fmt::Formatter<'_>, argv: &[String]) -> fmt::Result {
    match Instruction::shell_text(argv) {
        Some(text) => f.write_str(text),
        None => {
            let json = serde_json::to_string(argv).map_err(|_| fmt::Error)?;
            f.write_str(&json)
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.keyword())?;
        match self {
            Self::SetBase(reference) => write!(f, "{}", reference),
            Self::SetWorkingDirectory(path) => f.write_str(path),
            Self::CopySubset { sources, dest } => write!(f, "{} {}", sources.join(" "), dest),
            Self::RunCommand(argv) | Self::SetDefaultCommand(argv) => write_argv(f, argv),
        }
    }
}

/// Validated, ordered instruction list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDescriptor {
    instructions: Vec<Instruction>,
}

impl BuildDescriptor {
    /// Validate an instruction list: non-empty, exactly one `FROM`, first.
    pub fn new(instructions: Vec<Instruction>) -> StrataResult<Self> {
        match instructions.first() {
            None => {
                return Err(StrataError::DescriptorInvalid(
                    "descriptor contains no instructions".to_string(),
                ))
            }
            Some(Instruction::SetBase(_)) => {}
            Some(other) => {
                return Err(StrataError::DescriptorInvalid(format!(
                    "first instruction must be FROM, found {}",
                    other.keyword()
                )))
            }
        }
        if instructions[1..]
            .iter()
            .any(|i| matches!(i, Instruction::SetBase(_)))
        {
            return Err(StrataError::DescriptorInvalid(
                "only one FROM is allowed".to_string(),
            ));
        }
        for instruction in &instructions {
            if let Instruction::RunCommand(argv) | Instruction::SetDefaultCommand(argv) =
                instruction
            {
                if argv.is_empty() {
                    return Err(StrataError::DescriptorInvalid(format!(
                        "{} needs a command",
                        instruction.keyword()
                    )));
                }
            }
            if let Instruction::CopySubset { sources, dest } = instruction {
                if sources.is_empty() || dest.is_empty() {
                    return Err(StrataError::DescriptorInvalid(
                        "COPY needs at least one source and a destination".to_string(),
                    ));
                }
            }
        }
        Ok(Self { instructions })
    }

    /// Parse descriptor text
    pub fn parse(content: &str) -> StrataResult<Self> {
        Self::new(parser::parse(content)?)
    }

    /// Read and parse a descriptor file
    pub async fn from_file(path: &Path) -> StrataResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::PathNotFound(path.to_path_buf())
            } else {
                StrataError::io(format!("reading {}", path.display()), e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Base reference of the first instruction
    pub fn base(&self) -> Option<&BaseRef> {
        match self.instructions.first() {
            Some(Instruction::SetBase(reference)) => Some(reference),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> Instruction {
        Instruction::SetBase(BaseRef::parse("base:v1").unwrap())
    }

    #[test]
    fn first_must_be_from() {
        let err = BuildDescriptor::new(vec![Instruction::SetWorkingDirectory("/app".into())])
            .unwrap_err();
        assert!(matches!(err, StrataError::DescriptorInvalid(_)));
    }

    #[test]
    fn second_from_rejected() {
        assert!(BuildDescriptor::new(vec![from(), from()]).is_err());
    }

    #[test]
    fn empty_rejected() {
        assert!(BuildDescriptor::new(Vec::new()).is_err());
    }

    #[test]
    fn display_uses_shell_text() {
        let run = Instruction::RunCommand(vec![
            "/bin/sh".into(),
            "-c".into(),
            "make install".into(),
        ]);
        assert_eq!(run.to_string(), "RUN make install");

        let cmd = Instruction::SetDefaultCommand(vec!["run-entry".into(), "--port".into()]);
        assert_eq!(cmd.to_string(), r#"CMD ["run-entry","--port"]"#);

        let copy = Instruction::CopySubset {
            sources: vec!["manifest".into()],
            dest: ".".into(),
        };
        assert_eq!(copy.to_string(), "COPY manifest .");
    }

    #[test]
    fn layer_producing_instructions() {
        assert!(from().produces_layer());
        assert!(!Instruction::SetWorkingDirectory("/".into()).produces_layer());
        assert!(!Instruction::SetDefaultCommand(vec!["x".into()]).produces_layer());
    }
}

//! Interactive vs plain output detection

use std::io::IsTerminal;

/// Setting this forces plain output even on a terminal
pub const PLAIN_ENV: &str = "STRATA_PLAIN";

/// Variables whose presence marks a CI run
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// Decides between framed cliclack output and plain lines
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
    /// Approve prompts without asking (`--yes`)
    auto_yes: bool,
}

impl UiContext {
    /// Inspect the terminal and environment of this process
    pub fn detect() -> Self {
        let terminal = std::io::stdout().is_terminal() && std::io::stdin().is_terminal();
        Self {
            interactive: terminal && !plain_requested(|name| std::env::var_os(name).is_some()),
            auto_yes: false,
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Spinners, progress bars and cliclack framing
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}

/// Whether the environment asks for plain output
fn plain_requested(is_set: impl Fn(&str) -> bool) -> bool {
    is_set(PLAIN_ENV) || CI_VARS.iter().any(|var| is_set(var))
}

//! UI module for consistent, modern CLI experience
//!
//! Uses `cliclack` (Rust port of @clack/prompts) for interactive prompts
//! with automatic fallback to plain output in CI/non-interactive environments.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//!
//! ui::intro(&ctx, "Layer cache");
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Pruning cache...");
//! // ... do work ...
//! spinner.stop("Removed 3 entries");
//!
//! let yes = ui::confirm(&ctx, "Clear the layer cache?", false).await?;
//!
//! ui::step_ok(&ctx, "Cache cleared");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::{UiContext, PLAIN_ENV};
pub use output::{
    intro, remark, step_error_detail, step_info, step_ok, step_ok_detail, step_warn,
    step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub(crate) use progress::truncate;
pub use prompts::confirm;
pub use theme::{init_theme, StrataTheme};

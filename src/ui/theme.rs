//! Custom theme for cliclack prompts

use cliclack::ThemeState;
use console::Style;

/// strata's theme: blue while active, green once submitted
#[derive(Debug, Clone, Default)]
pub struct StrataTheme;

impl cliclack::Theme for StrataTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => Style::new().blue(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel | ThemeState::Submit => Style::new().dim(),
        }
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => Style::new().blue().bold(),
            ThemeState::Error(_) => Style::new().red().bold(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Style::new().green(),
        }
    }
}

/// Initialize the global theme
pub fn init_theme() {
    cliclack::set_theme(StrataTheme);
}

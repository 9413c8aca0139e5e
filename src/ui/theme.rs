//! Kiln's palette
//!
//! Colors and marks for build states, shared by the cliclack theme, step
//! lines and the per-build progress bars. Marks have a symbol for terminals
//! and a bracketed tag for CI logs, where symbols are easy to miss.

use cliclack::ThemeState;
use console::{Style, StyledObject};

/// 256-color index of the brand orange
const EMBER: u8 = 208;

/// Banners, spinners and the active prompt bar
pub fn brand() -> Style {
    Style::new().color256(EMBER)
}

/// The `[verb]` prefix of a step line
pub fn verb() -> Style {
    Style::new().cyan().bold()
}

/// Outcome of a step or a whole build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Replayed from the cache; no container ran
    Cached,
    Done,
    Failed,
}

impl Mark {
    pub fn style(self) -> Style {
        match self {
            Mark::Cached => Style::new().dim(),
            Mark::Done => Style::new().green(),
            Mark::Failed => Style::new().red(),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Mark::Cached => "↺",
            Mark::Done => "✓",
            Mark::Failed => "✗",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Mark::Cached => "[CACHED]",
            Mark::Done => "[OK]",
            Mark::Failed => "[FAIL]",
        }
    }

    /// The styled symbol on a terminal, the styled tag otherwise
    pub fn render(self, fancy: bool) -> StyledObject<&'static str> {
        let text = if fancy { self.symbol() } else { self.tag() };
        self.style().apply_to(text)
    }
}

/// Prompt theme: ember while working, green when done
#[derive(Debug, Clone, Default)]
pub struct KilnTheme;

impl cliclack::Theme for KilnTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => brand(),
            ThemeState::Error(_) => Mark::Failed.style(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => brand().dim(),
        }
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => brand(),
            ThemeState::Error(_) => Mark::Failed.style(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Mark::Done.style(),
        }
    }
}

/// Install the theme for every cliclack call
pub fn init_theme() {
    cliclack::set_theme(KilnTheme);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliclack::Theme;

    #[test]
    fn ci_output_uses_plain_tags() {
        let plain = |mark: Mark| mark.render(false).force_styling(false).to_string();
        assert_eq!(plain(Mark::Cached), "[CACHED]");
        assert_eq!(plain(Mark::Done), "[OK]");
        assert_eq!(plain(Mark::Failed), "[FAIL]");
        assert_eq!(Mark::Done.render(true).force_styling(false).to_string(), "✓");
    }

    #[test]
    fn prompt_states_follow_build_marks() {
        let theme = KilnTheme;
        assert_eq!(theme.state_symbol_color(&ThemeState::Submit), Mark::Done.style());
        assert_eq!(
            theme.bar_color(&ThemeState::Error("boom".to_string())),
            Mark::Failed.style()
        );
        assert_ne!(
            theme.bar_color(&ThemeState::Active),
            theme.bar_color(&ThemeState::Submit)
        );
    }
}

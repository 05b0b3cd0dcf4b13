//! Terminal styling shared by the text formatters.

use crate::action::{Action, ActionKind};
use owo_colors::OwoColorize;

/// Whether text output may carry ANSI colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Style {
    pub color: bool,
}

impl Style {
    pub fn plain() -> Self {
        Self { color: false }
    }

    pub fn colored() -> Self {
        Self { color: true }
    }

    pub fn heading(&self, title: &str) -> String {
        if self.color {
            format!("{}", title.bold().underline())
        } else {
            title.to_string()
        }
    }

    pub fn ok(&self, text: &str) -> String {
        if self.color {
            format!("{}", text.green())
        } else {
            text.to_string()
        }
    }

    pub fn warning(&self, text: &str) -> String {
        if self.color {
            format!("{}", text.yellow())
        } else {
            text.to_string()
        }
    }

    /// One action line, colored by what it does to the host.
    pub fn action(&self, action: &Action) -> String {
        if !self.color {
            return action.to_string();
        }
        let line = action.to_string();
        if action.kind.is_destructive() {
            format!("{}", line.red())
        } else if action.kind == ActionKind::SetConfig {
            format!("{}", line.yellow())
        } else {
            format!("{}", line.green())
        }
    }
}

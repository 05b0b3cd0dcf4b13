//! Actions: units of change produced by the diff engine and applied by the executor.

use crate::subsystem::Subsystem;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed setting value as it appears in a descriptor or on the host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl SettingValue {
    /// Flat string form used for command templates and env files.
    pub fn render(&self) -> String {
        match self {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Integer(i) => i.to_string(),
            SettingValue::Text(s) => s.clone(),
            SettingValue::List(items) => items.join(" "),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Text(s) => write!(f, "{:?}", s),
            SettingValue::List(items) => write!(f, "[{}]", items.join(", ")),
            other => f.write_str(&other.render()),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(value: Vec<String>) -> Self {
        SettingValue::List(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Install,
    Remove,
    EnableService,
    DisableService,
    SetConfig,
    WriteFile,
    RemoveFile,
    SetEnv,
    UnsetEnv,
    CreateUser,
    RemoveUser,
    AddToGroup,
    RemoveFromGroup,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Install => "install",
            ActionKind::Remove => "remove",
            ActionKind::EnableService => "enable-service",
            ActionKind::DisableService => "disable-service",
            ActionKind::SetConfig => "set-config",
            ActionKind::WriteFile => "write-file",
            ActionKind::RemoveFile => "remove-file",
            ActionKind::SetEnv => "set-env",
            ActionKind::UnsetEnv => "unset-env",
            ActionKind::CreateUser => "create-user",
            ActionKind::RemoveUser => "remove-user",
            ActionKind::AddToGroup => "add-to-group",
            ActionKind::RemoveFromGroup => "remove-from-group",
        }
    }

    /// Whether the action takes something away from the host.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            ActionKind::Remove
                | ActionKind::DisableService
                | ActionKind::RemoveFile
                | ActionKind::UnsetEnv
                | ActionKind::RemoveUser
                | ActionKind::RemoveFromGroup
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of change.
///
/// `target` identifies what is touched: a package or service name, a dotted
/// setting key such as `ollama.host` or `boot.kernel_params`, a file path, an
/// environment variable name, or `user:group` for memberships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: String,
    pub subsystem: Subsystem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<SettingValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<SettingValue>,
}

impl Action {
    pub fn new(kind: ActionKind, subsystem: Subsystem, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            subsystem,
            before: None,
            after: None,
        }
    }

    pub fn with_before(mut self, before: Option<SettingValue>) -> Self {
        self.before = before;
        self
    }

    pub fn with_after(mut self, after: Option<SettingValue>) -> Self {
        self.after = after;
        self
    }

    /// Split a `user:group` membership target.
    pub fn membership(&self) -> Option<(&str, &str)> {
        match self.kind {
            ActionKind::AddToGroup | ActionKind::RemoveFromGroup => self.target.split_once(':'),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.target)?;
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => write!(f, " ({} -> {})", before, after),
            (None, Some(after)) => write!(f, " (-> {})", after),
            (Some(before), None) => write!(f, " ({} ->)", before),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        let action = Action::new(ActionKind::SetConfig, Subsystem::Services, "ollama.host")
            .with_after(Some("0.0.0.0".into()));
        assert_eq!(action.to_string(), "set-config ollama.host (-> \"0.0.0.0\")");
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ActionKind::EnableService).unwrap();
        assert_eq!(json, "\"enable-service\"");
    }

    #[test]
    fn test_setting_value_untagged() {
        let value: SettingValue = serde_json::from_str("11434").unwrap();
        assert_eq!(value, SettingValue::Integer(11434));
        let value: SettingValue = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(value.render(), "a b");
    }

    #[test]
    fn test_membership_split() {
        let action = Action::new(ActionKind::AddToGroup, Subsystem::Users, "alice:docker");
        assert_eq!(action.membership(), Some(("alice", "docker")));
    }
}

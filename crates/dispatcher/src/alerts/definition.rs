use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(Error::Validation(format!("Invalid severity: {}", other))),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(s)
    }
}

/// A remediation registered for one alert name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertDefinition {
    pub name: String,
    /// Path of the external action, resolved by the executor at run time.
    pub action_ref: String,
    pub severity: Severity,
    pub description: String,
}

impl AlertDefinition {
    pub fn new(
        name: impl Into<String>,
        action_ref: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            action_ref: action_ref.into(),
            severity,
            description: description.into(),
        }
    }
}

/// One entry of the YAML override file. Every field except `name` is
/// required so an override always replaces the whole definition.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct OverrideEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "playbook", alias = "action")]
    pub action_ref: String,
    pub severity: Severity,
    pub description: String,
}

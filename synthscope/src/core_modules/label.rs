use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The two classes the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Camera-captured.
    Real,
    /// Rendered, generated or manipulated.
    Synthetic,
}

impl Label {
    pub const ALL: [Label; 2] = [Label::Real, Label::Synthetic];

    /// Class index used by classifiers (`real = 0`, `synthetic = 1`).
    pub fn index(self) -> usize {
        match self {
            Label::Real => 0,
            Label::Synthetic => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Label::Real),
            1 => Some(Label::Synthetic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Real => "real",
            Label::Synthetic => "synthetic",
        }
    }

    /// Maps a dataset directory name onto a label, case-insensitively.
    /// Accepts the names used by common real/fake dataset layouts.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "real" => Some(Label::Real),
            "synthetic" | "fake" | "cgi" => Some(Label::Synthetic),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::from_dir_name(s.trim()).ok_or_else(|| Error::Config(format!("unknown label `{s}`")))
    }
}

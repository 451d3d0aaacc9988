//! Include/exclude file selectors.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::{DataSpaceError, SpaceKind};
use crate::variables::VariableTable;

/// Direction and space of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    TransferFromInputSpace,
    TransferFromOutputSpace,
    TransferFromGlobalSpace,
    TransferFromUserSpace,
    TransferToOutputSpace,
    TransferToGlobalSpace,
    TransferToUserSpace,
    None,
}

impl TransferMode {
    /// Remote space this mode reads from or writes to.
    pub fn space(&self) -> Option<SpaceKind> {
        match self {
            TransferMode::TransferFromInputSpace => Some(SpaceKind::Input),
            TransferMode::TransferFromOutputSpace | TransferMode::TransferToOutputSpace => {
                Some(SpaceKind::Output)
            }
            TransferMode::TransferFromGlobalSpace | TransferMode::TransferToGlobalSpace => {
                Some(SpaceKind::Global)
            }
            TransferMode::TransferFromUserSpace | TransferMode::TransferToUserSpace => {
                Some(SpaceKind::User)
            }
            TransferMode::None => None,
        }
    }

    pub fn is_stage_in(&self) -> bool {
        matches!(
            self,
            TransferMode::TransferFromInputSpace
                | TransferMode::TransferFromOutputSpace
                | TransferMode::TransferFromGlobalSpace
                | TransferMode::TransferFromUserSpace
        )
    }

    pub fn is_stage_out(&self) -> bool {
        matches!(
            self,
            TransferMode::TransferToOutputSpace
                | TransferMode::TransferToGlobalSpace
                | TransferMode::TransferToUserSpace
        )
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelector {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    pub mode: TransferMode,
}

impl FileSelector {
    pub fn new(mode: TransferMode, includes: &[&str]) -> Self {
        Self {
            includes: includes.iter().map(|s| s.to_string()).collect(),
            excludes: Vec::new(),
            case_sensitive: true,
            mode,
        }
    }

    pub fn excluding(mut self, excludes: &[&str]) -> Self {
        self.excludes = excludes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    /// Copy with variables and tags substituted into every pattern.
    pub fn substituted(&self, variables: &VariableTable) -> Self {
        Self {
            includes: variables.substitute_all(&self.includes),
            excludes: variables.substitute_all(&self.excludes),
            case_sensitive: self.case_sensitive,
            mode: self.mode,
        }
    }

    pub fn compile(&self) -> Result<CompiledSelector, DataSpaceError> {
        Ok(CompiledSelector {
            includes: compile_patterns(&self.includes)?,
            excludes: compile_patterns(&self.excludes)?,
            options: MatchOptions {
                case_sensitive: self.case_sensitive,
                require_literal_separator: true,
                require_literal_leading_dot: false,
            },
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, DataSpaceError> {
    patterns
        .iter()
        .map(|p| {
            let trimmed = p.trim().trim_start_matches("./");
            Pattern::new(trimmed).map_err(|e| DataSpaceError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Selector ready for matching `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
    options: MatchOptions,
}

impl CompiledSelector {
    /// A path matches when some include matches and no exclude does.
    /// `*` stays within one directory, `**` crosses directories.
    pub fn matches(&self, relative: &str) -> bool {
        self.includes
            .iter()
            .any(|p| p.matches_with(relative, self.options))
            && !self
                .excludes
                .iter()
                .any(|p| p.matches_with(relative, self.options))
    }
}

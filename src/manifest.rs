//! Dependency Manifest - ordered, read-once package list
//!
//! Parsing only. Resolution belongs to the package installer in the builder stage.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const OPERATORS: [&str; 8] = ["===", "==", "~=", "!=", ">=", "<=", ">", "<"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Dependency manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read dependency manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: installer options are not supported: {text}")]
    UnsupportedOption { line: usize, text: String },

    #[error("Line {line}: invalid requirement: {text}")]
    InvalidRequirement { line: usize, text: String },

    #[error("Line {line}: duplicate requirement {name} (first declared on line {first})")]
    Duplicate { line: usize, first: usize, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    #[serde(default)]
    pub extras: Vec<String>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub marker: Option<String>,
    pub line: usize,
}

impl Requirement {
    /// Name folded the way package indexes compare names.
    pub fn normalized_name(&self) -> String {
        normalize(&self.name)
    }

    /// Exactly one version is admissible.
    pub fn is_pinned(&self) -> bool {
        self.constraint
            .as_deref()
            .map_or(false, |c| (c.starts_with("==") || c.starts_with("===")) && !c.contains(',') && !c.contains('*'))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
}

impl DependencyManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.is_file() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut requirements: Vec<Requirement> = vec![];

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = strip_comment(raw).trim();
            if text.is_empty() {
                continue;
            }
            if text.starts_with('-') {
                return Err(ManifestError::UnsupportedOption { line, text: text.to_string() });
            }

            let requirement = parse_requirement(text, line)?;
            let normalized = requirement.normalized_name();
            if let Some(first) = requirements.iter().find(|r| r.normalized_name() == normalized) {
                return Err(ManifestError::Duplicate {
                    line,
                    first: first.line,
                    name: requirement.name,
                });
            }
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    // An inline comment needs whitespace before the `#`; `pkg#egg` is not one.
    let bytes = line.as_bytes();
    match (1..bytes.len()).find(|&i| bytes[i] == b'#' && bytes[i - 1].is_ascii_whitespace()) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace(['_', '.'], "-")
}

fn parse_requirement(text: &str, line: usize) -> Result<Requirement, ManifestError> {
    let invalid = || ManifestError::InvalidRequirement { line, text: text.to_string() };

    let (body, marker) = match text.split_once(';') {
        Some((body, marker)) => (body.trim(), Some(marker.trim().to_string())),
        None => (text, None),
    };

    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    let mut rest = body[name_end..].trim_start();
    let mut extras = vec![];
    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']').ok_or_else(invalid)?;
        extras = after[..close]
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let constraint = if rest.is_empty() {
        None
    } else {
        let valid = rest
            .split(',')
            .all(|clause| OPERATORS.iter().any(|op| clause.trim().starts_with(op)));
        if !valid {
            return Err(invalid());
        }
        Some(rest.split_whitespace().collect::<String>())
    };

    Ok(Requirement {
        name: name.to_string(),
        extras,
        constraint,
        marker,
        line,
    })
}

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};
use crate::version::VersionConstraint;

/// One declared dependency: a normalized package name plus its constraint.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub name: String,
    pub constraint: VersionConstraint,
    pub line: usize,
}

impl Requirement {
    /// Parse a single `name[extras] constraint` declaration.
    pub fn parse(text: &str, line: usize) -> BuildResult<Self> {
        let text = text.trim();
        if text.starts_with('-') {
            return Err(BuildError::Resolution(format!(
                "line {line}: package manager directive '{text}' is not supported in a manifest"
            )));
        }
        if text.contains(';') {
            return Err(BuildError::Resolution(format!(
                "line {line}: environment markers are not supported ('{text}')"
            )));
        }

        let name_end = text
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(text.len());
        let (name, mut rest) = text.split_at(name_end);
        if name.is_empty() {
            return Err(BuildError::Resolution(format!(
                "line {line}: expected a package name in '{text}'"
            )));
        }

        rest = rest.trim_start();
        if let Some(extras) = rest.strip_prefix('[') {
            let close = extras.find(']').ok_or_else(|| {
                BuildError::Resolution(format!("line {line}: unterminated extras in '{text}'"))
            })?;
            rest = extras[close + 1..].trim_start();
        }
        let rest = rest
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .unwrap_or(rest);

        let constraint: VersionConstraint = rest.parse().map_err(|err| {
            BuildError::Resolution(format!("line {line}: {err}"))
        })?;

        Ok(Self {
            name: normalize_name(name),
            constraint,
            line,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.constraint)
    }
}

/// Ordered, immutable list of declared dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyManifest {
    pub source: Option<PathBuf>,
    requirements: Vec<Requirement>,
}

impl DependencyManifest {
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            BuildError::io(format!("Failed to read manifest: {}", path.display()), err)
        })?;
        let mut manifest = Self::parse(&content)?;
        manifest.source = Some(path.to_path_buf());
        Ok(manifest)
    }

    pub fn parse(content: &str) -> BuildResult<Self> {
        let mut requirements = Vec::new();
        let mut seen = HashSet::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = strip_comment(raw).trim();
            if text.is_empty() {
                continue;
            }
            let requirement = Requirement::parse(text, line)?;
            if !seen.insert(requirement.name.clone()) {
                return Err(BuildError::Resolution(format!(
                    "line {line}: package '{}' is declared more than once",
                    requirement.name
                )));
            }
            requirements.push(requirement);
        }
        Ok(Self {
            source: None,
            requirements,
        })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements
            .iter()
            .filter(|req| !req.constraint.is_pinned())
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Canonical package name: lowercase with runs of `-`, `_` and `.` folded
/// into a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !normalized.is_empty() {
            normalized.push('-');
        }
        pending_separator = false;
        normalized.push(ch.to_ascii_lowercase());
    }
    normalized
}

//! Build Context - the input files the engine will read
//!
//! Checks the manifest and startup script exist before any engine work, and
//! fingerprints the source tree exactly as the runtime stage will copy it.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::hashing::sha256_hex;
use crate::manifest::{DependencyManifest, ManifestError, Requirement};
use crate::recipe::Recipe;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Build context is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Dependency manifest missing: {0}")]
    MissingManifest(PathBuf),

    #[error("Startup script missing: {0}")]
    MissingStartupScript(PathBuf),

    #[error("Invalid dependency manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("{0} is excluded from the build context")]
    Excluded(String),

    #[error("Invalid exclusion pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Failed to walk build context: {0}")]
    Walk(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Fingerprint of the application source tree as it will be copied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDigest {
    pub files: Vec<SourceFile>,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextReport {
    pub root: PathBuf,
    pub requirements: usize,
    pub unpinned: Vec<Requirement>,
    pub source: SourceDigest,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ContextError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self, recipe: &Recipe) -> Result<DependencyManifest, ContextError> {
        let path = self.root.join(&recipe.manifest_path);
        if !path.is_file() {
            return Err(ContextError::MissingManifest(path));
        }
        Ok(DependencyManifest::load(&path)?)
    }

    /// Everything the engine needs must be present and must survive the exclusion list.
    pub fn check(&self, recipe: &Recipe) -> Result<ContextReport, ContextError> {
        let manifest = self.manifest(recipe)?;

        let script = self.root.join(&recipe.entrypoint.script);
        if !script.is_file() {
            return Err(ContextError::MissingStartupScript(script));
        }

        let matcher = exclusion_matcher(&self.root, &recipe.exclude)?;
        for required in [&recipe.manifest_path, &recipe.entrypoint.script] {
            if matcher.matched_path_or_any_parents(Path::new(required), false).is_ignore() {
                return Err(ContextError::Excluded(required.clone()));
            }
        }

        let source = self.source_digest(recipe)?;
        let unpinned: Vec<Requirement> = manifest.unpinned().cloned().collect();
        if !unpinned.is_empty() {
            tracing::warn!(count = unpinned.len(), "dependency manifest has unpinned requirements");
        }

        Ok(ContextReport {
            root: self.root.clone(),
            requirements: manifest.len(),
            unpinned,
            source,
        })
    }

    /// Sorted file listing with content hashes, honoring the recipe's exclusions.
    pub fn source_digest(&self, recipe: &Recipe) -> Result<SourceDigest, ContextError> {
        let matcher = exclusion_matcher(&self.root, &recipe.exclude)?;
        let root = self.root.clone();

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
                match entry.path().strip_prefix(&root) {
                    Ok(rel) if rel.as_os_str().is_empty() => true,
                    Ok(rel) => !matcher.matched(rel, is_dir).is_ignore(),
                    Err(_) => false,
                }
            })
            .build();

        let mut files = vec![];
        for entry in walker {
            let entry = entry.map_err(|e| ContextError::Walk(e.to_string()))?;
            if !entry.file_type().map_or(false, |t| t.is_file()) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| ContextError::Walk(e.to_string()))?;
            let data = fs::read(entry.path())?;
            files.push(SourceFile {
                path: slash_path(rel),
                size: data.len() as u64,
                sha256: sha256_hex(&data),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut listing = String::new();
        for file in &files {
            listing.push_str(&file.path);
            listing.push('\0');
            listing.push_str(&file.sha256);
            listing.push('\n');
        }

        Ok(SourceDigest {
            digest: sha256_hex(listing.as_bytes()),
            files,
        })
    }
}

fn exclusion_matcher(root: &Path, patterns: &[String]) -> Result<Gitignore, ContextError> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| ContextError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
    }
    builder.build().map_err(|e| ContextError::InvalidPattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn app_tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        write(dir.path(), "requirements.txt", "Django==4.2.7\npillow\n");
        write(dir.path(), "start.sh", "#!/bin/sh\nexec gunicorn\n");
        write(dir.path(), "pages/views.py", "print('hi')\n");
        write(dir.path(), "pages/__pycache__/views.cpython-311.pyc", "bytecode");
        write(dir.path(), ".git/HEAD", "ref: refs/heads/main\n");
        dir
    }

    #[test]
    fn test_check_reports_manifest_and_digest() {
        let dir = app_tree();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let report = ctx.check(&Recipe::reference()).unwrap();

        assert_eq!(report.requirements, 2);
        assert_eq!(report.unpinned.len(), 1);
        assert_eq!(report.unpinned[0].name, "pillow");

        let paths: Vec<_> = report.source.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["pages/views.py", "requirements.txt", "start.sh"]);
    }

    #[test]
    fn test_nested_exclusions_match_rendered_ignore_file() {
        let dir = app_tree();
        write(dir.path(), "pages/migrations/__pycache__/0001.cpython-311.pyc", "bytecode");
        write(dir.path(), "pages/.env", "SECRET=1\n");
        let recipe = Recipe::reference();

        let digest = BuildContext::open(dir.path()).unwrap().source_digest(&recipe).unwrap();
        let paths: Vec<_> = digest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["pages/views.py", "requirements.txt", "start.sh"]);

        // The engine must drop the same nested files, so every unanchored
        // exclusion is rendered to match at any depth.
        let ignore = crate::render::render_dockerignore(&recipe);
        for line in ["**/__pycache__", "**/*.pyc", "**/.env", "**/.git"] {
            assert!(ignore.lines().any(|l| l == line), "missing {}", line);
        }
    }

    #[test]
    fn test_digest_stable_and_content_sensitive() {
        let dir = app_tree();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let recipe = Recipe::reference();

        let first = ctx.source_digest(&recipe).unwrap();
        let second = ctx.source_digest(&recipe).unwrap();
        assert_eq!(first, second);

        write(dir.path(), "pages/views.py", "print('changed')\n");
        let third = ctx.source_digest(&recipe).unwrap();
        assert_ne!(first.digest, third.digest);
    }

    #[test]
    fn test_missing_startup_script() {
        let dir = app_tree();
        fs::remove_file(dir.path().join("start.sh")).unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let err = ctx.check(&Recipe::reference()).unwrap_err();
        assert!(matches!(err, ContextError::MissingStartupScript(_)));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = app_tree();
        fs::remove_file(dir.path().join("requirements.txt")).unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let err = ctx.check(&Recipe::reference()).unwrap_err();
        assert!(matches!(err, ContextError::MissingManifest(_)));
    }

    #[test]
    fn test_excluding_startup_script_is_rejected() {
        let dir = app_tree();
        let mut recipe = Recipe::reference();
        recipe.exclude.push("*.sh".to_string());
        let ctx = BuildContext::open(dir.path()).unwrap();
        let err = ctx.check(&recipe).unwrap_err();
        assert!(matches!(err, ContextError::Excluded(ref p) if p == "start.sh"));
    }

    #[test]
    fn test_open_requires_directory() {
        let err = BuildContext::open("/nonexistent/context").unwrap_err();
        assert!(matches!(err, ContextError::NotADirectory(_)));
    }
}

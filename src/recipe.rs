//! Recipe System - Enforceable Build Contracts

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type RecipeId = String;

pub const BUILDER_STAGE: &str = "builder";

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON recipe {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid TOML recipe {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Duplicate recipe id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: RecipeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub recipe_version: String,
    pub engine_min_version: String,
    #[serde(default)]
    pub deprecated: bool,
    pub base_image: BaseImage,
    /// Overrides the runtime base. Must match `base_image` to pass validation.
    #[serde(default)]
    pub runtime_base: Option<BaseImage>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
    #[serde(default = "default_install_prefix")]
    pub install_prefix: String,
    #[serde(default = "default_library_path")]
    pub library_path: String,
    #[serde(default)]
    pub toolchain: Vec<String>,
    #[serde(default)]
    pub native_packages: Vec<NativePackage>,
    #[serde(default)]
    pub builder_env: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_env: BTreeMap<String, String>,
    pub account: Account,
    pub entrypoint: Entrypoint,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub validation: ValidationConfig,
}

fn default_true() -> bool { true }
fn default_workdir() -> String { "/app".to_string() }
fn default_manifest_path() -> String { "requirements.txt".to_string() }
fn default_install_prefix() -> String { "/install".to_string() }
fn default_library_path() -> String { "/usr/local".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl BaseImage {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self { name: name.into(), tag: tag.into(), digest: None }
    }

    /// Image reference as the build tool expects it.
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}:{}@{}", self.name, self.tag, digest),
            None => format!("{}:{}", self.name, self.tag),
        }
    }
}

/// A native dependency: the headers the builder compiles against and the
/// shared library the runtime loads. A pair without `runtime` is build-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NativePackage {
    pub dev: String,
    #[serde(default)]
    pub runtime: Option<String>,
}

impl NativePackage {
    pub fn paired(dev: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self { dev: dev.into(), runtime: Some(runtime.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub home: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String { "/bin/bash".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entrypoint {
    pub interpreter: String,
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default = "default_true")]
    pub warn_unpinned: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { failure_mode: FailureMode::Block, warn_unpinned: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Block,
    Warn,
    Log,
}

impl Recipe {
    /// The recipe for the PDF service image.
    pub fn reference() -> Self {
        let flags = [
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];
        let builder_env: BTreeMap<_, _> = flags.iter().cloned().collect();
        let mut runtime_env = builder_env.clone();
        runtime_env.insert(
            "DJANGO_SETTINGS_MODULE".to_string(),
            "pdfserviedeploy.settings".to_string(),
        );

        Self {
            id: "pdfservice".to_string(),
            name: "PDF Service".to_string(),
            description: "Django PDF/form service runtime image".to_string(),
            recipe_version: "1.0.0".to_string(),
            engine_min_version: crate::MIN_RECIPE_VERSION.to_string(),
            deprecated: false,
            base_image: BaseImage::new("python", "3.11-slim"),
            runtime_base: None,
            workdir: default_workdir(),
            manifest_path: default_manifest_path(),
            install_prefix: default_install_prefix(),
            library_path: default_library_path(),
            toolchain: vec!["build-essential".to_string()],
            native_packages: vec![
                NativePackage::paired("libpq-dev", "libpq5"),
                NativePackage::paired("libjpeg-dev", "libjpeg62-turbo"),
                NativePackage::paired("zlib1g-dev", "zlib1g"),
            ],
            builder_env,
            runtime_env,
            account: Account {
                name: "appuser".to_string(),
                home: "/home/appuser".to_string(),
                shell: default_shell(),
            },
            entrypoint: Entrypoint {
                interpreter: "sh".to_string(),
                script: "start.sh".to_string(),
            },
            exclude: vec![
                ".git".to_string(),
                "__pycache__".to_string(),
                "*.pyc".to_string(),
                ".env".to_string(),
            ],
            validation: ValidationConfig::default(),
        }
    }

    pub fn runtime_base(&self) -> &BaseImage {
        self.runtime_base.as_ref().unwrap_or(&self.base_image)
    }

    /// Toolchain plus every dev package, in declaration order.
    pub fn builder_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = vec![];
        let devs = self.native_packages.iter().map(|p| &p.dev);
        for pkg in self.toolchain.iter().chain(devs) {
            if !packages.contains(pkg) {
                packages.push(pkg.clone());
            }
        }
        packages
    }

    /// Runtime counterparts derived from the pairing table.
    pub fn runtime_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = vec![];
        for runtime in self.native_packages.iter().filter_map(|p| p.runtime.as_ref()) {
            if !packages.contains(runtime) {
                packages.push(runtime.clone());
            }
        }
        packages
    }

    /// Packages that exist only for compilation and must never ship.
    pub fn build_only_packages(&self) -> Vec<String> {
        self.builder_packages()
            .into_iter()
            .filter(|p| !self.runtime_packages().contains(p))
            .collect()
    }

    pub fn parse_json(path: &Path, content: &str) -> Result<Self, RecipeError> {
        serde_json::from_str(content).map_err(|source| RecipeError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse_toml(path: &Path, content: &str) -> Result<Self, RecipeError> {
        toml::from_str(content).map_err(|source| RecipeError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let content = fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::parse_toml(path, &content),
            _ => Self::parse_json(path, &content),
        }
    }
}

/// Recipe registry - loads and caches recipes
pub struct RecipeRegistry {
    recipes: HashMap<RecipeId, Recipe>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self { recipes: HashMap::new() }
    }

    /// Registry holding only the reference recipe.
    pub fn with_reference() -> Self {
        let mut registry = Self::new();
        registry.register(Recipe::reference());
        registry
    }

    /// Load every `*.json` and `*.toml` recipe in `dir`.
    ///
    /// A missing directory yields an empty registry; a malformed file is an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self, RecipeError> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }

        let entries = fs::read_dir(dir).map_err(|source| RecipeError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths = vec![];
        for entry in entries {
            let entry = entry.map_err(|source| RecipeError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            let is_recipe = path
                .extension()
                .map_or(false, |e| e == "json" || e == "toml");
            if !is_recipe {
                continue;
            }
            let recipe = Recipe::load(&path)?;
            if registry.recipes.contains_key(&recipe.id) {
                return Err(RecipeError::DuplicateId(recipe.id));
            }
            tracing::debug!(recipe = %recipe.id, path = %path.display(), "loaded recipe");
            registry.recipes.insert(recipe.id.clone(), recipe);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&Recipe> {
        self.recipes.get(id)
    }

    pub fn list(&self) -> Vec<&Recipe> {
        let mut recipes: Vec<_> = self.recipes.values().collect();
        recipes.sort_by(|a, b| a.id.cmp(&b.id));
        recipes
    }

    pub fn register(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.id.clone(), recipe);
    }
}

impl Default for RecipeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Build Engine Boundary
//!
//! The engine owns layering, caching and package resolution. This crate hands
//! it a rendered recipe and reads facts back from the result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use uuid::Uuid;

const STDERR_TAIL: usize = 40;
const STAT_NOT_FOUND: i32 = 1;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step '{step}' failed (exit {status:?}): {stderr}")]
    StepFailed {
        step: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Unexpected engine output for '{step}': {output}")]
    UnexpectedOutput { step: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub dockerfile: String,
    pub dockerignore: String,
    pub tag: String,
    /// Stop after this stage instead of building the final one.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub id: String,
    pub tag: String,
}

/// The external build engine. Every call is one fatal-on-failure step.
pub trait BuildEngine {
    fn name(&self) -> &str;

    fn build(&self, request: &BuildRequest) -> Result<BuiltImage, EngineError>;

    /// The user the image is configured to run as; empty means the default (root).
    fn configured_user(&self, image: &BuiltImage) -> Result<String, EngineError>;

    /// Regular files under `dir`, relative to it.
    fn list_files(&self, image: &BuiltImage, dir: &str) -> Result<Vec<String>, EngineError>;

    fn installed_packages(&self, image: &BuiltImage) -> Result<Vec<String>, EngineError>;

    /// Permission bits of `path`, or `None` if it does not exist.
    fn file_mode(&self, image: &BuiltImage, path: &str) -> Result<Option<u32>, EngineError>;

    fn tag(&self, image: &BuiltImage, tag: &str) -> Result<(), EngineError>;

    fn remove(&self, image: &BuiltImage) -> Result<(), EngineError>;
}

/// Everything read back from a finished build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageFacts {
    pub user: String,
    /// Install prefix contents as the builder stage left them.
    pub prefix_files: Vec<String>,
    /// Global library path contents in the runtime image.
    pub library_files: Vec<String>,
    pub installed_packages: Vec<String>,
    pub script_mode: Option<u32>,
}

impl ImageFacts {
    pub fn collect(
        engine: &dyn BuildEngine,
        builder: &BuiltImage,
        runtime: &BuiltImage,
        install_prefix: &str,
        library_path: &str,
        script_path: &str,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            user: engine.configured_user(runtime)?,
            prefix_files: engine.list_files(builder, install_prefix)?,
            library_files: engine.list_files(runtime, library_path)?,
            installed_packages: engine.installed_packages(runtime)?,
            script_mode: engine.file_mode(runtime, script_path)?,
        })
    }
}

/// Drives the `docker` CLI with BuildKit.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    program: String,
}

impl DockerEngine {
    pub fn new() -> Self {
        Self { program: "docker".to_string() }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, step: &str, args: &[String]) -> Result<String, EngineError> {
        tracing::debug!(engine = %self.program, step, ?args, "running engine step");
        let output = Command::new(&self.program)
            .args(args)
            .env("DOCKER_BUILDKIT", "1")
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EngineError::Spawn { program: self.program.clone(), source })?;
        check_status(step, output)
    }

    /// Runs `argv` inside `image` as a throwaway container.
    fn exec(&self, step: &str, image: &BuiltImage, argv: &[&str]) -> Result<String, EngineError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--network".into(),
            "none".into(),
            "--entrypoint".into(),
            argv[0].to_string(),
            image.id.clone(),
        ];
        args.extend(argv[1..].iter().map(|a| a.to_string()));
        self.run(step, &args)
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn check_status(step: &str, output: Output) -> Result<String, EngineError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<_> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
    Err(EngineError::StepFailed {
        step: step.to_string(),
        status: output.status.code(),
        stderr: tail,
    })
}

pub(crate) fn build_args(request: &BuildRequest, dockerfile: &Path) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--file".to_string(),
        dockerfile.display().to_string(),
        "--tag".to_string(),
        request.tag.clone(),
    ];
    if let Some(target) = &request.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }
    for (key, value) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(request.context.display().to_string());
    args
}

/// `stat` exits 1 for a missing path. `docker run` reserves 125-127 for its
/// own failures, which must not read as an absent file.
fn is_missing_file(err: &EngineError) -> bool {
    matches!(err, EngineError::StepFailed { status: Some(STAT_NOT_FOUND), .. })
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

impl BuildEngine for DockerEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn build(&self, request: &BuildRequest) -> Result<BuiltImage, EngineError> {
        // Dockerfile-specific ignore files sit next to the Dockerfile, so the
        // context directory itself is never written to.
        let scratch = std::env::temp_dir().join(format!("stagerecipe-{}", Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;
        let dockerfile = scratch.join("Dockerfile");
        fs::write(&dockerfile, &request.dockerfile)?;
        fs::write(scratch.join("Dockerfile.dockerignore"), &request.dockerignore)?;

        let result = self.run("build", &build_args(request, &dockerfile));
        if let Err(e) = fs::remove_dir_all(&scratch) {
            tracing::warn!(path = %scratch.display(), error = %e, "failed to remove scratch dir");
        }
        result?;

        let id = self.run(
            "inspect",
            &["image".into(), "inspect".into(), "--format".into(), "{{.Id}}".into(), request.tag.clone()],
        )?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(EngineError::UnexpectedOutput { step: "inspect".into(), output: id });
        }
        Ok(BuiltImage { id, tag: request.tag.clone() })
    }

    fn configured_user(&self, image: &BuiltImage) -> Result<String, EngineError> {
        let out = self.run(
            "inspect-user",
            &["image".into(), "inspect".into(), "--format".into(), "{{.Config.User}}".into(), image.id.clone()],
        )?;
        Ok(out.trim().to_string())
    }

    fn list_files(&self, image: &BuiltImage, dir: &str) -> Result<Vec<String>, EngineError> {
        let root = dir.trim_end_matches('/');
        let out = self.exec("list-files", image, &["find", dir, "-type", "f"])?;
        let mut files: Vec<String> = lines(&out)
            .into_iter()
            .filter_map(|p| p.strip_prefix(root).map(|r| r.trim_start_matches('/').to_string()))
            .collect();
        files.sort();
        Ok(files)
    }

    fn installed_packages(&self, image: &BuiltImage) -> Result<Vec<String>, EngineError> {
        let out = self.exec("list-packages", image, &["dpkg-query", "-W", "-f=${Package}\\n"])?;
        let mut packages = lines(&out);
        packages.sort();
        Ok(packages)
    }

    fn file_mode(&self, image: &BuiltImage, path: &str) -> Result<Option<u32>, EngineError> {
        let out = match self.exec("stat", image, &["stat", "-c", "%a", path]) {
            Ok(out) => out,
            Err(e) if is_missing_file(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        u32::from_str_radix(out.trim(), 8)
            .map(Some)
            .map_err(|_| EngineError::UnexpectedOutput { step: "stat".into(), output: out })
    }

    fn tag(&self, image: &BuiltImage, tag: &str) -> Result<(), EngineError> {
        self.run("tag", &["tag".into(), image.id.clone(), tag.to_string()])?;
        Ok(())
    }

    fn remove(&self, image: &BuiltImage) -> Result<(), EngineError> {
        self.run("remove", &["image".into(), "rm".into(), "--force".into(), image.tag.clone()])?;
        Ok(())
    }
}

//! Recipe Rendering - Dockerfile and .dockerignore
//!
//! Output depends only on the recipe and its stages. No timestamps, no ids.

use std::fmt::Write;

use crate::recipe::Recipe;
use crate::stage::{Instruction, Stage, StagePair};
use crate::ENGINE_VERSION;

const APT_LISTS: &str = "/var/lib/apt/lists/*";

/// Render both stages as one multi-stage Dockerfile.
pub fn render_dockerfile(recipe: &Recipe, stages: &StagePair) -> String {
    let mut out = String::new();
    out.push_str("# syntax=docker/dockerfile:1\n");
    let _ = writeln!(
        out,
        "# Generated by stagerecipe {} from recipe {}@{}",
        ENGINE_VERSION, recipe.id, recipe.recipe_version
    );
    out.push('\n');
    out.push_str(&render_stage(&stages.builder));
    out.push('\n');
    out.push_str(&render_stage(&stages.runtime));
    out
}

pub fn render_stage(stage: &Stage) -> String {
    let mut out = String::new();
    match &stage.name {
        Some(name) => { let _ = writeln!(out, "FROM {} AS {}", stage.base.reference(), name); }
        None => { let _ = writeln!(out, "FROM {}", stage.base.reference()); }
    }
    for instruction in &stage.instructions {
        out.push_str(&render_instruction(instruction));
        out.push('\n');
    }
    out
}

fn render_instruction(instruction: &Instruction) -> String {
    match instruction {
        Instruction::Workdir { path } => format!("WORKDIR {}", path),
        Instruction::Env { vars } => {
            let pairs: Vec<_> = vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, quote_env(v)))
                .collect();
            format!("ENV {}", pairs.join(" \\\n    "))
        }
        Instruction::InstallSystemPackages { packages } => format!(
            "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends {} \\\n    && rm -rf {}",
            packages.join(" "),
            APT_LISTS
        ),
        Instruction::CopyContext { sources, dest } => format!("COPY {} {}", sources.join(" "), dest),
        Instruction::InstallPrefix { manifest, prefix } => format!(
            "RUN pip install --no-cache-dir --prefix={} -r {}",
            prefix, manifest
        ),
        Instruction::CopyFromStage { stage, from, to } => format!("COPY --from={} {} {}", stage, from, to),
        Instruction::CreateAccount { name, home, shell } => {
            format!("RUN useradd --create-home --home-dir {} --shell {} {}", home, shell, name)
        }
        Instruction::MarkExecutable { path } => format!("RUN chmod +x {}", path),
        Instruction::SwitchUser { name } => format!("USER {}", name),
        Instruction::Command { argv } => format!("CMD {}", exec_form(argv)),
    }
}

fn quote_env(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:".contains(c));
    if plain {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    format!("\"{}\"", escaped)
}

/// JSON exec form; never goes through a shell.
fn exec_form(argv: &[String]) -> String {
    let quoted: Vec<_> = argv
        .iter()
        .map(|a| serde_json::Value::String(a.clone()).to_string())
        .collect();
    format!("[{}]", quoted.join(", "))
}

pub fn render_dockerignore(recipe: &Recipe) -> String {
    let mut out = String::from("# Generated by stagerecipe\n");
    for pattern in &recipe.exclude {
        out.push_str(&dockerignore_pattern(pattern));
        out.push('\n');
    }
    out
}

/// Docker anchors every pattern at the context root, while recipe exclusions
/// follow gitignore rules: a pattern without an inner `/` matches at any depth.
fn dockerignore_pattern(pattern: &str) -> String {
    let (negate, body) = match pattern.strip_prefix('!') {
        Some(rest) => ("!", rest),
        None => ("", pattern),
    };
    let body = body.trim_end_matches('/');
    if body.is_empty() || body.starts_with("**/") {
        return format!("{}{}", negate, body);
    }
    match body.strip_prefix('/') {
        Some(anchored) => format!("{}{}", negate, anchored),
        None if body.contains('/') => format!("{}{}", negate, body),
        None => format!("{}**/{}", negate, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_dockerfile() {
        let recipe = Recipe::reference();
        let dockerfile = render_dockerfile(&recipe, &StagePair::from_recipe(&recipe));
        let body: String = dockerfile.lines().skip(3).map(|l| format!("{}\n", l)).collect();

        let expected = "\
FROM python:3.11-slim AS builder
WORKDIR /app
ENV PYTHONDONTWRITEBYTECODE=1 \\
    PYTHONUNBUFFERED=1
RUN apt-get update \\
    && apt-get install -y --no-install-recommends build-essential libpq-dev libjpeg-dev zlib1g-dev \\
    && rm -rf /var/lib/apt/lists/*
COPY requirements.txt .
RUN pip install --no-cache-dir --prefix=/install -r requirements.txt

FROM python:3.11-slim
WORKDIR /app
ENV DJANGO_SETTINGS_MODULE=pdfserviedeploy.settings \\
    PYTHONDONTWRITEBYTECODE=1 \\
    PYTHONUNBUFFERED=1
RUN apt-get update \\
    && apt-get install -y --no-install-recommends libpq5 libjpeg62-turbo zlib1g \\
    && rm -rf /var/lib/apt/lists/*
COPY --from=builder /install /usr/local
COPY . .
RUN useradd --create-home --home-dir /home/appuser --shell /bin/bash appuser
RUN chmod +x start.sh
USER appuser
CMD [\"sh\", \"start.sh\"]
";
        assert_eq!(body, expected);
    }

    #[test]
    fn test_render_is_deterministic() {
        let recipe = Recipe::reference();
        let a = render_dockerfile(&recipe, &StagePair::from_recipe(&recipe));
        let b = render_dockerfile(&recipe, &StagePair::from_recipe(&recipe));
        assert_eq!(a, b);
    }

    #[test]
    fn test_env_values_quoted_when_needed() {
        assert_eq!(quote_env("1"), "1");
        assert_eq!(quote_env("a b"), "\"a b\"");
        assert_eq!(quote_env("$HOME"), "\"\\$HOME\"");
        assert_eq!(quote_env(""), "\"\"");
    }

    #[test]
    fn test_dockerignore_lists_exclusions() {
        let text = render_dockerignore(&Recipe::reference());
        let lines: Vec<_> = text.lines().skip(1).collect();
        assert_eq!(lines, vec!["**/.git", "**/__pycache__", "**/*.pyc", "**/.env"]);
    }

    #[test]
    fn test_dockerignore_keeps_anchored_patterns() {
        assert_eq!(dockerignore_pattern("/media"), "media");
        assert_eq!(dockerignore_pattern("static/build/"), "static/build");
        assert_eq!(dockerignore_pattern("node_modules/"), "**/node_modules");
        assert_eq!(dockerignore_pattern("!keep.pyc"), "!**/keep.pyc");
        assert_eq!(dockerignore_pattern("**/tmp"), "**/tmp");
    }

    #[test]
    fn test_newline_in_env_value_is_escaped() {
        assert_eq!(quote_env("a\nb"), "\"a\\nb\"");
    }
}

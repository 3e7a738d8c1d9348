//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy maps violations to actions.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use crate::recipe::{FailureMode, Recipe, BUILDER_STAGE};
use crate::stage::{Instruction, StagePair};

/// Interpreter flags both stages must declare for themselves.
pub const STAGE_FLAGS: [&str; 2] = ["PYTHONDONTWRITEBYTECODE", "PYTHONUNBUFFERED"];
pub const SETTINGS_LOCATOR: &str = "DJANGO_SETTINGS_MODULE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: ViolationSeverity::Error,
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self { severity: ViolationSeverity::Warning, ..Self::error(rule, message) }
    }

    fn expected(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    fn fix(mut self, remediation: &str) -> Self {
        self.remediation.push(remediation.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub recipe_id: String,
    pub recipe_version: String,
}

impl ValidationResult {
    pub fn success(recipe: &Recipe) -> Self {
        Self {
            valid: true,
            violations: vec![],
            recipe_id: recipe.id.clone(),
            recipe_version: recipe.recipe_version.clone(),
        }
    }

    pub fn failure(recipe: &Recipe, violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: false,
            violations,
            recipe_id: recipe.id.clone(),
            recipe_version: recipe.recipe_version.clone(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect()
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation>;

    /// Errors from an invariant rule block in every failure mode.
    fn invariant(&self) -> bool {
        false
    }
}

// --- Concrete Rules ---

pub struct PrivilegeDropRule;

impl ValidationRule for PrivilegeDropRule {
    fn name(&self) -> &'static str { "privilege_drop" }

    fn invariant(&self) -> bool { true }

    fn validate(&self, recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        let final_user = stages.runtime.final_user().unwrap_or("");
        if is_privileged_identity(final_user) {
            violations.push(
                ValidationViolation::error(self.name(), "Runtime stage ends as a privileged account")
                    .expected("restricted account", display_user(final_user))
                    .fix("Set account.name to a dedicated non-root user"),
            );
        } else if final_user != recipe.account.name {
            violations.push(
                ValidationViolation::error(self.name(), "Runtime user is not the created account")
                    .expected(recipe.account.name.clone(), final_user),
            );
        }

        let switched = stages
            .runtime
            .instructions
            .iter()
            .position(|i| matches!(i, Instruction::SwitchUser { .. }));
        if let Some(pos) = switched {
            let later = &stages.runtime.instructions[pos + 1..];
            if later.iter().any(needs_privilege) {
                violations.push(ValidationViolation::error(
                    self.name(),
                    "Privileged instruction after the user switch",
                ));
            }
            let switches = later
                .iter()
                .filter(|i| matches!(i, Instruction::SwitchUser { .. }))
                .count();
            if switches > 0 {
                violations.push(ValidationViolation::error(
                    self.name(),
                    "Runtime stage switches user more than once",
                ));
            }
        }

        violations
    }
}

pub(crate) fn is_privileged_identity(user: &str) -> bool {
    let name = user.split(':').next().unwrap_or("").trim();
    name.is_empty() || name == "root" || name == "0"
}

fn display_user(user: &str) -> String {
    if user.is_empty() { "<default>".to_string() } else { user.to_string() }
}

fn needs_privilege(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::InstallSystemPackages { .. }
            | Instruction::InstallPrefix { .. }
            | Instruction::CopyFromStage { .. }
            | Instruction::CreateAccount { .. }
            | Instruction::MarkExecutable { .. }
    )
}

pub struct PackagePairingRule;

impl ValidationRule for PackagePairingRule {
    fn name(&self) -> &'static str { "package_pairing" }

    fn validate(&self, recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        for pkg in &recipe.native_packages {
            if pkg.dev.trim().is_empty() {
                violations.push(ValidationViolation::error(self.name(), "Native package without a dev package"));
            }
            if pkg.runtime.as_deref() == Some(pkg.dev.as_str()) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{} is paired with itself", pkg.dev))
                        .fix("Pair the dev package with its shared-library package"),
                );
            }
        }

        let build_only = recipe.build_only_packages();
        for pkg in stages.runtime.system_packages() {
            if build_only.iter().any(|b| b == pkg) || is_dev_package(pkg) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("Build-only package {} in runtime stage", pkg))
                        .expected("runtime shared libraries only", pkg)
                        .fix("Declare the runtime counterpart in nativePackages instead"),
                );
            }
        }

        let builder = recipe.builder_packages();
        let declared = recipe.toolchain.len() + recipe.native_packages.len();
        if builder.len() < declared {
            violations.push(ValidationViolation::warning(
                self.name(),
                "Duplicate entries in toolchain or nativePackages",
            ));
        }

        violations
    }
}

fn is_dev_package(pkg: &str) -> bool {
    pkg.ends_with("-dev") || pkg.ends_with("-devel") || pkg.ends_with("-headers")
}

pub struct BaseParityRule;

impl ValidationRule for BaseParityRule {
    fn name(&self) -> &'static str { "base_parity" }

    fn invariant(&self) -> bool { true }

    fn validate(&self, _recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation> {
        let builder = &stages.builder.base;
        let runtime = &stages.runtime.base;
        if builder != runtime {
            vec![ValidationViolation::error(self.name(), "Runtime base differs from builder base")
                .expected(builder.reference(), runtime.reference())
                .fix("Use the same base image name, tag and digest for both stages")]
        } else {
            vec![]
        }
    }
}

pub struct PrefixHandoffRule;

impl ValidationRule for PrefixHandoffRule {
    fn name(&self) -> &'static str { "prefix_handoff" }

    fn invariant(&self) -> bool { true }

    fn validate(&self, recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let prefix = recipe.install_prefix.trim_end_matches('/');

        if !recipe.install_prefix.starts_with('/') || prefix.is_empty() {
            violations.push(
                ValidationViolation::error(self.name(), "Install prefix must be an absolute, non-root directory")
                    .expected("/install", recipe.install_prefix.clone()),
            );
        }
        if prefix == recipe.library_path.trim_end_matches('/') {
            violations.push(ValidationViolation::error(
                self.name(),
                "Install prefix is the global library path",
            ));
        }
        if stages.runtime.installs_manifest() {
            violations.push(
                ValidationViolation::error(self.name(), "Runtime stage rebuilds dependencies")
                    .fix("Copy the install prefix from the builder stage instead"),
            );
        }

        let copies: Vec<_> = stages
            .runtime
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::CopyFromStage { stage, from, .. } => Some((stage.as_str(), from.as_str())),
                _ => None,
            })
            .collect();
        let handoffs = copies
            .iter()
            .filter(|(stage, from)| *stage == BUILDER_STAGE && *from == recipe.install_prefix)
            .count();
        if handoffs != 1 {
            violations.push(
                ValidationViolation::error(self.name(), "Install prefix must be copied exactly once")
                    .expected("1", handoffs.to_string()),
            );
        }

        violations
    }
}

pub struct EntrypointRule;

impl ValidationRule for EntrypointRule {
    fn name(&self) -> &'static str { "entrypoint" }

    fn validate(&self, recipe: &Recipe, _stages: &StagePair) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let entry = &recipe.entrypoint;

        if entry.interpreter.trim().is_empty() {
            violations.push(ValidationViolation::error(self.name(), "Entrypoint interpreter is empty"));
        }
        if !is_contained(&entry.script) {
            violations.push(
                ValidationViolation::error(self.name(), "Startup script must be a path inside the source tree")
                    .expected("relative path", entry.script.clone()),
            );
        }
        if !recipe.account.home.starts_with('/') || !recipe.account.shell.starts_with('/') {
            violations.push(ValidationViolation::error(
                self.name(),
                "Account home and shell must be absolute paths",
            ));
        }

        violations
    }
}

fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

pub struct EnvIsolationRule;

impl ValidationRule for EnvIsolationRule {
    fn name(&self) -> &'static str { "env_isolation" }

    fn invariant(&self) -> bool { true }

    fn validate(&self, _recipe: &Recipe, stages: &StagePair) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let builder_env = stages.builder.env();
        let runtime_env = stages.runtime.env();

        for (stage, env) in [("builder", &builder_env), ("runtime", &runtime_env)] {
            for key in env.keys().filter(|k| !is_env_name(k)) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("Invalid variable name in {} stage", stage))
                        .expected("[A-Za-z_][A-Za-z0-9_]*", key.clone()),
                );
            }
            for (key, _) in env.iter().filter(|(_, v)| v.chars().any(char::is_control)) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{} in {} stage spans lines", key, stage))
                        .fix("ENV values must fit on one Dockerfile line"),
                );
            }
            for flag in STAGE_FLAGS.iter().filter(|f| !env.contains_key(**f)) {
                violations.push(
                    ValidationViolation::warning(self.name(), format!("{} stage does not declare {}", stage, flag))
                        .fix("Declare the flag in this stage; values do not carry across stages"),
                );
            }
        }

        if !runtime_env.contains_key(SETTINGS_LOCATOR) {
            violations.push(ValidationViolation::warning(
                self.name(),
                format!("Runtime stage does not declare {}", SETTINGS_LOCATOR),
            ));
        }

        violations
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct ReproducibilityRule;

impl ValidationRule for ReproducibilityRule {
    fn name(&self) -> &'static str { "reproducibility" }

    fn validate(&self, recipe: &Recipe, _stages: &StagePair) -> Vec<ValidationViolation> {
        if !recipe.validation.warn_unpinned || recipe.base_image.digest.is_some() {
            return vec![];
        }
        vec![ValidationViolation::warning(self.name(), "Base image is not pinned by digest")
            .expected("name:tag@sha256:...", recipe.base_image.reference())
            .fix("Add baseImage.digest to make rebuilds reproducible")]
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(PrivilegeDropRule),
                Box::new(PackagePairingRule),
                Box::new(BaseParityRule),
                Box::new(PrefixHandoffRule),
                Box::new(EntrypointRule),
                Box::new(EnvIsolationRule),
                Box::new(ReproducibilityRule),
            ],
        }
    }

    pub fn validate(&self, recipe: &Recipe, stages: &StagePair) -> ValidationResult {
        let mut all_violations = vec![];
        let mut invariant_broken = false;

        for rule in &self.rules {
            let violations = rule.validate(recipe, stages);
            if !violations.is_empty() {
                tracing::debug!(rule = rule.name(), count = violations.len(), "rule reported violations");
            }
            if rule.invariant() && violations.iter().any(|v| v.severity == ViolationSeverity::Error) {
                invariant_broken = true;
            }
            all_violations.extend(violations);
        }

        let has_errors = all_violations.iter()
            .any(|v| v.severity == ViolationSeverity::Error);

        let blocked = match recipe.validation.failure_mode {
            FailureMode::Block => has_errors,
            // Only invariant rules block; everything else is just recorded
            FailureMode::Warn | FailureMode::Log => invariant_broken,
        };

        if blocked {
            ValidationResult::failure(recipe, all_violations)
        } else {
            ValidationResult {
                valid: true,
                violations: all_violations,
                recipe_id: recipe.id.clone(),
                recipe_version: recipe.recipe_version.clone(),
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{BaseImage, NativePackage};
    use crate::stage::StagePair;

    fn run(rule: &dyn ValidationRule, recipe: &Recipe) -> Vec<ValidationViolation> {
        rule.validate(recipe, &StagePair::from_recipe(recipe))
    }

    #[test]
    fn test_reference_recipe_has_no_errors() {
        let recipe = Recipe::reference();
        let result = Validator::new().validate(&recipe, &StagePair::from_recipe(&recipe));
        assert!(result.valid);
        assert!(!result.has_errors());
        // Unpinned base is surfaced, not blocking.
        assert!(result.violations.iter().any(|v| v.rule == "reproducibility"));
    }

    #[test]
    fn test_root_account_rejected() {
        let mut recipe = Recipe::reference();
        recipe.account.name = "root".to_string();
        let violations = run(&PrivilegeDropRule, &recipe);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].actual.as_deref(), Some("root"));
    }

    #[test]
    fn test_numeric_root_and_empty_rejected() {
        assert!(is_privileged_identity("0"));
        assert!(is_privileged_identity("0:0"));
        assert!(is_privileged_identity(""));
        assert!(!is_privileged_identity("appuser"));
    }

    #[test]
    fn test_dev_runtime_pair_rejected() {
        let mut recipe = Recipe::reference();
        recipe.native_packages.push(NativePackage::paired("libffi-dev", "libffi-dev"));
        let violations = run(&PackagePairingRule, &recipe);
        assert!(violations.iter().any(|v| v.message.contains("paired with itself")));
        assert!(violations.iter().any(|v| v.message.contains("Build-only package libffi-dev")));
    }

    #[test]
    fn test_base_mismatch_rejected() {
        let mut recipe = Recipe::reference();
        recipe.runtime_base = Some(BaseImage::new("python", "3.12-slim"));
        let violations = run(&BaseParityRule, &recipe);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].actual.as_deref(), Some("python:3.12-slim"));
    }

    #[test]
    fn test_prefix_equal_to_library_path_rejected() {
        let mut recipe = Recipe::reference();
        recipe.install_prefix = "/usr/local/".to_string();
        let violations = run(&PrefixHandoffRule, &recipe);
        assert!(violations.iter().any(|v| v.message.contains("global library path")));
    }

    #[test]
    fn test_runtime_rebuild_rejected() {
        let recipe = Recipe::reference();
        let mut stages = StagePair::from_recipe(&recipe);
        stages.runtime.instructions.insert(
            0,
            Instruction::InstallPrefix { manifest: "requirements.txt".into(), prefix: "/install".into() },
        );
        let violations = PrefixHandoffRule.validate(&recipe, &stages);
        assert!(violations.iter().any(|v| v.message.contains("rebuilds")));
    }

    #[test]
    fn test_privileged_step_after_switch_rejected() {
        let recipe = Recipe::reference();
        let mut stages = StagePair::from_recipe(&recipe);
        stages.runtime.instructions.push(Instruction::MarkExecutable { path: "start.sh".into() });
        let violations = PrivilegeDropRule.validate(&recipe, &stages);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_escaping_script_rejected() {
        let mut recipe = Recipe::reference();
        recipe.entrypoint.script = "../start.sh".to_string();
        assert_eq!(run(&EntrypointRule, &recipe).len(), 1);
        recipe.entrypoint.script = "/start.sh".to_string();
        assert_eq!(run(&EntrypointRule, &recipe).len(), 1);
        recipe.entrypoint.script = "bin/start.sh".to_string();
        assert!(run(&EntrypointRule, &recipe).is_empty());
    }

    #[test]
    fn test_missing_runtime_flags_warn() {
        let mut recipe = Recipe::reference();
        recipe.runtime_env.clear();
        let violations = run(&EnvIsolationRule, &recipe);
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().all(|v| v.severity == ViolationSeverity::Warning));
    }

    #[test]
    fn test_invalid_env_name_errors() {
        let mut recipe = Recipe::reference();
        recipe.builder_env.insert("1BAD".to_string(), "x".to_string());
        let violations = run(&EnvIsolationRule, &recipe);
        assert!(violations.iter().any(|v| v.severity == ViolationSeverity::Error));
    }

    #[test]
    fn test_warn_mode_records_ordinary_errors() {
        let mut recipe = Recipe::reference();
        recipe.entrypoint.script = "../start.sh".to_string();
        recipe.validation.failure_mode = FailureMode::Warn;
        let result = Validator::new().validate(&recipe, &StagePair::from_recipe(&recipe));
        assert!(result.valid);
        assert!(result.has_errors());
    }

    #[test]
    fn test_invariant_errors_block_in_every_mode() {
        for mode in [FailureMode::Block, FailureMode::Warn, FailureMode::Log] {
            let mut recipe = Recipe::reference();
            recipe.account.name = "root".to_string();
            recipe.validation.failure_mode = mode;
            let result = Validator::new().validate(&recipe, &StagePair::from_recipe(&recipe));
            assert!(!result.valid);
            assert!(result.violations.iter().any(|v| v.rule == "privilege_drop"));
        }

        let mut recipe = Recipe::reference();
        recipe.runtime_base = Some(BaseImage::new("python", "3.12-slim"));
        recipe.validation.failure_mode = FailureMode::Log;
        assert!(!Validator::new().validate(&recipe, &StagePair::from_recipe(&recipe)).valid);
    }

    #[test]
    fn test_multiline_env_value_rejected() {
        let mut recipe = Recipe::reference();
        recipe.runtime_env.insert("BANNER".to_string(), "line one\nline two".to_string());
        let violations = run(&EnvIsolationRule, &recipe);
        assert!(violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Error && v.message.contains("BANNER")));
    }
}

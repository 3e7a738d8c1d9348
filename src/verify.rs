//! Image Verification - checks on what the engine actually produced

use std::collections::HashSet;

use crate::engine::ImageFacts;
use crate::recipe::Recipe;
use crate::validation::{is_privileged_identity, ValidationResult, ValidationViolation, ViolationSeverity};

fn violation(rule: &str, message: String, expected: String, actual: String) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity: ViolationSeverity::Error,
        message,
        expected: Some(expected),
        actual: Some(actual),
        remediation: vec![],
    }
}

/// Verify a built image against its recipe. Any violation fails the build;
/// the recipe's failure mode does not apply here.
pub fn verify_image(recipe: &Recipe, facts: &ImageFacts) -> ValidationResult {
    let mut violations = vec![];

    if is_privileged_identity(&facts.user) || facts.user != recipe.account.name {
        violations.push(violation(
            "image_user",
            "Image does not run as the restricted account".to_string(),
            recipe.account.name.clone(),
            if facts.user.is_empty() { "<default>".to_string() } else { facts.user.clone() },
        ));
    }

    let library: HashSet<&String> = facts.library_files.iter().collect();
    let missing: Vec<_> = facts
        .prefix_files
        .iter()
        .filter(|f| !library.contains(f))
        .cloned()
        .collect();
    if !missing.is_empty() {
        violations.push(violation(
            "prefix_copied",
            format!("{} install prefix file(s) missing from {}", missing.len(), recipe.library_path),
            "every prefix file present".to_string(),
            missing.join(", "),
        ));
    }

    let leaked: Vec<_> = recipe
        .build_only_packages()
        .into_iter()
        .filter(|p| facts.installed_packages.contains(p))
        .collect();
    if !leaked.is_empty() {
        violations.push(violation(
            "build_packages_absent",
            "Build-only packages installed in runtime image".to_string(),
            "none".to_string(),
            leaked.join(", "),
        ));
    }

    match facts.script_mode {
        Some(mode) if mode & 0o111 != 0 => {}
        Some(mode) => violations.push(violation(
            "startup_executable",
            format!("{} is not executable", recipe.entrypoint.script),
            "execute bits set".to_string(),
            format!("{:o}", mode),
        )),
        None => violations.push(violation(
            "startup_executable",
            format!("{} is missing from the image", recipe.entrypoint.script),
            "file present".to_string(),
            "missing".to_string(),
        )),
    }

    if violations.is_empty() {
        ValidationResult::success(recipe)
    } else {
        ValidationResult::failure(recipe, violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_facts() -> ImageFacts {
        let mut library_files = vec![
            "bin/python3.11".to_string(),
            "lib/python3.11/site-packages/django/__init__.py".to_string(),
        ];
        library_files.sort();
        ImageFacts {
            user: "appuser".to_string(),
            prefix_files: vec!["lib/python3.11/site-packages/django/__init__.py".to_string()],
            library_files,
            installed_packages: vec!["libpq5".to_string(), "zlib1g".to_string()],
            script_mode: Some(0o755),
        }
    }

    #[test]
    fn test_good_image_passes() {
        let result = verify_image(&Recipe::reference(), &good_facts());
        assert!(result.valid, "{:?}", result.violations);
    }

    #[test]
    fn test_root_user_fails() {
        let mut facts = good_facts();
        facts.user = String::new();
        let result = verify_image(&Recipe::reference(), &facts);
        assert!(!result.valid);
        assert_eq!(result.violations[0].rule, "image_user");
        assert_eq!(result.violations[0].actual.as_deref(), Some("<default>"));
    }

    #[test]
    fn test_incomplete_copy_fails() {
        let mut facts = good_facts();
        facts.prefix_files.push("lib/python3.11/site-packages/PIL/Image.py".to_string());
        let result = verify_image(&Recipe::reference(), &facts);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule, "prefix_copied");
    }

    #[test]
    fn test_leaked_compiler_fails() {
        let mut facts = good_facts();
        facts.installed_packages.push("build-essential".to_string());
        facts.installed_packages.push("libpq-dev".to_string());
        let result = verify_image(&Recipe::reference(), &facts);
        assert_eq!(result.violations[0].actual.as_deref(), Some("build-essential, libpq-dev"));
    }

    #[test]
    fn test_non_executable_script_fails() {
        let mut facts = good_facts();
        facts.script_mode = Some(0o644);
        let result = verify_image(&Recipe::reference(), &facts);
        assert_eq!(result.violations[0].rule, "startup_executable");
        assert_eq!(result.violations[0].actual.as_deref(), Some("644"));
    }
}

//! Build Pipeline - Single Entry Point
//!
//! CRITICAL: plan and build MUST call validate internally. No bypass.
//! Nothing receives the requested tag until the image has been verified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{BuildContext, ContextError, SourceDigest};
use crate::engine::{BuildEngine, BuildRequest, BuiltImage, EngineError, ImageFacts};
use crate::hashing::{compute_job_hash, compute_recipe_hash, compute_render_hash};
use crate::recipe::{Recipe, RecipeRegistry, BUILDER_STAGE};
use crate::render::{render_dockerfile, render_dockerignore};
use crate::stage::StagePair;
use crate::validation::{ValidationResult, Validator};
use crate::verify::verify_image;
use crate::ENGINE_VERSION;

const LABEL_PREFIX: &str = "org.stagerecipe";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Recipe version {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Build context error: {0}")]
    Context(#[from] ContextError),

    #[error("Build engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Image verification failed: {0}")]
    VerificationFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A validated recipe, expanded into stages and rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    pub id: String,
    pub recipe_id: String,
    pub recipe_version: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub recipe_hash: String,
    pub job_hash: String,
    pub render_hash: String,
    pub validation: ValidationResult,
    pub stages: StagePair,
    pub dockerfile: String,
    pub dockerignore: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub plan_id: String,
    pub recipe_id: String,
    pub tag: String,
    pub image_id: String,
    pub recipe_hash: String,
    pub job_hash: String,
    pub source: SourceDigest,
    pub facts: ImageFacts,
    pub verification: ValidationResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The build pipeline - single entry point for all recipe operations
pub struct BuildPipeline {
    registry: RecipeRegistry,
    validator: Validator,
}

impl BuildPipeline {
    pub fn new(registry: RecipeRegistry) -> Self {
        Self {
            registry,
            validator: Validator::new(),
        }
    }

    /// List all available recipes
    pub fn list_recipes(&self) -> Vec<&Recipe> {
        self.registry.list()
    }

    /// Get a specific recipe
    pub fn get_recipe(&self, id: &str) -> Option<&Recipe> {
        self.registry.get(id)
    }

    fn recipe(&self, id: &str) -> Result<&Recipe, PipelineError> {
        self.registry
            .get(id)
            .ok_or_else(|| PipelineError::RecipeNotFound(id.to_string()))
    }

    /// Validate a recipe
    ///
    /// This is the ONLY validation entry point.
    pub fn validate_recipe(&self, recipe_id: &str) -> Result<ValidationResult, PipelineError> {
        let recipe = self.recipe(recipe_id)?;
        self.check_engine_version(recipe)?;
        if recipe.deprecated {
            tracing::warn!(recipe = %recipe.id, "recipe is deprecated");
        }

        let stages = StagePair::from_recipe(recipe);
        Ok(self.validator.validate(recipe, &stages))
    }

    /// Expand and render a recipe
    ///
    /// CRITICAL: This ALWAYS calls validate_recipe internally. No bypass possible.
    pub fn plan(&self, recipe_id: &str) -> Result<BuildPlan, PipelineError> {
        let recipe = self.recipe(recipe_id)?;

        // MANDATORY: Validation is always called. This is non-negotiable.
        let validation = self.validate_recipe(recipe_id)?;
        if !validation.valid {
            return Err(PipelineError::ValidationFailed(validation.messages().join("; ")));
        }
        for warning in validation.violations.iter() {
            tracing::warn!(recipe = %recipe.id, rule = %warning.rule, "{}", warning.message);
        }

        let stages = StagePair::from_recipe(recipe);
        let recipe_hash = compute_recipe_hash(recipe)?;
        let job_hash = compute_job_hash(&recipe.id, &recipe.recipe_version, &stages, ENGINE_VERSION)?;
        let dockerfile = render_dockerfile(recipe, &stages);
        let dockerignore = render_dockerignore(recipe);

        Ok(BuildPlan {
            id: Uuid::new_v4().to_string(),
            recipe_id: recipe.id.clone(),
            recipe_version: recipe.recipe_version.clone(),
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            recipe_hash,
            job_hash,
            render_hash: compute_render_hash(&dockerfile, &dockerignore),
            validation,
            stages,
            dockerfile,
            dockerignore,
        })
    }

    /// Check a build context against a recipe without invoking the engine.
    pub fn check_context(
        &self,
        recipe_id: &str,
        context_dir: &Path,
    ) -> Result<crate::context::ContextReport, PipelineError> {
        let recipe = self.recipe(recipe_id)?;
        let context = BuildContext::open(context_dir)?;
        Ok(context.check(recipe)?)
    }

    /// Build, verify, then promote to `tag`.
    ///
    /// Both stages are built under candidate tags. Any failure removes the
    /// candidates, so a failed build never leaves `tag` pointing anywhere new.
    pub fn build(
        &self,
        engine: &dyn BuildEngine,
        recipe_id: &str,
        context_dir: &Path,
        tag: &str,
    ) -> Result<BuildReport, PipelineError> {
        let started_at = Utc::now();
        let plan = self.plan(recipe_id)?;
        let recipe = self.recipe(recipe_id)?;
        let report = self.check_context(recipe_id, context_dir)?;

        tracing::info!(
            recipe = %recipe.id,
            engine = engine.name(),
            plan = %plan.id,
            source = %report.source.digest,
            "starting build"
        );

        let suffix = &plan.id[..8];
        let mut request = BuildRequest {
            context: context_dir.to_path_buf(),
            dockerfile: plan.dockerfile.clone(),
            dockerignore: plan.dockerignore.clone(),
            tag: candidate_tag(tag, BUILDER_STAGE, suffix),
            target: Some(BUILDER_STAGE.to_string()),
            labels: plan_labels(&plan),
        };

        let builder = engine.build(&request)?;
        tracing::info!(image = %builder.id, "builder stage complete");

        request.tag = candidate_tag(tag, "candidate", suffix);
        request.target = None;
        let runtime = match engine.build(&request) {
            Ok(image) => image,
            Err(e) => {
                discard(engine, &[&builder]);
                return Err(e.into());
            }
        };
        tracing::info!(image = %runtime.id, "runtime stage complete");

        let script_path = format!("{}/{}", recipe.workdir.trim_end_matches('/'), recipe.entrypoint.script);
        let facts = match ImageFacts::collect(
            engine,
            &builder,
            &runtime,
            &recipe.install_prefix,
            &recipe.library_path,
            &script_path,
        ) {
            Ok(facts) => facts,
            Err(e) => {
                discard(engine, &[&builder, &runtime]);
                return Err(e.into());
            }
        };

        let verification = verify_image(recipe, &facts);
        if !verification.valid {
            discard(engine, &[&builder, &runtime]);
            return Err(PipelineError::VerificationFailed(verification.messages().join("; ")));
        }

        if let Err(e) = engine.tag(&runtime, tag) {
            discard(engine, &[&builder, &runtime]);
            return Err(e.into());
        }
        discard(engine, &[&builder, &runtime]);
        tracing::info!(tag, image = %runtime.id, "image promoted");

        Ok(BuildReport {
            plan_id: plan.id,
            recipe_id: recipe.id.clone(),
            tag: tag.to_string(),
            image_id: runtime.id,
            recipe_hash: plan.recipe_hash,
            job_hash: plan.job_hash,
            source: report.source,
            facts,
            verification,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn check_engine_version(&self, recipe: &Recipe) -> Result<(), PipelineError> {
        let engine_ver = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| PipelineError::InvalidVersion(ENGINE_VERSION.into()))?;
        let min_ver = semver::Version::parse(&recipe.engine_min_version)
            .map_err(|_| PipelineError::InvalidVersion(recipe.engine_min_version.clone()))?;

        if engine_ver < min_ver {
            return Err(PipelineError::EngineVersionMismatch(
                recipe.recipe_version.clone(),
                recipe.engine_min_version.clone(),
                ENGINE_VERSION.to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for BuildPipeline {
    fn default() -> Self {
        Self::new(RecipeRegistry::with_reference())
    }
}

/// `registry/app:1.0` -> `registry/app:<kind>-<suffix>`
pub fn candidate_tag(tag: &str, kind: &str, suffix: &str) -> String {
    let last_slash = tag.rfind('/').map_or(0, |i| i + 1);
    let repo = match tag[last_slash..].rfind(':') {
        Some(colon) => &tag[..last_slash + colon],
        None => tag,
    };
    format!("{}:{}-{}", repo, kind, suffix)
}

fn plan_labels(plan: &BuildPlan) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(format!("{}.recipe", LABEL_PREFIX), plan.recipe_id.clone());
    labels.insert(format!("{}.recipe-version", LABEL_PREFIX), plan.recipe_version.clone());
    labels.insert(format!("{}.recipe-hash", LABEL_PREFIX), plan.recipe_hash.clone());
    labels.insert(format!("{}.job-hash", LABEL_PREFIX), plan.job_hash.clone());
    labels.insert(format!("{}.render-hash", LABEL_PREFIX), plan.render_hash.clone());
    labels
}

fn discard(engine: &dyn BuildEngine, images: &[&BuiltImage]) {
    for image in images {
        if let Err(e) = engine.remove(image) {
            tracing::warn!(tag = %image.tag, error = %e, "failed to remove candidate image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_tag() {
        assert_eq!(candidate_tag("pdfservice:1.0", "candidate", "abcd1234"), "pdfservice:candidate-abcd1234");
        assert_eq!(candidate_tag("pdfservice", "builder", "abcd1234"), "pdfservice:builder-abcd1234");
        assert_eq!(
            candidate_tag("localhost:5000/team/pdfservice:1.0", "candidate", "x"),
            "localhost:5000/team/pdfservice:candidate-x"
        );
        assert_eq!(
            candidate_tag("localhost:5000/pdfservice", "candidate", "x"),
            "localhost:5000/pdfservice:candidate-x"
        );
    }

    #[test]
    fn test_plan_labels_carry_hashes() {
        let plan = BuildPipeline::default().plan("pdfservice").unwrap();
        let labels = plan_labels(&plan);
        assert_eq!(labels.get("org.stagerecipe.job-hash"), Some(&plan.job_hash));
        assert_eq!(labels.get("org.stagerecipe.render-hash"), Some(&plan.render_hash));
        assert_eq!(labels.len(), 5);
    }

    #[test]
    fn test_engine_version_gate() {
        let mut recipe = Recipe::reference();
        recipe.engine_min_version = "99.0.0".to_string();
        let mut registry = RecipeRegistry::new();
        registry.register(recipe);
        let err = BuildPipeline::new(registry).validate_recipe("pdfservice").unwrap_err();
        assert!(matches!(err, PipelineError::EngineVersionMismatch(..)));
    }
}

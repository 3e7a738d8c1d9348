//! StageRecipe Core - Two-Stage Container Recipe Compiler
//!
//! # The Five Laws (Non-Negotiable)
//! 1. Builder Builds, Runtime Copies
//! 2. Dev Packages Never Ship
//! 3. Privilege Drops Once
//! 4. Deterministic Output
//! 5. Recipes Suggest, Engine Enforces

pub mod recipe;
pub mod manifest;
pub mod stage;
pub mod render;
pub mod validation;
pub mod hashing;
pub mod context;
pub mod engine;
pub mod verify;
pub mod pipeline;

pub use recipe::{Recipe, RecipeId, RecipeRegistry, BaseImage, NativePackage, Account, Entrypoint, FailureMode};
pub use manifest::{DependencyManifest, Requirement, ManifestError};
pub use stage::{Instruction, Stage, StageBuilder, StagePair, Privileged, Restricted};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use hashing::{compute_recipe_hash, compute_job_hash, compute_render_hash, canonical_json};
pub use context::{BuildContext, ContextError, SourceDigest};
pub use engine::{BuildEngine, BuildRequest, BuiltImage, DockerEngine, EngineError, ImageFacts};
pub use verify::verify_image;
pub use pipeline::{BuildPipeline, BuildPlan, BuildReport, PipelineError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_RECIPE_VERSION: &str = "1.0.0";

//! StageRecipe CLI
//!
//! Commands: recipes, validate, render, plan, check-context, build, verify
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation, verification or build failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use stagerecipe_core::{
    BuildPipeline, DockerEngine, ImageFacts, PipelineError, RecipeRegistry, verify_image,
};

#[derive(Parser)]
#[command(name = "stagerecipe-cli")]
#[command(about = "StageRecipe CLI - Two-Stage Container Recipe Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to recipes directory (falls back to the built-in recipe when empty)
    #[arg(short, long, default_value = "recipes")]
    recipes_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List available recipes
    Recipes,

    /// Validate a recipe
    Validate {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,
    },

    /// Render a recipe as a Dockerfile
    Render {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,

        /// Write the Dockerfile here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Also write the exclusion list here
        #[arg(long)]
        ignore_out: Option<PathBuf>,
    },

    /// Print the full build plan as JSON
    Plan {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,
    },

    /// Check a build context for the manifest and startup script
    CheckContext {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,

        /// Build context directory
        #[arg(short, long, default_value = ".")]
        context: PathBuf,
    },

    /// Build, verify and tag an image
    Build {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,

        /// Build context directory
        #[arg(short, long, default_value = ".")]
        context: PathBuf,

        /// Final image tag
        #[arg(short, long)]
        tag: String,

        /// Engine executable
        #[arg(long, default_value = "docker")]
        engine: String,
    },

    /// Verify image facts (JSON) against a recipe
    Verify {
        /// Recipe ID
        #[arg(short, long)]
        recipe: String,

        /// JSON payload (ImageFacts)
        #[arg(short, long)]
        payload: String,
    },
}

fn print_json(value: &impl Serialize) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            true
        }
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to serialize output: {}"}}"#, e);
            false
        }
    }
}

fn failure(error: &PipelineError) -> ExitCode {
    let output = serde_json::json!({
        "success": false,
        "error": error.to_string(),
    });
    print_json(&output);
    match error {
        PipelineError::ValidationFailed(_)
        | PipelineError::VerificationFailed(_)
        | PipelineError::Engine(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn write_file(path: &Path, content: &str) -> bool {
    match fs::write(path, content) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "wrote file");
            true
        }
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to write {}: {}"}}"#, path.display(), e);
            false
        }
    }
}

fn load_registry(dir: &Path) -> Result<RecipeRegistry, String> {
    let mut registry = RecipeRegistry::load_from_dir(dir).map_err(|e| e.to_string())?;
    if registry.list().is_empty() {
        tracing::debug!(dir = %dir.display(), "no recipes found, using built-in recipe");
        registry = RecipeRegistry::with_reference();
    }
    Ok(registry)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let registry = match load_registry(&cli.recipes_dir) {
        Ok(r) => r,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to load recipes: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    let pipeline = BuildPipeline::new(registry);

    match cli.command {
        Commands::Recipes => {
            let recipes: Vec<_> = pipeline.list_recipes()
                .iter()
                .map(|r| serde_json::json!({
                    "id": r.id,
                    "name": r.name,
                    "version": r.recipe_version,
                    "base": r.base_image.reference(),
                    "deprecated": r.deprecated,
                }))
                .collect();

            if print_json(&recipes) { ExitCode::SUCCESS } else { ExitCode::FAILURE }
        }

        Commands::Validate { recipe } => match pipeline.validate_recipe(&recipe) {
            Ok(result) => {
                print_json(&result);
                if result.valid {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(2)  // Validation failure
                }
            }
            Err(e) => failure(&e),
        },

        Commands::Render { recipe, out, ignore_out } => {
            let plan = match pipeline.plan(&recipe) {
                Ok(plan) => plan,
                Err(e) => return failure(&e),
            };

            match out {
                Some(path) => {
                    if !write_file(&path, &plan.dockerfile) {
                        return ExitCode::FAILURE;
                    }
                }
                None => print!("{}", plan.dockerfile),
            }
            if let Some(path) = ignore_out {
                if !write_file(&path, &plan.dockerignore) {
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }

        Commands::Plan { recipe } => match pipeline.plan(&recipe) {
            Ok(plan) => {
                if print_json(&plan) { ExitCode::SUCCESS } else { ExitCode::FAILURE }
            }
            Err(e) => failure(&e),
        },

        Commands::CheckContext { recipe, context } => {
            match pipeline.check_context(&recipe, &context) {
                Ok(report) => {
                    print_json(&report);
                    ExitCode::SUCCESS
                }
                Err(e) => failure(&e),
            }
        }

        Commands::Build { recipe, context, tag, engine } => {
            let engine = DockerEngine::with_program(engine);
            match pipeline.build(&engine, &recipe, &context, &tag) {
                Ok(report) => {
                    let output = serde_json::json!({
                        "success": true,
                        "report": report,
                    });
                    print_json(&output);
                    ExitCode::SUCCESS
                }
                Err(e) => failure(&e),
            }
        }

        Commands::Verify { recipe, payload } => {
            let facts: ImageFacts = match serde_json::from_str(&payload) {
                Ok(f) => f,
                Err(e) => {
                    println!(r#"{{"valid": false, "error": "Invalid payload: {}"}}"#, e);
                    return ExitCode::FAILURE;
                }
            };
            let Some(recipe) = pipeline.get_recipe(&recipe) else {
                return failure(&PipelineError::RecipeNotFound(recipe));
            };

            let result = verify_image(recipe, &facts);
            print_json(&result);
            if result.valid { ExitCode::SUCCESS } else { ExitCode::from(2) }
        }
    }
}

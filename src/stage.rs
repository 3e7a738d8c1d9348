//! Stage Model - Builder and Runtime Stages
//!
//! A stage starts privileged. `switch_user` consumes the privileged builder and
//! returns a restricted one; nothing on the restricted side can go back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::recipe::{Account, BaseImage, Recipe, BUILDER_STAGE};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Workdir { path: String },
    Env { vars: BTreeMap<String, String> },
    InstallSystemPackages { packages: Vec<String> },
    CopyContext { sources: Vec<String>, dest: String },
    InstallPrefix { manifest: String, prefix: String },
    CopyFromStage { stage: String, from: String, to: String },
    CreateAccount { name: String, home: String, shell: String },
    MarkExecutable { path: String },
    SwitchUser { name: String },
    Command { argv: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub name: Option<String>,
    pub base: BaseImage,
    pub instructions: Vec<Instruction>,
}

impl Stage {
    /// Identity the stage ends with. `None` means the base image default (root).
    pub fn final_user(&self) -> Option<&str> {
        self.instructions.iter().rev().find_map(|i| match i {
            Instruction::SwitchUser { name } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn command(&self) -> Option<&[String]> {
        self.instructions.iter().rev().find_map(|i| match i {
            Instruction::Command { argv } => Some(argv.as_slice()),
            _ => None,
        })
    }

    pub fn system_packages(&self) -> Vec<&str> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::InstallSystemPackages { packages } => Some(packages),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for instruction in &self.instructions {
            if let Instruction::Env { vars } = instruction {
                env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        env
    }

    pub fn installs_manifest(&self) -> bool {
        self.instructions
            .iter()
            .any(|i| matches!(i, Instruction::InstallPrefix { .. }))
    }
}

/// Marker: the stage still runs as the image's privileged default account.
#[derive(Debug)]
pub struct Privileged;

/// Marker: the stage has dropped to a restricted account.
#[derive(Debug)]
pub struct Restricted;

#[derive(Debug)]
pub struct StageBuilder<S> {
    stage: Stage,
    _identity: PhantomData<S>,
}

impl StageBuilder<Privileged> {
    pub fn on_base(base: BaseImage) -> Self {
        Self {
            stage: Stage { name: None, base, instructions: vec![] },
            _identity: PhantomData,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.stage.name = Some(name.into());
        self
    }

    pub fn install_system_packages(self, packages: Vec<String>) -> Self {
        if packages.is_empty() {
            return self;
        }
        self.push(Instruction::InstallSystemPackages { packages })
    }

    pub fn install_prefix(self, manifest: &str, prefix: &str) -> Self {
        self.push(Instruction::InstallPrefix {
            manifest: manifest.to_string(),
            prefix: prefix.to_string(),
        })
    }

    pub fn copy_from_stage(self, stage: &str, from: &str, to: &str) -> Self {
        self.push(Instruction::CopyFromStage {
            stage: stage.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn create_account(self, account: &Account) -> Self {
        self.push(Instruction::CreateAccount {
            name: account.name.clone(),
            home: account.home.clone(),
            shell: account.shell.clone(),
        })
    }

    pub fn mark_executable(self, path: &str) -> Self {
        self.push(Instruction::MarkExecutable { path: path.to_string() })
    }

    /// Drop privileges for every later instruction and for the running container.
    pub fn switch_user(self, account: &Account) -> StageBuilder<Restricted> {
        let stage = self
            .push(Instruction::SwitchUser { name: account.name.clone() })
            .stage;
        StageBuilder { stage, _identity: PhantomData }
    }
}

impl StageBuilder<Restricted> {
    pub fn command(self, argv: Vec<String>) -> Self {
        self.push(Instruction::Command { argv })
    }
}

impl<S> StageBuilder<S> {
    pub fn workdir(self, path: &str) -> Self {
        self.push(Instruction::Workdir { path: path.to_string() })
    }

    pub fn env(self, vars: &BTreeMap<String, String>) -> Self {
        if vars.is_empty() {
            return self;
        }
        self.push(Instruction::Env { vars: vars.clone() })
    }

    pub fn copy_context(self, sources: &[&str], dest: &str) -> Self {
        self.push(Instruction::CopyContext {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            dest: dest.to_string(),
        })
    }

    pub fn finish(self) -> Stage {
        self.stage
    }

    fn push(mut self, instruction: Instruction) -> Self {
        self.stage.instructions.push(instruction);
        self
    }
}

/// Both stages of a recipe, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagePair {
    pub builder: Stage,
    pub runtime: Stage,
}

impl StagePair {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self {
            builder: builder_stage(recipe),
            runtime: runtime_stage(recipe),
        }
    }
}

/// Compilation environment: toolchain, headers, manifest installed into the prefix.
pub fn builder_stage(recipe: &Recipe) -> Stage {
    StageBuilder::on_base(recipe.base_image.clone())
        .named(BUILDER_STAGE)
        .workdir(&recipe.workdir)
        .env(&recipe.builder_env)
        .install_system_packages(recipe.builder_packages())
        .copy_context(&[recipe.manifest_path.as_str()], ".")
        .install_prefix(&recipe.manifest_path, &recipe.install_prefix)
        .finish()
}

/// Fresh base, runtime libraries, copied prefix and sources, restricted user.
pub fn runtime_stage(recipe: &Recipe) -> Stage {
    let mut argv = vec![recipe.entrypoint.interpreter.clone()];
    argv.push(recipe.entrypoint.script.clone());

    StageBuilder::on_base(recipe.runtime_base().clone())
        .workdir(&recipe.workdir)
        .env(&recipe.runtime_env)
        .install_system_packages(recipe.runtime_packages())
        .copy_from_stage(BUILDER_STAGE, &recipe.install_prefix, &recipe.library_path)
        .copy_context(&["."], ".")
        .create_account(&recipe.account)
        .mark_executable(&recipe.entrypoint.script)
        .switch_user(&recipe.account)
        .command(argv)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_stage_never_drops_privileges() {
        let stage = builder_stage(&Recipe::reference());
        assert_eq!(stage.name.as_deref(), Some(BUILDER_STAGE));
        assert!(stage.final_user().is_none());
        assert!(stage.installs_manifest());
        assert!(stage.system_packages().contains(&"build-essential"));
    }

    #[test]
    fn test_runtime_stage_order() {
        let stage = runtime_stage(&Recipe::reference());
        let ops: Vec<_> = stage
            .instructions
            .iter()
            .map(|i| serde_json::to_value(i).unwrap()["op"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            ops,
            vec![
                "workdir",
                "env",
                "install_system_packages",
                "copy_from_stage",
                "copy_context",
                "create_account",
                "mark_executable",
                "switch_user",
                "command",
            ]
        );
        assert_eq!(stage.final_user(), Some("appuser"));
        assert_eq!(stage.command().unwrap(), ["sh".to_string(), "start.sh".to_string()]);
        assert!(!stage.installs_manifest());
    }

    #[test]
    fn test_runtime_env_is_declared_separately() {
        let recipe = Recipe::reference();
        let builder = builder_stage(&recipe);
        let runtime = runtime_stage(&recipe);
        assert!(!builder.env().contains_key("DJANGO_SETTINGS_MODULE"));
        assert_eq!(
            runtime.env().get("DJANGO_SETTINGS_MODULE").map(String::as_str),
            Some("pdfserviedeploy.settings")
        );
    }

    #[test]
    fn test_empty_package_list_emits_nothing() {
        let stage = StageBuilder::on_base(BaseImage::new("python", "3.11-slim"))
            .install_system_packages(vec![])
            .finish();
        assert!(stage.instructions.is_empty());
    }
}

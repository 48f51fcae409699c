use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};

pub const RECIPE_VERSION: u32 = 1;

/// Build recipe: everything the pipeline needs to turn a manifest and an
/// entry point into a runtime artifact. Relative paths resolve against the
/// directory holding the recipe file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub version: u32,
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    pub entrypoint: PathBuf,
    pub interpreter: InterpreterSpec,
    pub resolver: ResolverSpec,
    pub base: BaseSpec,
    #[serde(default)]
    pub build_tools: Vec<String>,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    pub identity: IdentitySpec,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub strip: Vec<String>,
    pub output: OutputSpec,
}

impl Recipe {
    pub fn load(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            BuildError::io(format!("Failed to read recipe file: {}", path.display()), err)
        })?;
        serde_yaml::from_str(&content).map_err(|err| {
            BuildError::Configuration(format!(
                "Failed to parse recipe YAML {}: {err}",
                path.display()
            ))
        })
    }

    /// Directory that relative recipe paths are resolved against.
    pub fn base_dir(recipe_path: &Path) -> PathBuf {
        match recipe_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn context_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.context)
    }

    pub fn manifest_path(&self, base_dir: &Path) -> PathBuf {
        self.context_dir(base_dir).join(&self.manifest)
    }

    pub fn entrypoint_path(&self, base_dir: &Path) -> PathBuf {
        self.context_dir(base_dir).join(&self.entrypoint)
    }

    pub fn output_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.output.directory)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterpreterSpec {
    pub name: String,
    pub version: String,
    /// Relocatable interpreter distribution containing `bin/<name>`.
    pub distribution: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResolverSpec {
    LocalIndex {
        path: PathBuf,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BaseSpec {
    /// Pinned reference, `name@sha256:<digest>`.
    pub reference: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSpec {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub path_prefix: Vec<String>,
    #[serde(default = "default_base_path")]
    pub base_path: Vec<String>,
    #[serde(default = "default_unbuffered")]
    pub unbuffered: bool,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            path_prefix: Vec::new(),
            base_path: default_base_path(),
            unbuffered: default_unbuffered(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySpec {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub directory: PathBuf,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_manifest() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_workdir() -> String {
    "/app".to_string()
}

pub fn default_prefix() -> String {
    "/opt/venv".to_string()
}

pub fn default_base_path() -> Vec<String> {
    ["/usr/local/bin", "/usr/bin", "/bin"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_unbuffered() -> bool {
    true
}

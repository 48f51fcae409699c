//! Default process declaration for the runtime artifact.

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assemble::join_image_path;
use crate::error::{BuildError, BuildResult};
use crate::identity::OwnedImage;
use crate::recipe::EnvironmentSpec;
use crate::tree::rootfs_path;

pub const UNBUFFERED_ENV: &str = "SLIMSTAGE_UNBUFFERED";

/// Process configuration written to `config.json`. The user always comes
/// from an `ExecutionIdentity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    user: String,
    env: Vec<String>,
    cmd: Vec<String>,
    working_dir: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl RuntimeConfig {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn uid(&self) -> Option<u32> {
        self.user.split(':').next()?.parse().ok()
    }

    pub fn path_dirs(&self) -> Vec<String> {
        self.env
            .iter()
            .find_map(|entry| entry.strip_prefix("PATH="))
            .map(|path| {
                path.split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> BuildResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|err| {
            BuildError::Assembly(format!("Failed to serialize runtime config: {err}"))
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Runtime environment knobs, after applying the process environment.
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    pub path_prefix: Vec<String>,
    pub base_path: Vec<String>,
    pub unbuffered: bool,
}

impl EnvironmentOptions {
    pub fn from_spec(spec: &EnvironmentSpec) -> BuildResult<Self> {
        let unbuffered = apply_unbuffered_override(spec.unbuffered, env::var(UNBUFFERED_ENV).ok())?;
        Ok(Self {
            path_prefix: spec.path_prefix.clone(),
            base_path: spec.base_path.clone(),
            unbuffered,
        })
    }

    /// `<prefix>/bin`, then the extra prefix entries, then the base `PATH`.
    pub fn search_path(&self, prefix: &str) -> Vec<String> {
        let mut dirs: Vec<String> = vec![join_image_path(prefix, "bin")];
        for dir in self.path_prefix.iter().chain(self.base_path.iter()) {
            let dir = dir.trim_end_matches('/').to_string();
            if !dir.is_empty() && !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

pub fn apply_unbuffered_override(default: bool, value: Option<String>) -> BuildResult<bool> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BuildError::Configuration(format!(
            "{UNBUFFERED_ENV} must be a boolean, got '{other}'"
        ))),
    }
}

/// Final stage output: the owned image plus its single declared process.
#[derive(Debug)]
pub struct DeclaredArtifact {
    pub owned: OwnedImage,
    pub config: RuntimeConfig,
}

pub fn declare_entrypoint(owned: OwnedImage, options: &EnvironmentOptions) -> BuildResult<DeclaredArtifact> {
    let image = &owned.image;
    let interpreter = join_image_path(&join_image_path(&image.prefix, "bin"), &image.interpreter.name);
    if !rootfs_path(&image.rootfs, &interpreter).exists() {
        return Err(BuildError::Assembly(format!(
            "interpreter {interpreter} is missing from the artifact"
        )));
    }

    let mut env = vec![format!("PATH={}", options.search_path(&image.prefix).join(":"))];
    if options.unbuffered {
        env.push("PYTHONUNBUFFERED=1".to_string());
    }

    let mut labels = BTreeMap::new();
    labels.insert("org.slimstage.base".to_string(), image.base.to_string());
    labels.insert(
        "org.slimstage.interpreter".to_string(),
        format!("{} {}", image.interpreter.name, image.interpreter.version),
    );
    labels.insert(
        "org.slimstage.environment-digest".to_string(),
        format!("sha256:{}", image.environment_digest),
    );

    let config = RuntimeConfig {
        user: owned.identity.spec(),
        env,
        cmd: vec![interpreter, image.entrypoint.clone()],
        working_dir: image.workdir.clone(),
        labels,
    };
    info!(cmd = ?config.cmd, user = %config.user, "Entry point declared");
    Ok(DeclaredArtifact { owned, config })
}

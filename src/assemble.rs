//! Second stage: copy the materialized environment and the entry point onto
//! a pinned, tooling-free base layer.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::audit::find_tooling_on_path;
use crate::error::{BuildError, BuildResult};
use crate::materialize::MaterializedEnvironment;
use crate::recipe::InterpreterSpec;
use crate::resolver::ResolvedPackage;
use crate::tree::{copy_tree, rootfs_path, tree_digest};

const DIGEST_ALGORITHM: &str = "sha256";

/// Paths removed from the environment while copying it into the image.
pub static DEFAULT_STRIP_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "bin/pip",
        "bin/pip3",
        "bin/pip3.*",
        "bin/easy_install*",
        "**/__pycache__",
        "**/*.pyc",
        "**/.cache",
    ]
});

/// Base layer reference pinned by content digest: `name@sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseReference {
    pub name: String,
    pub digest: String,
}

impl FromStr for BaseReference {
    type Err = BuildError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (name, digest) = input.split_once('@').ok_or_else(|| {
            BuildError::Configuration(format!(
                "base layer '{input}' is not pinned; use name@sha256:<digest>"
            ))
        })?;
        let name_only = name.rsplit('/').next().unwrap_or(name);
        if name.is_empty() || name_only.ends_with(":latest") {
            return Err(BuildError::Configuration(format!(
                "base layer '{input}' must name a pinned image, not a floating tag"
            )));
        }
        let hex = digest
            .strip_prefix(DIGEST_ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| {
                BuildError::Configuration(format!(
                    "base layer '{input}' must be pinned with a sha256 digest"
                ))
            })?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BuildError::Configuration(format!(
                "base layer '{input}' has a malformed sha256 digest"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            digest: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for BaseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{DIGEST_ALGORITHM}:{}", self.name, self.digest)
    }
}

#[derive(Debug, Clone)]
pub struct BaseLayer {
    pub reference: BaseReference,
    pub path: PathBuf,
}

impl BaseLayer {
    /// Confirm the directory on disk is exactly the pinned layer and carries
    /// no shell or package manager on the default `PATH`.
    pub fn verify(&self, path_dirs: &[String]) -> BuildResult<()> {
        if !self.path.is_dir() {
            return Err(BuildError::Assembly(format!(
                "base layer {} not found at {}",
                self.reference,
                self.path.display()
            )));
        }
        let actual = tree_digest(&self.path).map_err(|err| {
            BuildError::io(format!("Failed to hash base layer {}", self.path.display()), err)
        })?;
        if actual != self.reference.digest {
            return Err(BuildError::Assembly(format!(
                "base layer {} does not match its pinned digest (found sha256:{actual})",
                self.reference
            )));
        }
        let tooling = find_tooling_on_path(&self.path, path_dirs)
            .map_err(|err| BuildError::io("Failed to inspect base layer", err))?;
        if !tooling.is_empty() {
            return Err(BuildError::Assembly(format!(
                "base layer {} is not minimal; found {}",
                self.reference,
                tooling.join(", ")
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StripPolicy {
    patterns: Vec<Pattern>,
}

impl StripPolicy {
    pub fn new<I, S>(extra: I) -> BuildResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for raw in DEFAULT_STRIP_PATTERNS.iter().copied() {
            patterns.push(compile(raw)?);
        }
        for raw in extra {
            patterns.push(compile(raw.as_ref())?);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, rel: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(rel, options)
                || pattern.matches_with(&format!("./{rel}"), options)
        })
    }
}

fn compile(raw: &str) -> BuildResult<Pattern> {
    Pattern::new(raw)
        .map_err(|err| BuildError::Configuration(format!("invalid strip pattern '{raw}': {err}")))
}

/// Everything the assembler needs besides the environment itself.
#[derive(Debug, Clone)]
pub struct AssemblyPlan {
    pub entrypoint: PathBuf,
    pub workdir: String,
    pub base: BaseLayer,
    pub base_path: Vec<String>,
    pub strip: StripPolicy,
    pub staging_dir: PathBuf,
}

/// Root filesystem of the final stage plus what went into it.
#[derive(Debug)]
pub struct AssembledImage {
    pub rootfs: PathBuf,
    pub prefix: String,
    pub workdir: String,
    pub entrypoint: String,
    pub base: BaseReference,
    pub interpreter: InterpreterSpec,
    pub packages: Vec<ResolvedPackage>,
    pub declared: Vec<String>,
    pub build_tools: Vec<String>,
    pub environment_digest: String,
    pub files_copied: usize,
    pub stripped: Vec<String>,
}

pub fn assemble(env: MaterializedEnvironment, plan: &AssemblyPlan) -> BuildResult<AssembledImage> {
    if !plan.entrypoint.is_file() {
        return Err(BuildError::Assembly(format!(
            "entry point {} does not exist in the build context",
            plan.entrypoint.display()
        )));
    }
    let entry_name = plan
        .entrypoint
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BuildError::Assembly("entry point has no file name".into()))?;

    plan.base.verify(&plan.base_path)?;

    // Checks are done; from here on the final stage exists on disk.
    let rootfs = plan.staging_dir.join("rootfs");
    fs::create_dir_all(&rootfs)
        .map_err(|err| BuildError::io(format!("Failed to create {}", rootfs.display()), err))?;

    let base_stats = copy_tree(&plan.base.path, &rootfs, |_| false)
        .map_err(|err| BuildError::io("Failed to copy base layer", err))?;
    debug!(files = base_stats.files, "Base layer copied");

    let env_dest = rootfs_path(&rootfs, &env.prefix);
    let env_stats = copy_tree(env.root(), &env_dest, |rel| {
        plan.strip.matches(rel)
    })
    .map_err(|err| conflict_or_io(err, "environment"))?;

    let workdir = rootfs_path(&rootfs, &plan.workdir);
    fs::create_dir_all(&workdir)
        .map_err(|err| BuildError::io(format!("Failed to create {}", workdir.display()), err))?;
    let entry_dest = workdir.join(&entry_name);
    if entry_dest.symlink_metadata().is_ok() {
        return Err(BuildError::Assembly(format!(
            "entry point would overwrite {} from the base layer",
            entry_dest.display()
        )));
    }
    fs::copy(&plan.entrypoint, &entry_dest).map_err(|err| {
        BuildError::io(format!("Failed to copy {}", plan.entrypoint.display()), err)
    })?;

    let entrypoint = join_image_path(&plan.workdir, &entry_name);
    info!(
        rootfs = %rootfs.display(),
        files = base_stats.files + env_stats.files + 1,
        stripped = env_stats.skipped.len(),
        entrypoint = %entrypoint,
        "Final stage assembled"
    );

    // Dropping `env` here discards the first-stage build context.
    Ok(AssembledImage {
        rootfs,
        prefix: env.prefix.clone(),
        workdir: plan.workdir.clone(),
        entrypoint,
        base: plan.base.reference.clone(),
        interpreter: env.interpreter.clone(),
        packages: env.packages.clone(),
        declared: env.declared.clone(),
        build_tools: env.build_tools.clone(),
        environment_digest: env.digest.clone(),
        files_copied: base_stats.files + env_stats.files + 1,
        stripped: env_stats.skipped,
    })
}

fn conflict_or_io(err: io::Error, what: &str) -> BuildError {
    if err.kind() == io::ErrorKind::AlreadyExists {
        BuildError::Assembly(format!("{what} collides with the base layer: {err}"))
    } else {
        BuildError::io(format!("Failed to copy {what}"), err)
    }
}

pub fn join_image_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Remove a partially built final stage. Used on every failure path.
pub fn discard(staging_dir: &Path) {
    if !staging_dir.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(staging_dir) {
        tracing::warn!(path = %staging_dir.display(), "Failed to remove partial output: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    #[test]
    fn base_references_must_be_pinned() {
        let pinned: BaseReference = format!("runtime-base@sha256:{HEX}").parse().unwrap();
        assert_eq!(pinned.name, "runtime-base");
        assert_eq!(pinned.to_string(), format!("runtime-base@sha256:{HEX}"));

        for floating in [
            "python:latest",
            "python",
            "python:3.11-slim",
            "python:latest@sha256:abc",
            "python@md5:abcd",
        ] {
            let err = floating.parse::<BaseReference>().unwrap_err();
            assert!(matches!(err, BuildError::Configuration(_)), "{floating}");
        }
        assert!(format!("python:latest@sha256:{HEX}").parse::<BaseReference>().is_err());
    }

    #[test]
    fn default_strip_policy() {
        let policy = StripPolicy::new(["share/doc"]).unwrap();
        assert!(policy.matches("bin/pip"));
        assert!(policy.matches("bin/pip3.11"));
        assert!(policy.matches("lib/site-packages/requests/__pycache__"));
        assert!(policy.matches("__pycache__"));
        assert!(policy.matches("share/doc"));
        assert!(!policy.matches("bin/python3"));
        assert!(!policy.matches("lib/site-packages/pip_tools/core.py"));
    }

    #[test]
    fn invalid_strip_patterns_are_configuration_errors() {
        let err = StripPolicy::new(["[unclosed"]).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn image_paths_join_cleanly() {
        assert_eq!(join_image_path("/app/", "main.py"), "/app/main.py");
        assert_eq!(join_image_path("/app", "main.py"), "/app/main.py");
    }
}

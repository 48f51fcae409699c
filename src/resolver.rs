//! First stage: resolve the manifest and install it, together with a pinned
//! interpreter, into an isolated environment inside a throwaway build context.

use std::collections::{BTreeMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{BuildError, BuildResult};
use crate::index::{LocalIndex, PackageIndex};
use crate::manifest::{DependencyManifest, Requirement};
use crate::recipe::InterpreterSpec;
use crate::tree::copy_tree;
use crate::version::Version;

/// Scratch filesystem owned by a single build. Everything installed here,
/// build tools included, disappears when the context is dropped.
#[derive(Debug)]
pub struct BuildContext {
    dir: TempDir,
    env_root: PathBuf,
    tools_bin: PathBuf,
}

impl BuildContext {
    pub fn create() -> BuildResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("slimstage-build-")
            .tempdir()
            .map_err(|err| BuildError::io("Failed to create build context", err))?;
        let env_root = dir.path().join("env");
        let tools_bin = dir.path().join("tools").join("bin");
        for path in [&env_root, &tools_bin] {
            fs::create_dir_all(path).map_err(|err| {
                BuildError::io(format!("Failed to create {}", path.display()), err)
            })?;
        }
        Ok(Self {
            dir,
            env_root,
            tools_bin,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn env_root(&self) -> &Path {
        &self.env_root
    }

    pub fn tools_bin(&self) -> &Path {
        &self.tools_bin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    pub digest: String,
}

#[derive(Debug, Clone)]
pub struct PinnedPackage {
    pub version: Version,
    pub digest: String,
}

/// Exact versions and digests a build must reproduce.
#[derive(Debug, Clone, Default)]
pub struct LockPins {
    packages: BTreeMap<String, PinnedPackage>,
}

impl LockPins {
    pub fn new(packages: BTreeMap<String, PinnedPackage>) -> Self {
        Self { packages }
    }

    pub fn get(&self, name: &str) -> Option<&PinnedPackage> {
        self.packages.get(name)
    }
}

/// Where packages come from.
#[derive(Debug, Clone)]
pub enum ResolverBackend {
    LocalIndex(LocalIndex),
    Command(CommandInstaller),
}

impl ResolverBackend {
    pub fn describe(&self) -> String {
        match self {
            ResolverBackend::LocalIndex(index) => index.describe(),
            ResolverBackend::Command(installer) => format!("command {}", installer.program),
        }
    }
}

/// External package manager invoked once for the whole manifest. Arguments
/// may reference `{env}`, `{manifest}` and `{python}`.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandInstaller {
    fn install(
        &self,
        manifest_path: &Path,
        context: &BuildContext,
        python: &Path,
    ) -> BuildResult<()> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{env}", &context.env_root().to_string_lossy())
                    .replace("{manifest}", &manifest_path.to_string_lossy())
                    .replace("{python}", &python.to_string_lossy())
            })
            .collect();

        let mut search_path: Vec<PathBuf> = vec![
            context.tools_bin().to_path_buf(),
            context.env_root().join("bin"),
        ];
        if let Some(host) = env::var_os("PATH") {
            search_path.extend(env::split_paths(&host));
        }
        let joined = env::join_paths(search_path)
            .map_err(|err| BuildError::Configuration(format!("Invalid PATH entry: {err}")))?;

        info!(program = %self.program, ?args, "Running external installer");
        let output = Command::new(&self.program)
            .args(&args)
            .env("PATH", joined)
            .current_dir(context.path())
            .output()
            .map_err(|err| {
                BuildError::Resolution(format!("failed to launch '{}': {err}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(BuildError::Resolution(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                tail.join("\n")
            )));
        }
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "Installer finished");
        Ok(())
    }
}

/// Output of the first stage.
#[derive(Debug)]
pub struct IsolatedEnvironment {
    pub context: BuildContext,
    pub interpreter: InterpreterSpec,
    pub packages: Vec<ResolvedPackage>,
    pub declared: Vec<String>,
    pub build_tools: Vec<String>,
}

impl IsolatedEnvironment {
    pub fn root(&self) -> &Path {
        self.context.env_root()
    }
}

/// Inputs of the first stage, with every path already resolved.
#[derive(Debug, Clone)]
pub struct EnvironmentRequest {
    pub manifest_path: PathBuf,
    pub interpreter: InterpreterSpec,
    pub backend: ResolverBackend,
    pub build_tools: Vec<String>,
    pub pins: Option<LockPins>,
}

impl EnvironmentRequest {
    /// Run the whole first stage. On failure the build context is dropped
    /// and nothing survives.
    pub fn build(&self) -> BuildResult<IsolatedEnvironment> {
        let manifest = DependencyManifest::load(&self.manifest_path)?;
        info!(
            manifest = %self.manifest_path.display(),
            requirements = manifest.requirements().len(),
            source = %self.backend.describe(),
            "Resolving dependencies"
        );

        let resolved = match &self.backend {
            ResolverBackend::LocalIndex(index) => resolve(&manifest, index, self.pins.as_ref())?,
            ResolverBackend::Command(_) => {
                if self.pins.is_some() {
                    return Err(BuildError::Configuration(
                        "lockfiles are only supported with the local-index resolver".into(),
                    ));
                }
                Vec::new()
            }
        };

        let context = BuildContext::create()?;
        provision_build_tools(&self.build_tools, &context)?;
        let python = install_interpreter(&self.interpreter, context.env_root())?;

        match &self.backend {
            ResolverBackend::LocalIndex(index) => {
                install_packages(&resolved, index, context.env_root())?
            }
            ResolverBackend::Command(installer) => {
                installer.install(&self.manifest_path, &context, &python)?
            }
        }

        Ok(IsolatedEnvironment {
            context,
            interpreter: self.interpreter.clone(),
            packages: resolved,
            declared: manifest
                .requirements()
                .iter()
                .map(|req| req.to_string())
                .collect(),
            build_tools: self.build_tools.clone(),
        })
    }
}

/// Pick one version per package, breadth-first in manifest order. Each
/// package gets the highest release its first requirement allows; later
/// requirements must accept that choice.
pub fn resolve(
    manifest: &DependencyManifest,
    index: &dyn PackageIndex,
    pins: Option<&LockPins>,
) -> BuildResult<Vec<ResolvedPackage>> {
    let mut queue: VecDeque<(Requirement, String)> = manifest
        .requirements()
        .iter()
        .cloned()
        .map(|req| (req, "manifest".to_string()))
        .collect();
    let mut selected: BTreeMap<String, ResolvedPackage> = BTreeMap::new();

    while let Some((requirement, origin)) = queue.pop_front() {
        if let Some(existing) = selected.get(&requirement.name) {
            if !requirement.constraint.matches(&existing.version) {
                return Err(BuildError::Resolution(format!(
                    "{origin} requires {requirement}, but {} {} was already selected",
                    existing.name, existing.version
                )));
            }
            continue;
        }

        let available = index.versions(&requirement.name)?;
        let pin = pins.and_then(|p| p.get(&requirement.name));
        let chosen = match (pins, pin) {
            (_, Some(pin)) => {
                if !available.contains(&pin.version) {
                    return Err(BuildError::Resolution(format!(
                        "locked {} {} is not published in {}",
                        requirement.name,
                        pin.version,
                        index.describe()
                    )));
                }
                if !requirement.constraint.matches(&pin.version) {
                    return Err(BuildError::Resolution(format!(
                        "locked {} {} does not satisfy {requirement} (from {origin})",
                        requirement.name, pin.version
                    )));
                }
                pin.version.clone()
            }
            (Some(_), None) => {
                return Err(BuildError::Resolution(format!(
                    "{} (from {origin}) is missing from the lockfile",
                    requirement.name
                )));
            }
            (None, None) => requirement
                .constraint
                .best_match(&available)
                .cloned()
                .ok_or_else(|| {
                    let mut listed: Vec<&Version> = available.iter().collect();
                    listed.sort();
                    let listed: Vec<String> = listed.iter().map(|v| v.to_string()).collect();
                    BuildError::Resolution(format!(
                        "no version of '{}' satisfies '{}' (requested by {origin}; available: {})",
                        requirement.name,
                        requirement.constraint,
                        if listed.is_empty() {
                            "none".to_string()
                        } else {
                            listed.join(", ")
                        }
                    ))
                })?,
        };

        let digest = index.digest(&requirement.name, &chosen)?;
        if let Some(pin) = pin
            && pin.digest != digest
        {
            return Err(BuildError::Resolution(format!(
                "{} {} changed since it was locked (expected {}, found {digest})",
                requirement.name, chosen, pin.digest
            )));
        }

        debug!(package = %requirement.name, version = %chosen, %origin, "Selected package");
        for dependency in index.requirements(&requirement.name, &chosen)? {
            queue.push_back((dependency, format!("{} {}", requirement.name, chosen)));
        }
        selected.insert(
            requirement.name.clone(),
            ResolvedPackage {
                name: requirement.name.clone(),
                version: chosen,
                digest,
            },
        );
    }

    Ok(selected.into_values().collect())
}

/// Merge every resolved package into the environment root, in name order.
pub fn install_packages(
    packages: &[ResolvedPackage],
    index: &dyn PackageIndex,
    env_root: &Path,
) -> BuildResult<()> {
    for package in packages {
        let source = index.package_root(&package.name, &package.version)?;
        let stats = copy_tree(&source, env_root, |_| false).map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                BuildError::Resolution(format!(
                    "installing {} {} would overwrite another package: {err}",
                    package.name, package.version
                ))
            } else {
                BuildError::io(
                    format!("Failed to install {} {}", package.name, package.version),
                    err,
                )
            }
        })?;
        info!(
            package = %package.name,
            version = %package.version,
            files = stats.files,
            "Installed package"
        );
    }
    Ok(())
}

/// Copy the pinned interpreter distribution into the environment.
pub fn install_interpreter(spec: &InterpreterSpec, env_root: &Path) -> BuildResult<PathBuf> {
    let distribution = spec.distribution.as_path();
    let binary = distribution.join("bin").join(&spec.name);
    if !binary.is_file() {
        return Err(BuildError::Resolution(format!(
            "interpreter distribution {} has no bin/{}",
            distribution.display(),
            spec.name
        )));
    }

    let version_file = distribution.join("VERSION");
    if version_file.is_file() {
        let declared = fs::read_to_string(&version_file).map_err(|err| {
            BuildError::io(format!("Failed to read {}", version_file.display()), err)
        })?;
        if declared.trim() != spec.version {
            return Err(BuildError::Resolution(format!(
                "interpreter distribution {} is version {}, recipe pins {}",
                distribution.display(),
                declared.trim(),
                spec.version
            )));
        }
    } else {
        warn!(
            distribution = %distribution.display(),
            "Interpreter distribution has no VERSION file; pinned version is not verified"
        );
    }

    copy_tree(distribution, env_root, |rel| rel == "VERSION").map_err(|err| {
        BuildError::io(
            format!("Failed to copy interpreter from {}", distribution.display()),
            err,
        )
    })?;
    Ok(env_root.join("bin").join(&spec.name))
}

/// Make each declared native build tool available under the context's
/// `tools/bin`, taking it from the host `PATH`.
pub fn provision_build_tools(tools: &[String], context: &BuildContext) -> BuildResult<()> {
    let host_path = env::var_os("PATH").unwrap_or_default();
    for tool in tools {
        let found = find_on_path(tool, &host_path).ok_or_else(|| {
            BuildError::Resolution(format!("build tool '{tool}' was not found on PATH"))
        })?;
        let dest = context.tools_bin().join(tool);
        link_or_copy(&found, &dest).map_err(|err| {
            BuildError::io(format!("Failed to provision build tool '{tool}'"), err)
        })?;
        debug!(tool = %tool, source = %found.display(), "Provisioned build tool");
    }
    Ok(())
}

fn find_on_path(name: &str, path: &OsString) -> Option<PathBuf> {
    env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn link_or_copy(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(not(unix))]
fn link_or_copy(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn publish(root: &Path, name: &str, version: &str, requires: Option<&str>) {
        let dir = root.join(name).join(version).join("lib/site-packages").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("__init__.py"), format!("VERSION = '{version}'\n")).unwrap();
        if let Some(requires) = requires {
            fs::write(root.join(name).join(format!("{version}.requires")), requires).unwrap();
        }
    }

    fn index_with_requests(root: &Path) -> LocalIndex {
        publish(root, "requests", "2.30.0", Some("urllib3<2\n"));
        publish(root, "requests", "2.31.0", Some("urllib3>=1.21.1,<3\n"));
        publish(root, "urllib3", "1.26.18", None);
        publish(root, "urllib3", "2.0.7", None);
        LocalIndex::open(root).unwrap()
    }

    #[test]
    fn resolves_transitive_requirements() {
        let temp = tempdir().unwrap();
        let index = index_with_requests(temp.path());
        let manifest = DependencyManifest::parse("requests==2.31.0\n").unwrap();
        let resolved = resolve(&manifest, &index, None).unwrap();
        let summary: Vec<_> = resolved
            .iter()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect();
        assert_eq!(summary, vec!["requests==2.31.0", "urllib3==2.0.7"]);
    }

    #[test]
    fn unsatisfiable_constraint_fails() {
        let temp = tempdir().unwrap();
        let index = index_with_requests(temp.path());
        let manifest = DependencyManifest::parse("requests==9.9.9\n").unwrap();
        let err = resolve(&manifest, &index, None).unwrap_err();
        match err {
            BuildError::Resolution(msg) => assert!(msg.contains("available: 2.30.0, 2.31.0")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn conflicting_requirements_fail() {
        let temp = tempdir().unwrap();
        let index = index_with_requests(temp.path());
        let manifest = DependencyManifest::parse("urllib3==2.0.7\nrequests==2.30.0\n").unwrap();
        let err = resolve(&manifest, &index, None).unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }

    #[test]
    fn pins_override_highest_match_and_detect_drift() {
        let temp = tempdir().unwrap();
        let index = index_with_requests(temp.path());
        let manifest = DependencyManifest::parse("requests>=2\n").unwrap();

        let old: Version = "2.30.0".parse().unwrap();
        let urllib: Version = "1.26.18".parse().unwrap();
        let mut packages = BTreeMap::new();
        packages.insert(
            "requests".to_string(),
            PinnedPackage {
                digest: index.digest("requests", &old).unwrap(),
                version: old.clone(),
            },
        );
        packages.insert(
            "urllib3".to_string(),
            PinnedPackage {
                digest: index.digest("urllib3", &urllib).unwrap(),
                version: urllib.clone(),
            },
        );
        let pins = LockPins::new(packages.clone());
        let resolved = resolve(&manifest, &index, Some(&pins)).unwrap();
        assert_eq!(resolved[0].version, old);

        packages.get_mut("urllib3").unwrap().digest = "0".repeat(64);
        let drifted = LockPins::new(packages);
        let err = resolve(&manifest, &index, Some(&drifted)).unwrap_err();
        assert!(err.to_string().contains("changed since it was locked"));
    }

    #[test]
    fn install_rejects_overlapping_packages() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("index");
        publish(&root, "alpha", "1.0", None);
        let clash = root.join("beta/1.0/lib/site-packages/alpha");
        fs::create_dir_all(&clash).unwrap();
        fs::write(clash.join("__init__.py"), "clash").unwrap();
        let index = LocalIndex::open(&root).unwrap();

        let manifest = DependencyManifest::parse("alpha\nbeta\n").unwrap();
        let resolved = resolve(&manifest, &index, None).unwrap();
        let env_root = temp.path().join("env");
        let err = install_packages(&resolved, &index, &env_root).unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }

    #[test]
    fn interpreter_version_must_match_pin() {
        let temp = tempdir().unwrap();
        let dist = temp.path().join("python");
        fs::create_dir_all(dist.join("bin")).unwrap();
        fs::write(dist.join("bin/python3"), "#!interp\n").unwrap();
        fs::write(dist.join("VERSION"), "3.12.1\n").unwrap();
        let spec = InterpreterSpec {
            name: "python3".into(),
            version: "3.11.9".into(),
            distribution: dist.clone(),
        };
        let env_root = temp.path().join("env");
        let err = install_interpreter(&spec, &env_root).unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }

    #[test]
    fn missing_build_tool_fails() {
        let context = BuildContext::create().unwrap();
        let err =
            provision_build_tools(&["slimstage-no-such-tool".to_string()], &context).unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }
}

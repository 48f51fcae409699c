use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BuildError, BuildResult};
use crate::manifest::{DependencyManifest, Requirement, normalize_name};
use crate::tree::tree_digest;
use crate::version::Version;

/// Source of installable packages for the resolver.
pub trait PackageIndex {
    fn describe(&self) -> String;

    /// All published versions of `name`, in no particular order.
    fn versions(&self, name: &str) -> BuildResult<Vec<Version>>;

    /// Requirements a published release declares for itself.
    fn requirements(&self, name: &str, version: &Version) -> BuildResult<Vec<Requirement>>;

    /// Directory tree merged into the environment root when installing.
    fn package_root(&self, name: &str, version: &Version) -> BuildResult<PathBuf>;

    fn digest(&self, name: &str, version: &Version) -> BuildResult<String> {
        let root = self.package_root(name, version)?;
        tree_digest(&root).map_err(|err| {
            BuildError::io(
                format!("Failed to hash package {name} {version} at {}", root.display()),
                err,
            )
        })
    }
}

/// Directory-backed index laid out as `<root>/<name>/<version>/`, with an
/// optional `<root>/<name>/<version>.requires` listing transitive requirements.
#[derive(Debug, Clone)]
pub struct LocalIndex {
    root: PathBuf,
}

impl LocalIndex {
    pub fn open(root: &Path) -> BuildResult<Self> {
        if !root.is_dir() {
            return Err(BuildError::Resolution(format!(
                "package index '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, name: &str) -> BuildResult<PathBuf> {
        let wanted = normalize_name(name);
        let entries = read_dir_sorted(&self.root)?;
        entries
            .into_iter()
            .find(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| normalize_name(n) == wanted)
                        .unwrap_or(false)
            })
            .ok_or_else(|| {
                BuildError::Resolution(format!(
                    "no package named '{wanted}' in index {}",
                    self.root.display()
                ))
            })
    }

    fn release_dirs(&self, name: &str) -> BuildResult<Vec<(Version, PathBuf)>> {
        let package_dir = self.package_dir(name)?;
        let mut releases = Vec::new();
        for path in read_dir_sorted(&package_dir)? {
            if !path.is_dir() {
                continue;
            }
            let Some(label) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match label.parse::<Version>() {
                Ok(version) => releases.push((version, path)),
                Err(err) => debug!(path = %path.display(), "Ignoring index entry: {err}"),
            }
        }
        Ok(releases)
    }

    fn release_dir(&self, name: &str, version: &Version) -> BuildResult<PathBuf> {
        self.release_dirs(name)?
            .into_iter()
            .find(|(candidate, _)| candidate == version)
            .map(|(_, path)| path)
            .ok_or_else(|| {
                BuildError::Resolution(format!(
                    "package '{}' has no release {version} in index {}",
                    normalize_name(name),
                    self.root.display()
                ))
            })
    }
}

impl PackageIndex for LocalIndex {
    fn describe(&self) -> String {
        format!("local index {}", self.root.display())
    }

    fn versions(&self, name: &str) -> BuildResult<Vec<Version>> {
        Ok(self
            .release_dirs(name)?
            .into_iter()
            .map(|(version, _)| version)
            .collect())
    }

    fn requirements(&self, name: &str, version: &Version) -> BuildResult<Vec<Requirement>> {
        let release = self.release_dir(name, version)?;
        let mut requires = release.clone().into_os_string();
        requires.push(".requires");
        let requires = PathBuf::from(requires);
        if !requires.is_file() {
            return Ok(Vec::new());
        }
        let manifest = DependencyManifest::load(&requires).map_err(|err| match err {
            BuildError::Resolution(msg) => BuildError::Resolution(format!(
                "{} {version} declares invalid requirements: {msg}",
                normalize_name(name)
            )),
            other => other,
        })?;
        Ok(manifest.requirements().to_vec())
    }

    fn package_root(&self, name: &str, version: &Version) -> BuildResult<PathBuf> {
        self.release_dir(name, version)
    }
}

fn read_dir_sorted(dir: &Path) -> BuildResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| BuildError::io(format!("Failed to list {}", dir.display()), err))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|err| BuildError::io(format!("Failed to list {}", dir.display()), err))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lists_versions_and_requirements() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("Requests/2.31.0/lib")).unwrap();
        fs::create_dir_all(root.join("Requests/2.30.0/lib")).unwrap();
        fs::create_dir_all(root.join("Requests/not-a-version")).unwrap();
        fs::write(root.join("Requests/2.31.0.requires"), "urllib3>=1.21.1,<3\n").unwrap();

        let index = LocalIndex::open(root).unwrap();
        let mut versions = index.versions("requests").unwrap();
        versions.sort();
        let labels: Vec<_> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(labels, vec!["2.30.0", "2.31.0"]);

        let latest: Version = "2.31.0".parse().unwrap();
        let requires = index.requirements("requests", &latest).unwrap();
        assert_eq!(requires.len(), 1);
        assert_eq!(requires[0].name, "urllib3");

        let older: Version = "2.30.0".parse().unwrap();
        assert!(index.requirements("requests", &older).unwrap().is_empty());
    }

    #[test]
    fn missing_package_is_a_resolution_error() {
        let temp = tempdir().unwrap();
        let index = LocalIndex::open(temp.path()).unwrap();
        let err = index.versions("absent").unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }
}

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::index::LocalIndex;
use crate::manifest::DependencyManifest;
use crate::recipe::{Recipe, ResolverSpec};
use crate::resolver::{LockPins, PinnedPackage, resolve};
use crate::version::Version;

pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildLock {
    pub lock_version: u32,
    pub generated_at: DateTime<Utc>,
    pub interpreter: LockedInterpreter,
    pub base: String,
    pub packages: BTreeMap<String, LockedPackage>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedInterpreter {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockedPackage {
    pub version: Version,
    pub digest: String,
}

impl BuildLock {
    pub fn pins(&self) -> LockPins {
        LockPins::new(
            self.packages
                .iter()
                .map(|(name, locked)| {
                    (
                        name.clone(),
                        PinnedPackage {
                            version: locked.version.clone(),
                            digest: locked.digest.clone(),
                        },
                    )
                })
                .collect(),
        )
    }

    /// The lock only applies to the recipe it was generated from: same
    /// interpreter pin, same base layer.
    pub fn check_recipe(&self, recipe: &Recipe) -> Result<()> {
        if self.lock_version != LOCK_VERSION {
            bail!("Unsupported lockfile version: {}", self.lock_version);
        }
        let interpreter = LockedInterpreter {
            name: recipe.interpreter.name.clone(),
            version: recipe.interpreter.version.clone(),
        };
        if self.interpreter != interpreter {
            bail!(
                "Lockfile was generated for {} {}, recipe pins {} {}",
                self.interpreter.name,
                self.interpreter.version,
                interpreter.name,
                interpreter.version
            );
        }
        if self.base != recipe.base.reference.trim() {
            bail!(
                "Lockfile was generated for base {}, recipe uses {}",
                self.base,
                recipe.base.reference
            );
        }
        Ok(())
    }
}

/// Resolve the recipe's manifest against its local index and write the
/// selected versions and digests to `path`.
pub fn generate_lock(recipe: &Recipe, base_dir: &Path, path: &Path) -> Result<BuildLock> {
    let ResolverSpec::LocalIndex { path: index_path } = &recipe.resolver else {
        bail!("Lockfiles require the local-index resolver");
    };
    let index = LocalIndex::open(&base_dir.join(index_path))?;
    let manifest = DependencyManifest::load(&recipe.manifest_path(base_dir))?;
    let resolved = resolve(&manifest, &index, None)?;

    let lock = BuildLock {
        lock_version: LOCK_VERSION,
        generated_at: Utc::now(),
        interpreter: LockedInterpreter {
            name: recipe.interpreter.name.clone(),
            version: recipe.interpreter.version.clone(),
        },
        base: recipe.base.reference.trim().to_string(),
        packages: resolved
            .into_iter()
            .map(|package| {
                (
                    package.name,
                    LockedPackage {
                        version: package.version,
                        digest: package.digest,
                    },
                )
            })
            .collect(),
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

pub fn load_lock(path: &Path) -> Result<BuildLock> {
    let file =
        File::open(path).with_context(|| format!("Failed to open lockfile: {}", path.display()))?;
    serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
}

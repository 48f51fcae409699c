//! Structural checks on a runtime artifact: no privileged identity or
//! setuid file, no shell or package manager reachable from `PATH`, no build
//! tool anywhere.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};
use crate::invoke::RuntimeConfig;
use crate::tree::{PRIVILEGE_BITS, file_mode, relative_path, rootfs_path};

pub static SHELLS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "sh", "bash", "dash", "ash", "zsh", "ksh", "csh", "tcsh", "fish", "busybox",
    ]
    .into_iter()
    .collect()
});

pub static PACKAGE_MANAGERS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "pip", "pip3", "apt", "apt-get", "dpkg", "apk", "yum", "dnf", "microdnf", "rpm",
    ]
    .into_iter()
    .collect()
});

fn is_tooling(name: &str) -> bool {
    SHELLS.contains(name) || PACKAGE_MANAGERS.contains(name)
}

/// In-image paths of shells and package managers found in any of the
/// `PATH` directories of the tree at `rootfs`.
pub fn find_tooling_on_path(rootfs: &Path, path_dirs: &[String]) -> io::Result<Vec<String>> {
    let mut found = Vec::new();
    for dir in path_dirs {
        let host_dir = rootfs_path(rootfs, dir);
        if !host_dir.is_dir() {
            continue;
        }
        let mut names: Vec<String> = fs::read_dir(&host_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| is_tooling(name))
            .collect();
        names.sort();
        found.extend(
            names
                .into_iter()
                .map(|name| format!("{}/{name}", dir.trim_end_matches('/'))),
        );
    }
    Ok(found)
}

/// Every path below `rootfs` whose file name is one of `tools`.
pub fn find_build_tools(rootfs: &Path, tools: &[String]) -> io::Result<Vec<String>> {
    if tools.is_empty() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(rootfs).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if tools.iter().any(|tool| tool.as_str() == name) {
            found.push(format!("/{}", relative_path(rootfs, entry.path())));
        }
    }
    Ok(found)
}

/// Every path below `rootfs` carrying a setuid or setgid bit.
pub fn find_privileged_modes(rootfs: &Path) -> io::Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(rootfs).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path_is_symlink() {
            continue;
        }
        let mode = file_mode(&entry.metadata().map_err(io::Error::other)?);
        if mode & PRIVILEGE_BITS != 0 {
            found.push(format!("/{}", relative_path(rootfs, entry.path())));
        }
    }
    Ok(found)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AuditReport {
    pub violations: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> BuildResult<()> {
        if self.is_clean() {
            return Ok(());
        }
        Err(BuildError::Assembly(format!(
            "artifact audit failed: {}",
            self.violations.join("; ")
        )))
    }
}

pub fn audit_artifact(
    rootfs: &Path,
    config: &RuntimeConfig,
    build_tools: &[String],
) -> BuildResult<AuditReport> {
    let mut report = AuditReport::default();

    match config.uid() {
        Some(0) => report
            .violations
            .push(format!("declared user '{}' is privileged", config.user())),
        Some(_) => {}
        None => report
            .violations
            .push(format!("declared user '{}' is not a uid:gid pair", config.user())),
    }

    let path_dirs = config.path_dirs();
    for tool in find_tooling_on_path(rootfs, &path_dirs)
        .map_err(|err| BuildError::io("Failed to audit PATH directories", err))?
    {
        report
            .violations
            .push(format!("{tool} is reachable from the default PATH"));
    }

    for path in find_privileged_modes(rootfs)
        .map_err(|err| BuildError::io("Failed to audit file modes", err))?
    {
        report
            .violations
            .push(format!("{path} carries a setuid or setgid bit"));
    }

    for tool in find_build_tools(rootfs, build_tools)
        .map_err(|err| BuildError::io("Failed to audit build tools", err))?
    {
        report
            .violations
            .push(format!("build tool {tool} leaked into the artifact"));
    }

    if report.is_clean() {
        info!(rootfs = %rootfs.display(), "Artifact audit passed");
    } else {
        for violation in &report.violations {
            warn!(rootfs = %rootfs.display(), "{violation}");
        }
    }
    Ok(report)
}

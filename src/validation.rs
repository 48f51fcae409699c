use std::path::{Component, Path};

use serde::Serialize;

use crate::assemble::{BaseReference, StripPolicy};
use crate::identity::ExecutionIdentity;
use crate::manifest::DependencyManifest;
use crate::recipe::{RECIPE_VERSION, Recipe, ResolverSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks that need nothing but the recipe itself.
pub fn validate_recipe(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != RECIPE_VERSION {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.entrypoint.as_os_str().is_empty() {
        report.errors.push("Entry point cannot be empty".into());
    } else {
        check_context_path(&mut report, "Entry point", &recipe.entrypoint);
    }
    check_context_path(&mut report, "Manifest", &recipe.manifest);

    let interpreter = &recipe.interpreter;
    if interpreter.name.trim().is_empty() || interpreter.name.contains('/') {
        report.errors.push(format!(
            "Interpreter name '{}' must be a bare executable name",
            interpreter.name
        ));
    }
    if interpreter.version.trim().is_empty() {
        report
            .errors
            .push("Interpreter version must be pinned".into());
    }

    if let Err(err) = recipe.base.reference.parse::<BaseReference>() {
        report.errors.push(err.to_string());
    }

    let identity = &recipe.identity;
    if let Err(err) = ExecutionIdentity::new(&identity.user, identity.uid, identity.gid) {
        report.errors.push(err.to_string());
    }

    check_image_dir(&mut report, "Working directory", &recipe.workdir);
    check_image_dir(&mut report, "Environment prefix", &recipe.environment.prefix);
    for dir in recipe
        .environment
        .path_prefix
        .iter()
        .chain(recipe.environment.base_path.iter())
    {
        check_image_path(&mut report, "PATH entry", dir);
    }

    if let Err(err) = StripPolicy::new(&recipe.strip) {
        report.errors.push(err.to_string());
    }

    for tool in &recipe.build_tools {
        if tool.trim().is_empty() || tool.contains('/') {
            report
                .errors
                .push(format!("Build tool '{tool}' must be a bare executable name"));
        }
    }

    match &recipe.resolver {
        ResolverSpec::LocalIndex { path } => {
            if path.as_os_str().is_empty() {
                report.errors.push("Local index path cannot be empty".into());
            }
        }
        ResolverSpec::Command { program, .. } => {
            if program.trim().is_empty() {
                report
                    .errors
                    .push("Resolver command program cannot be empty".into());
            }
            report.warnings.push(
                "Command resolver delegates version selection; builds cannot be locked".into(),
            );
        }
    }

    if recipe.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    report
}

fn check_image_dir(report: &mut ValidationReport, what: &str, dir: &str) {
    if check_image_path(report, what, dir) && dir.trim_matches('/').is_empty() {
        report
            .errors
            .push(format!("{what} cannot be the image root"));
    }
}

/// Absolute in-image path without `.` or `..` segments. Returns whether the
/// path passed.
fn check_image_path(report: &mut ValidationReport, what: &str, path: &str) -> bool {
    if !path.starts_with('/') {
        report
            .errors
            .push(format!("{what} '{path}' must be an absolute in-image path"));
        return false;
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        report
            .errors
            .push(format!("{what} '{path}' must not contain '.' or '..' segments"));
        return false;
    }
    true
}

/// Path relative to the build context that cannot leave it.
fn check_context_path(report: &mut ValidationReport, what: &str, path: &Path) {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        report.errors.push(format!(
            "{what} '{}' must stay inside the build context",
            path.display()
        ));
    }
}

pub fn validate_manifest(manifest: &DependencyManifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    if manifest.is_empty() {
        report
            .warnings
            .push("Manifest declares no dependencies".into());
    }
    for requirement in manifest.unpinned() {
        report.warnings.push(format!(
            "Requirement '{requirement}' (line {}) is not pinned to an exact version",
            requirement.line
        ));
    }
    report
}

/// Checks against the filesystem: every input the recipe points at exists.
pub fn validate_context(recipe: &Recipe, base_dir: &Path) -> ValidationReport {
    let mut report = ValidationReport::default();

    let entrypoint = recipe.entrypoint_path(base_dir);
    if !entrypoint.is_file() {
        report
            .errors
            .push(format!("Entry point {} does not exist", entrypoint.display()));
    }

    let manifest_path = recipe.manifest_path(base_dir);
    match DependencyManifest::load(&manifest_path) {
        Ok(manifest) => report.merge(validate_manifest(&manifest)),
        Err(err) => report.errors.push(err.to_string()),
    }

    let distribution = base_dir.join(&recipe.interpreter.distribution);
    if !distribution.join("bin").join(&recipe.interpreter.name).is_file() {
        report.errors.push(format!(
            "Interpreter distribution {} has no bin/{}",
            distribution.display(),
            recipe.interpreter.name
        ));
    }

    let base = base_dir.join(&recipe.base.path);
    if !base.is_dir() {
        report
            .errors
            .push(format!("Base layer directory {} does not exist", base.display()));
    }

    if let ResolverSpec::LocalIndex { path } = &recipe.resolver {
        let index = base_dir.join(path);
        if !index.is_dir() {
            report
                .errors
                .push(format!("Package index {} does not exist", index.display()));
        }
    }

    report
}

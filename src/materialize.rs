//! Second step of the first stage: make the isolated environment relocatable
//! under its fixed runtime prefix and fingerprint it.

use std::fs;
use std::path::{Component, Path};

use tracing::{debug, info};

use crate::error::{BuildError, BuildResult};
use crate::recipe::InterpreterSpec;
use crate::resolver::{BuildContext, IsolatedEnvironment, ResolvedPackage};
use crate::tree::{EntryKind, TreeEntry, digest_entries, scan_tree};

#[derive(Debug)]
pub struct MaterializedEnvironment {
    pub context: BuildContext,
    pub prefix: String,
    pub interpreter: InterpreterSpec,
    pub packages: Vec<ResolvedPackage>,
    pub declared: Vec<String>,
    pub build_tools: Vec<String>,
    pub entries: Vec<TreeEntry>,
    pub digest: String,
    pub rewritten: Vec<String>,
}

impl MaterializedEnvironment {
    pub fn root(&self) -> &Path {
        self.context.env_root()
    }
}

pub fn materialize(env: IsolatedEnvironment, prefix: &str) -> BuildResult<MaterializedEnvironment> {
    let root = env.root().to_path_buf();
    let needles = staging_needles(&root);

    let rewritten = rewrite_shebangs(&root, &needles, prefix)?;
    let entries = scan_tree(&root)
        .map_err(|err| BuildError::io(format!("Failed to scan {}", root.display()), err))?;

    for entry in &entries {
        match entry.kind {
            EntryKind::File => check_file(&root, entry, &needles)?,
            EntryKind::Symlink => check_symlink(entry, prefix)?,
            EntryKind::Dir => {}
        }
    }

    let digest = digest_entries(&entries);
    info!(
        prefix,
        entries = entries.len(),
        rewritten = rewritten.len(),
        digest = %digest,
        "Environment materialized"
    );

    Ok(MaterializedEnvironment {
        context: env.context,
        prefix: prefix.to_string(),
        interpreter: env.interpreter,
        packages: env.packages,
        declared: env.declared,
        build_tools: env.build_tools,
        entries,
        digest,
        rewritten,
    })
}

/// Spellings of the staging directory that must never survive into the
/// environment (the literal path and its canonical form).
fn staging_needles(root: &Path) -> Vec<Vec<u8>> {
    let mut needles = vec![root.to_string_lossy().into_owned()];
    if let Ok(canonical) = root.canonicalize() {
        let canonical = canonical.to_string_lossy().into_owned();
        if !needles.contains(&canonical) {
            needles.push(canonical);
        }
    }
    needles.into_iter().map(String::into_bytes).collect()
}

fn rewrite_shebangs(root: &Path, needles: &[Vec<u8>], prefix: &str) -> BuildResult<Vec<String>> {
    let bin = root.join("bin");
    let mut rewritten = Vec::new();
    if !bin.is_dir() {
        return Ok(rewritten);
    }

    let mut scripts: Vec<_> = fs::read_dir(&bin)
        .map_err(|err| BuildError::io(format!("Failed to list {}", bin.display()), err))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    scripts.sort();

    for script in scripts {
        let metadata = script
            .symlink_metadata()
            .map_err(|err| BuildError::io(format!("Failed to stat {}", script.display()), err))?;
        if !metadata.is_file() {
            continue;
        }
        let content = fs::read(&script)
            .map_err(|err| BuildError::io(format!("Failed to read {}", script.display()), err))?;
        if !content.starts_with(b"#!") {
            continue;
        }
        let line_end = content
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(content.len());
        let (first_line, rest) = content.split_at(line_end);
        let mut line = first_line.to_vec();
        let mut changed = false;
        for needle in needles {
            if let Some(updated) = replace_bytes(&line, needle, prefix.as_bytes()) {
                line = updated;
                changed = true;
            }
        }
        if !changed {
            continue;
        }
        line.extend_from_slice(rest);
        fs::write(&script, &line)
            .map_err(|err| BuildError::io(format!("Failed to rewrite {}", script.display()), err))?;
        let name = format!(
            "bin/{}",
            script.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        debug!(script = %name, "Rewrote interpreter line");
        rewritten.push(name);
    }
    Ok(rewritten)
}

fn check_file(root: &Path, entry: &TreeEntry, needles: &[Vec<u8>]) -> BuildResult<()> {
    let path = root.join(&entry.path);
    let content = fs::read(&path)
        .map_err(|err| BuildError::io(format!("Failed to read {}", path.display()), err))?;
    if needles.iter().any(|needle| contains_bytes(&content, needle)) {
        return Err(BuildError::Relocation(format!(
            "'{}' references the build-time staging directory",
            entry.path
        )));
    }
    Ok(())
}

fn check_symlink(entry: &TreeEntry, prefix: &str) -> BuildResult<()> {
    let target = entry.target.as_deref().unwrap_or_default();
    let target_path = Path::new(target);

    // Depth below the environment root that the walk over `rest` starts at.
    let (mut depth, rest): (i64, &Path) = if target_path.is_absolute() {
        match target_path.strip_prefix(prefix) {
            Ok(rest) => (0, rest),
            Err(_) => {
                return Err(BuildError::Relocation(format!(
                    "symlink '{}' points outside the environment to '{target}'",
                    entry.path
                )));
            }
        }
    } else {
        (entry.path.split('/').count() as i64 - 1, target_path)
    };

    for component in rest.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(BuildError::Relocation(format!(
                "symlink '{}' escapes the environment via '{target}'",
                entry.path
            )));
        }
    }
    Ok(())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if !contains_bytes(haystack, needle) {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut idx = 0;
    while idx < haystack.len() {
        if haystack[idx..].starts_with(needle) {
            out.extend_from_slice(replacement);
            idx += needle.len();
        } else {
            out.push(haystack[idx]);
            idx += 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::BuildContext;

    fn environment() -> IsolatedEnvironment {
        let context = BuildContext::create().unwrap();
        let root = context.env_root().to_path_buf();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib/site-packages/pkg")).unwrap();
        fs::write(root.join("bin/python3"), b"\x7fELF").unwrap();
        fs::write(root.join("lib/site-packages/pkg/__init__.py"), "x = 1\n").unwrap();
        IsolatedEnvironment {
            context,
            interpreter: InterpreterSpec {
                name: "python3".into(),
                version: "3.11.9".into(),
                distribution: "/unused".into(),
            },
            packages: Vec::new(),
            declared: Vec::new(),
            build_tools: Vec::new(),
        }
    }

    #[test]
    fn shebangs_are_rewritten_to_the_prefix() {
        let env = environment();
        let root = env.root().to_path_buf();
        fs::write(
            root.join("bin/tool"),
            format!("#!{}/bin/python3\nprint('hi')\n", root.display()),
        )
        .unwrap();

        let materialized = materialize(env, "/opt/venv").unwrap();
        assert_eq!(materialized.rewritten, vec!["bin/tool".to_string()]);
        let script = fs::read_to_string(materialized.root().join("bin/tool")).unwrap();
        assert_eq!(script, "#!/opt/venv/bin/python3\nprint('hi')\n");
    }

    #[test]
    fn embedded_staging_paths_are_rejected() {
        let env = environment();
        let root = env.root().to_path_buf();
        fs::write(
            root.join("lib/site-packages/pkg/paths.py"),
            format!("HOME = '{}'\n", root.display()),
        )
        .unwrap();
        let err = materialize(env, "/opt/venv").unwrap_err();
        assert!(matches!(err, BuildError::Relocation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_must_stay_inside_the_environment() {
        use std::os::unix::fs::symlink;

        let env = environment();
        let root = env.root().to_path_buf();
        symlink("python3", root.join("bin/python")).unwrap();
        symlink("/opt/venv/bin/python3", root.join("bin/py")).unwrap();
        assert!(materialize(env, "/opt/venv").is_ok());

        let env = environment();
        let root = env.root().to_path_buf();
        symlink("../../../etc/passwd", root.join("bin/escape")).unwrap();
        let err = materialize(env, "/opt/venv").unwrap_err();
        assert!(matches!(err, BuildError::Relocation(_)));

        let env = environment();
        let root = env.root().to_path_buf();
        symlink("/usr/bin/python3", root.join("bin/host")).unwrap();
        assert!(materialize(env, "/opt/venv").is_err());

        let env = environment();
        let root = env.root().to_path_buf();
        symlink("/opt/venv/../../bin/sh", root.join("bin/shell")).unwrap();
        let err = materialize(env, "/opt/venv").unwrap_err();
        assert!(matches!(err, BuildError::Relocation(_)), "{err}");

        let env = environment();
        let root = env.root().to_path_buf();
        symlink("/opt/venv/lib/../bin/python3", root.join("bin/python-lib")).unwrap();
        assert!(materialize(env, "/opt/venv").is_ok());
    }

    #[test]
    fn digest_is_stable_across_contexts() {
        let first = materialize(environment(), "/opt/venv").unwrap();
        let second = materialize(environment(), "/opt/venv").unwrap();
        assert_eq!(first.digest, second.digest);
    }
}

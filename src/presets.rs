use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::recipe::{
    BaseSpec, EnvironmentSpec, IdentitySpec, InterpreterSpec, OutputSpec, RECIPE_VERSION, Recipe,
    ResolverSpec,
};

const PLACEHOLDER_DIGEST: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

pub const PRESETS: &[&str] = &["python", "batch"];

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "python" => python_preset(),
        "batch" => batch_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Long-running service: unbuffered output, local index, no build tools.
fn python_preset() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        context: PathBuf::from("."),
        manifest: PathBuf::from("requirements.txt"),
        entrypoint: PathBuf::from("main.py"),
        interpreter: interpreter(),
        resolver: ResolverSpec::LocalIndex {
            path: PathBuf::from("./index"),
        },
        base: base(),
        build_tools: Vec::new(),
        environment: EnvironmentSpec::default(),
        identity: identity(),
        workdir: "/app".into(),
        strip: vec!["share/doc".into(), "share/man".into()],
        output: OutputSpec {
            directory: PathBuf::from("./out/python"),
        },
    }
}

/// Batch job: dependencies installed by an external installer, native
/// compiler available during resolution only.
fn batch_preset() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        context: PathBuf::from("./job"),
        manifest: PathBuf::from("requirements.txt"),
        entrypoint: PathBuf::from("run.py"),
        interpreter: interpreter(),
        resolver: ResolverSpec::Command {
            program: "pip".into(),
            args: vec![
                "install".into(),
                "--no-cache-dir".into(),
                "--prefix".into(),
                "{env}".into(),
                "-r".into(),
                "{manifest}".into(),
            ],
        },
        base: base(),
        build_tools: vec!["cc".into()],
        environment: EnvironmentSpec {
            unbuffered: false,
            ..EnvironmentSpec::default()
        },
        identity: IdentitySpec {
            user: "batch".into(),
            uid: 10002,
            gid: 10002,
        },
        workdir: "/job".into(),
        strip: vec!["share/doc".into(), "include".into()],
        output: OutputSpec {
            directory: PathBuf::from("./out/batch"),
        },
    }
}

fn interpreter() -> InterpreterSpec {
    InterpreterSpec {
        name: "python3".into(),
        version: "3.11.9".into(),
        distribution: PathBuf::from("./toolchain/python-3.11.9"),
    }
}

fn base() -> BaseSpec {
    BaseSpec {
        reference: format!("runtime-base@sha256:{PLACEHOLDER_DIGEST}"),
        path: PathBuf::from("./layers/runtime-base"),
    }
}

fn identity() -> IdentitySpec {
    IdentitySpec {
        user: "app".into(),
        uid: 10001,
        gid: 10001,
    }
}

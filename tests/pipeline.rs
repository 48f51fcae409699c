mod fixture;

use std::fs::{self, File};
use std::path::Path;

use slimstage::artifact::{LAYER_FILE, ROOTFS_DIR, verify_artifact};
use slimstage::audit::find_tooling_on_path;
use slimstage::lockfile::generate_lock;
use slimstage::pipeline::{BuildPlan, PipelineResult, build_pipeline};
use slimstage::recipe::Recipe;
use slimstage::resolver::LockPins;
use slimstage::{BuildError, BuildResult};

fn build(recipe_path: &Path, pins: Option<LockPins>) -> BuildResult<PipelineResult> {
    let recipe = Recipe::load(recipe_path)?;
    let plan = BuildPlan::from_recipe(&recipe, &Recipe::base_dir(recipe_path), pins)?;
    build_pipeline(plan).execute()
}

#[test]
fn builds_a_minimal_non_root_artifact() {
    let ws = fixture::workspace();
    let recipe = Recipe::load(&ws.recipe_path()).unwrap();
    let plan = BuildPlan::from_recipe(&recipe, ws.root(), None).unwrap();
    let executor = build_pipeline(plan);
    let result = executor.execute().unwrap();
    let artifact = &result.artifact;

    assert_eq!(artifact.dir, ws.output());
    assert!(artifact.artifact_id.starts_with("sha256:"));
    assert_eq!(
        artifact.config.cmd(),
        ["/opt/venv/bin/python3", "/app/main.py"]
    );
    assert_eq!(artifact.config.user(), "10001:10001");
    assert_eq!(artifact.config.working_dir(), "/app");
    assert_eq!(artifact.config.path_dirs()[0], "/opt/venv/bin");
    assert!(artifact.config.env().contains(&"PYTHONUNBUFFERED=1".to_string()));

    let packages: Vec<String> = artifact
        .report
        .packages
        .iter()
        .map(|p| format!("{}=={}", p.name, p.version))
        .collect();
    assert_eq!(packages, vec!["requests==2.31.0", "urllib3==2.0.7"]);

    let rootfs = ws.output().join(ROOTFS_DIR);
    assert_eq!(
        fs::read_to_string(rootfs.join("app/main.py")).unwrap(),
        "print(\"ok\")\n"
    );
    assert!(rootfs.join("opt/venv/bin/python3").is_file());
    assert!(
        rootfs
            .join("opt/venv/lib/python3.11/site-packages/requests/__init__.py")
            .is_file()
    );
    assert!(!rootfs.join("opt/venv/bin/pip3").exists());
    assert!(!rootfs.join("opt/venv/lib/python3.11/__pycache__").exists());
    assert!(!rootfs.join("opt/venv/VERSION").exists());
    assert!(artifact.report.stripped.contains(&"bin/pip3".to_string()));

    let passwd = fs::read_to_string(rootfs.join("etc/passwd")).unwrap();
    assert!(passwd.contains("app:x:10001:10001:"));
    let tooling = find_tooling_on_path(&rootfs, &artifact.config.path_dirs()).unwrap();
    assert!(tooling.is_empty(), "{tooling:?}");

    assert!(!ws.partial().exists());
    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.stages.len(), 5);
    assert_eq!(snapshot.stages["declare-entrypoint"].calls, 1);
    assert_eq!(snapshot.builds_succeeded, 1);
    assert!(snapshot.files_stripped >= 2);
}

#[test]
fn rebuilding_unchanged_inputs_is_reproducible() {
    let ws = fixture::workspace();
    let first = build(&ws.recipe_path(), None).unwrap().artifact;

    let second_recipe = ws.recipe_yaml().replace("./out", "./out-again");
    let second = build(&ws.write_recipe(&second_recipe), None).unwrap().artifact;

    assert_eq!(
        first.report.environment_digest,
        second.report.environment_digest
    );
    assert_eq!(first.report.layer_digest, second.report.layer_digest);
    assert_eq!(first.artifact_id, second.artifact_id);
}

#[test]
fn layer_assigns_entrypoint_to_the_identity() {
    let ws = fixture::workspace();
    build(&ws.recipe_path(), None).unwrap();

    let mut archive = tar::Archive::new(File::open(ws.output().join(LAYER_FILE)).unwrap());
    let mut checked = 0;
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let uid = entry.header().uid().unwrap();
        match path.trim_end_matches('/') {
            "app" | "app/main.py" => {
                assert_eq!(uid, 10001, "{path}");
                checked += 1;
            }
            "opt/venv/bin/python3" | "etc/passwd" => {
                assert_eq!(uid, 0, "{path}");
                checked += 1;
            }
            _ => {}
        }
        assert_eq!(entry.header().mtime().unwrap(), 0);
    }
    assert_eq!(checked, 4);
}

#[test]
fn missing_entrypoint_fails_before_the_final_stage_exists() {
    let ws = fixture::workspace();
    fs::remove_file(ws.root().join("app/main.py")).unwrap();

    let err = build(&ws.recipe_path(), None).unwrap_err();
    assert!(matches!(err, BuildError::Assembly(_)), "{err}");
    assert!(!ws.output().exists());
    assert!(!ws.partial().exists());
}

#[test]
fn failed_rebuild_keeps_the_previous_artifact() {
    let ws = fixture::workspace();
    let first = build(&ws.recipe_path(), None).unwrap().artifact;

    ws.write("app/requirements.txt", "requests==9.9.9\n");
    assert!(build(&ws.recipe_path(), None).is_err());

    let digest = fs::read_to_string(ws.output().join("artifact.digest")).unwrap();
    assert_eq!(digest.trim(), first.artifact_id);
    assert!(!ws.partial().exists());
}

#[test]
fn unsatisfiable_constraint_fails_during_resolution() {
    let ws = fixture::workspace();
    ws.write("app/requirements.txt", "requests==9.9.9\n");

    let err = build(&ws.recipe_path(), None).unwrap_err();
    match err {
        BuildError::Resolution(msg) => assert!(msg.contains("requests"), "{msg}"),
        other => panic!("expected a resolution error, got {other}"),
    }
    assert!(!ws.output().exists());
}

#[test]
fn privileged_identities_are_rejected() {
    let ws = fixture::workspace();
    for identity in [
        "{ user: app, uid: 0, gid: 10001 }",
        "{ user: root, uid: 10001, gid: 10001 }",
    ] {
        let yaml = ws
            .recipe_yaml()
            .replace("{ user: app, uid: 10001, gid: 10001 }", identity);
        let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)), "{err}");
    }
}

#[test]
fn floating_base_references_are_rejected() {
    let ws = fixture::workspace();
    let yaml = ws
        .recipe_yaml()
        .replace(&ws.base_reference(), "runtime-base:latest");
    let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
    assert!(matches!(err, BuildError::Configuration(_)), "{err}");
}

#[test]
fn modified_base_layer_is_rejected() {
    let ws = fixture::workspace();
    ws.write("base/etc/motd", "changed\n");

    let err = build(&ws.recipe_path(), None).unwrap_err();
    assert!(matches!(err, BuildError::Assembly(_)), "{err}");
    assert!(!ws.partial().exists());
}

#[test]
fn base_layer_with_a_shell_is_rejected() {
    let ws = fixture::workspace();
    ws.write("base/bin/sh", "shell\n");
    // Pin the tampered layer so only the tooling check can fail.
    ws.write_recipe(&ws.recipe_yaml());

    let err = build(&ws.recipe_path(), None).unwrap_err();
    match err {
        BuildError::Assembly(msg) => assert!(msg.contains("/bin/sh"), "{msg}"),
        other => panic!("expected an assembly error, got {other}"),
    }
}

#[cfg(unix)]
#[test]
fn build_tools_are_available_but_never_shipped() {
    let ws = fixture::workspace();
    let yaml = ws.recipe_yaml().replace("output:", "build_tools: [\"true\"]\noutput:");
    let artifact = build(&ws.write_recipe(&yaml), None).unwrap().artifact;

    assert_eq!(artifact.report.build_tools, vec!["true".to_string()]);
    let leaked = slimstage::audit::find_build_tools(
        &ws.output().join(ROOTFS_DIR),
        &artifact.report.build_tools,
    )
    .unwrap();
    assert!(leaked.is_empty());
}

#[test]
fn missing_build_tool_is_a_resolution_error() {
    let ws = fixture::workspace();
    let yaml = ws
        .recipe_yaml()
        .replace("output:", "build_tools: [slimstage-missing-compiler]\noutput:");
    let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
    assert!(matches!(err, BuildError::Resolution(_)), "{err}");
}

#[test]
fn locked_builds_detect_index_drift() {
    let ws = fixture::workspace();
    let recipe = Recipe::load(&ws.recipe_path()).unwrap();
    let lock = generate_lock(&recipe, ws.root(), &ws.root().join("slimstage.lock")).unwrap();
    assert_eq!(lock.packages.len(), 2);

    build(&ws.recipe_path(), Some(lock.pins())).unwrap();

    ws.write(
        "index/urllib3/2.0.7/lib/python3.11/site-packages/urllib3/__init__.py",
        "__version__ = 'patched'\n",
    );
    let err = build(&ws.recipe_path(), Some(lock.pins())).unwrap_err();
    match err {
        BuildError::Resolution(msg) => assert!(msg.contains("changed since it was locked"), "{msg}"),
        other => panic!("expected a resolution error, got {other}"),
    }
}

#[test]
fn verify_flags_tampered_artifacts() {
    let ws = fixture::workspace();
    build(&ws.recipe_path(), None).unwrap();
    assert!(verify_artifact(&ws.output()).unwrap().is_clean());

    ws.write("out/rootfs/usr/bin/bash", "shell\n");
    let audit = verify_artifact(&ws.output()).unwrap();
    assert!(!audit.is_clean());
    assert!(audit.violations.iter().any(|v| v.contains("/usr/bin/bash")));
}

#[test]
fn image_paths_cannot_traverse_out_of_the_rootfs() {
    let ws = fixture::workspace();
    for section in [
        "workdir: /../../escaped",
        "workdir: /app/./nested",
        "environment: { prefix: /opt/../venv }",
        "environment: { path_prefix: [\"/opt/venv/../../bin\"] }",
    ] {
        let yaml = ws
            .recipe_yaml()
            .replace("output:", &format!("{section}\noutput:"));
        let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)), "{section}: {err}");
    }
    assert!(!ws.root().join("escaped").exists());
    assert!(!ws.output().exists());
}

#[test]
fn entrypoint_and_manifest_stay_inside_the_context() {
    let ws = fixture::workspace();
    for (from, to) in [
        ("entrypoint: main.py", "entrypoint: ../recipe.yaml"),
        ("entrypoint: main.py", "entrypoint: /etc/hostname"),
        ("context: ./app", "context: ./app\nmanifest: ../app/requirements.txt"),
    ] {
        let yaml = ws.recipe_yaml().replace(from, to);
        let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
        match err {
            BuildError::Configuration(msg) => {
                assert!(msg.contains("inside the build context"), "{msg}")
            }
            other => panic!("expected a configuration error, got {other}"),
        }
    }
}

#[cfg(unix)]
#[test]
fn setuid_bits_never_reach_the_layer() {
    use std::os::unix::fs::PermissionsExt;

    let ws = fixture::workspace();
    let helper = "index/urllib3/2.0.7/lib/python3.11/site-packages/urllib3/helper";
    ws.write(helper, "\u{7f}ELF helper\n");
    fs::set_permissions(ws.root().join(helper), fs::Permissions::from_mode(0o4755)).unwrap();

    build(&ws.recipe_path(), None).unwrap();

    let in_image = "opt/venv/lib/python3.11/site-packages/urllib3/helper";
    let copied = fs::metadata(ws.output().join(ROOTFS_DIR).join(in_image)).unwrap();
    assert_eq!(copied.permissions().mode() & 0o7777, 0o755);

    let mut archive = tar::Archive::new(File::open(ws.output().join(LAYER_FILE)).unwrap());
    let mut seen = false;
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        assert_eq!(entry.header().mode().unwrap() & 0o6000, 0);
        if entry.path().unwrap().to_string_lossy() == in_image {
            assert_eq!(entry.header().mode().unwrap(), 0o755);
            seen = true;
        }
    }
    assert!(seen);
    assert!(verify_artifact(&ws.output()).unwrap().is_clean());
}

#[test]
fn path_prefix_exposing_a_shell_fails_the_audit() {
    let ws = fixture::workspace();
    ws.write("base/tools/sh", "shell\n");
    let yaml = ws.recipe_yaml().replace(
        "output:",
        "environment: { path_prefix: [\"/tools\"] }\noutput:",
    );
    let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
    match err {
        BuildError::Assembly(msg) => assert!(msg.contains("/tools/sh"), "{msg}"),
        other => panic!("expected an assembly error, got {other}"),
    }
    assert!(!ws.output().exists());
    assert!(!ws.partial().exists());
}

#[cfg(unix)]
#[test]
fn failing_command_resolver_is_a_resolution_error() {
    let ws = fixture::workspace();
    let yaml = ws.recipe_yaml().replace(
        "resolver: { kind: local-index, path: ./index }",
        "resolver: { kind: command, program: \"false\", args: [\"{manifest}\"] }",
    );
    let err = build(&ws.write_recipe(&yaml), None).unwrap_err();
    match err {
        BuildError::Resolution(msg) => assert!(msg.contains("'false' exited"), "{msg}"),
        other => panic!("expected a resolution error, got {other}"),
    }
    assert!(!ws.output().exists());
}

#[test]
fn conflicting_account_in_the_base_fails_privilege_reduction() {
    let ws = fixture::workspace();
    ws.write(
        "base/etc/passwd",
        "root:x:0:0:root:/root:/sbin/nologin\napp:x:5000:5000:app:/home/app:/sbin/nologin\n",
    );
    let err = build(&ws.write_recipe(&ws.recipe_yaml()), None).unwrap_err();
    match err {
        BuildError::Assembly(msg) => assert!(msg.contains("different ids"), "{msg}"),
        other => panic!("expected an assembly error, got {other}"),
    }
    assert!(!ws.output().exists());
}

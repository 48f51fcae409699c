#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use slimstage::tree::tree_digest;
use tempfile::{TempDir, tempdir};

/// A self-contained build context: application, package index, interpreter
/// distribution, pinned base layer and a recipe tying them together.
pub struct Workspace {
    temp: TempDir,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn recipe_path(&self) -> PathBuf {
        self.root().join("recipe.yaml")
    }

    pub fn output(&self) -> PathBuf {
        self.root().join("out")
    }

    pub fn partial(&self) -> PathBuf {
        self.root().join("out.partial")
    }

    pub fn base_reference(&self) -> String {
        let digest = tree_digest(&self.root().join("base")).unwrap();
        format!("runtime-base@sha256:{digest}")
    }

    /// Recipe text for the current state of the base layer.
    pub fn recipe_yaml(&self) -> String {
        format!(
            r#"version: 1
context: ./app
entrypoint: main.py
interpreter: {{ name: python3, version: "3.11.9", distribution: ./toolchain }}
resolver: {{ kind: local-index, path: ./index }}
base: {{ reference: "{base}", path: ./base }}
identity: {{ user: app, uid: 10001, gid: 10001 }}
output: {{ directory: ./out }}
"#,
            base = self.base_reference()
        )
    }

    pub fn write_recipe(&self, yaml: &str) -> PathBuf {
        let path = self.recipe_path();
        fs::write(&path, yaml).unwrap();
        path
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn publish(root: &Path, name: &str, version: &str, requires: Option<&str>) {
    let dir = root
        .join("index")
        .join(name)
        .join(version)
        .join("lib/python3.11/site-packages")
        .join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("__init__.py"), format!("__version__ = '{version}'\n")).unwrap();
    if let Some(requires) = requires {
        fs::write(
            root.join("index").join(name).join(format!("{version}.requires")),
            requires,
        )
        .unwrap();
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

pub fn workspace() -> Workspace {
    let ws = Workspace { temp: tempdir().unwrap() };
    let root = ws.root().to_path_buf();

    ws.write("app/main.py", "print(\"ok\")\n");
    ws.write("app/requirements.txt", "# runtime dependencies\nrequests==2.31.0\n");

    publish(&root, "requests", "2.30.0", Some("urllib3>=1.21.1,<2\n"));
    publish(&root, "requests", "2.31.0", Some("urllib3>=1.21.1,<3\n"));
    publish(&root, "urllib3", "1.26.18", None);
    publish(&root, "urllib3", "2.0.7", None);

    ws.write("toolchain/VERSION", "3.11.9\n");
    ws.write("toolchain/bin/python3", "\u{7f}ELF interpreter\n");
    ws.write("toolchain/bin/pip3", "pip entry point\n");
    ws.write("toolchain/lib/python3.11/os.py", "sep = '/'\n");
    ws.write(
        "toolchain/lib/python3.11/__pycache__/os.cpython-311.pyc",
        "compiled",
    );
    make_executable(&root.join("toolchain/bin/python3"));
    make_executable(&root.join("toolchain/bin/pip3"));

    ws.write("base/etc/passwd", "root:x:0:0:root:/root:/sbin/nologin\n");
    ws.write("base/etc/group", "root:x:0:\n");
    ws.write("base/usr/lib/os-release", "ID=runtime-base\n");

    ws.write_recipe(&ws.recipe_yaml());
    ws
}

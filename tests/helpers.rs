//! Shared test utilities for rdgen tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rdgen::host::{DmDevice, FixedHost};
use rdgen::module::Registry;
use rdgen::Generator;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Test environment with a temporary build directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Build destination
    pub build_dir: PathBuf,
    /// Scratch space for key and header files
    pub files: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let build_dir = temp_dir.path().join("build");
        let files = temp_dir.path().join("files");
        fs::create_dir_all(&files).expect("Failed to create files dir");
        Self {
            _temp_dir: temp_dir,
            build_dir,
            files,
        }
    }

    /// Config keys every test build needs, merged under `extra`.
    pub fn config(&self, extra: Value) -> Value {
        let mut config = json!({
            "build_dir": self.build_dir.to_string_lossy(),
            "check_shell_syntax": false,
        });
        if let (Some(base), Value::Object(extra)) = (config.as_object_mut(), extra) {
            for (key, value) in extra {
                base.insert(key, value);
            }
        }
        config
    }

    /// Write a scratch file and return its path as a string.
    pub fn write_file(&self, name: &str, contents: &str) -> String {
        let path = self.files.join(name);
        fs::write(&path, contents).expect("Failed to write scratch file");
        path.to_string_lossy().into_owned()
    }
}

/// Generator over the built-in modules and a canned host.
pub fn generator(host: FixedHost) -> Generator {
    Generator::new(Registry::builtin(), Box::new(host)).expect("Failed to create generator")
}

/// LUKS2 metadata with aes-xts and pbkdf2 keyslots.
pub const PBKDF2_HEADER: &str = r#"{
    "keyslots": {"0": {"area": {"encryption": "aes-xts-plain64"}, "af": {"hash": "sha256"}, "kdf": {"type": "pbkdf2"}}},
    "segments": {"0": {"encryption": "aes-xts-plain64"}},
    "digests": {"0": {"hash": "sha256"}}
}"#;

/// Host where `/dev/mapper/<name>` is an open LUKS2 mapping of
/// `/dev/sda2`, which carries the given UUID and PARTUUID.
pub fn luks_host(name: &str, uuid: &str, partuuid: &str) -> FixedHost {
    let mut host = FixedHost {
        blkid: format!(
            "/dev/sda2: UUID=\"{}\" TYPE=\"crypto_LUKS\" PARTUUID=\"{}\"\n",
            uuid, partuuid
        ),
        proc_crypto: "name : xts(aes)\ndriver : xts(aes-generic)\nmodule : xts\n\n\
                      name : sha256\ndriver : sha256-generic\nmodule : kernel\n"
            .into(),
        paths: Some(Vec::new()),
        ..Default::default()
    };
    host.luks_json.insert("/dev/sda2".into(), PBKDF2_HEADER.into());
    host.luks_debug.insert("/dev/sda2".into(), format!("UUID:\t{}\n", uuid));
    host.dm.insert(
        "dm-0".into(),
        DmDevice {
            name: name.into(),
            uuid: format!("CRYPT-LUKS2-{}-{}", uuid.replace('-', ""), name),
            slaves: vec!["sda2".into()],
        },
    );
    host
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read file {}: {}", path.display(), e));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

//! Host inspection.
//!
//! Everything the generator learns about the build machine (device-mapper
//! state, block device tokens, LUKS headers, crypto capabilities) comes
//! through the [`Host`] trait. [`SystemHost`] runs the real commands;
//! tests substitute [`FixedHost`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::process::{self, Cmd};

/// A device-mapper device, as found under `/sys/devices/virtual/block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmDevice {
    /// Mapped name (`/dev/mapper/<name>`).
    pub name: String,
    /// DM uuid, `CRYPT-LUKS2-...` for LUKS mappings.
    pub uuid: String,
    /// Underlying block devices, kernel names (`sda2`, `dm-1`).
    pub slaves: Vec<String>,
}

/// Tokens reported by `blkid` for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkidInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partuuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
}

impl BlkidInfo {
    /// Look up a token by its lowercase config name.
    pub fn token(&self, name: &str) -> Option<&str> {
        match name {
            "uuid" => self.uuid.as_deref(),
            "partuuid" => self.partuuid.as_deref(),
            "label" => self.label.as_deref(),
            "type" => self.fs_type.as_deref(),
            _ => None,
        }
    }
}

/// Source of host facts.
pub trait Host {
    /// Device-mapper devices keyed by kernel name (`dm-0`).
    fn dm_devices(&self) -> Result<BTreeMap<String, DmDevice>>;

    /// Raw `blkid` output.
    fn blkid(&self) -> Result<String>;

    /// `cryptsetup luksDump --dump-json-metadata` of a device or header file.
    fn luks_dump_json(&self, device: &str) -> Result<String>;

    /// `cryptsetup luksDump --debug`, used only to recover the header UUID.
    fn luks_dump_debug(&self, device: &str) -> Result<String>;

    /// `cryptsetup --debug` output that names the crypto backend.
    fn cryptsetup_debug(&self) -> Result<String>;

    /// Contents of `/proc/crypto`.
    fn proc_crypto(&self) -> Result<String>;

    /// `openssl list -kdf-algorithms`.
    fn openssl_kdfs(&self) -> Result<String>;

    /// `libgcrypt-config --version`.
    fn gcrypt_version(&self) -> Result<String>;

    /// Shared libraries a binary links against.
    fn library_deps(&self, binary: &str) -> Result<Vec<String>>;

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// The machine the generator runs on.
#[derive(Debug, Clone)]
pub struct SystemHost {
    timeout: Duration,
    sysfs_block: PathBuf,
}

impl SystemHost {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sysfs_block: PathBuf::from("/sys/devices/virtual/block"),
        }
    }

    fn cmd(&self, program: &str) -> Cmd {
        Cmd::new(program).timeout(self.timeout)
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(process::DEFAULT_TIMEOUT)
    }
}

impl Host for SystemHost {
    fn dm_devices(&self) -> Result<BTreeMap<String, DmDevice>> {
        let mut devices = BTreeMap::new();
        let entries = match fs::read_dir(&self.sysfs_block) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(devices),
            Err(e) => return Err(Error::io(&self.sysfs_block, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.sysfs_block, e))?;
            let kernel_name = entry.file_name().to_string_lossy().into_owned();
            if !kernel_name.starts_with("dm-") {
                continue;
            }
            let dir = entry.path();
            let read = |p: PathBuf| {
                fs::read_to_string(&p)
                    .map(|s| s.trim().to_string())
                    .map_err(|e| Error::io(p, e))
            };
            let name = read(dir.join("dm/name"))?;
            let uuid = read(dir.join("dm/uuid"))?;
            let slaves_dir = dir.join("slaves");
            let mut slaves: Vec<String> = fs::read_dir(&slaves_dir)
                .map_err(|e| Error::io(&slaves_dir, e))?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            slaves.sort();
            debug!(kernel_name, name, uuid, ?slaves, "found device-mapper device");
            devices.insert(kernel_name, DmDevice { name, uuid, slaves });
        }
        Ok(devices)
    }

    fn blkid(&self) -> Result<String> {
        Ok(self
            .cmd("blkid")
            .error_msg("blkid failed. Install: util-linux")
            .run()?
            .stdout)
    }

    fn luks_dump_json(&self, device: &str) -> Result<String> {
        let result = self
            .cmd("cryptsetup")
            .args(["luksDump", "--dump-json-metadata", device])
            .quiet()
            .run()?;
        Ok(result.stdout)
    }

    fn luks_dump_debug(&self, device: &str) -> Result<String> {
        let result = self
            .cmd("cryptsetup")
            .args(["luksDump", "--debug", device])
            .quiet()
            .run()?;
        Ok(result.stdout)
    }

    fn cryptsetup_debug(&self) -> Result<String> {
        // Dumping a non-LUKS file fails, but the backend line is printed first.
        let result = self
            .cmd("cryptsetup")
            .args(["--debug", "luksDump", "/dev/null"])
            .allow_fail()
            .quiet()
            .run()?;
        Ok(result.stdout)
    }

    fn proc_crypto(&self) -> Result<String> {
        fs::read_to_string("/proc/crypto").map_err(|e| Error::io("/proc/crypto", e))
    }

    fn openssl_kdfs(&self) -> Result<String> {
        Ok(self.cmd("openssl").args(["list", "-kdf-algorithms"]).run()?.stdout)
    }

    fn gcrypt_version(&self) -> Result<String> {
        Ok(self.cmd("libgcrypt-config").arg("--version").run()?.stdout)
    }

    fn library_deps(&self, binary: &str) -> Result<Vec<String>> {
        let path = process::which(binary).ok_or_else(|| Error::Command {
            program: binary.to_string(),
            message: "not found in PATH".to_string(),
        })?;
        let output = self
            .cmd("ldd")
            .arg_path(&path)
            .error_msg(format!("Unable to list libraries of {}", binary))
            .run()?;
        Ok(parse_ldd_output(&output.stdout))
    }
}

/// Parse ldd output into library paths.
/// Libraries that are "not found" are returned by name.
pub fn parse_ldd_output(output: &str) -> Vec<String> {
    let mut libs = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if line.contains("not found") {
            if let Some(lib_name) = line.split_whitespace().next() {
                libs.push(lib_name.to_string());
            }
            continue;
        }

        if let Some(path_part) = line.split("=>").nth(1) {
            if let Some(path) = path_part.split_whitespace().next() {
                if path.starts_with('/') {
                    libs.push(path.to_string());
                }
            }
        } else if line.starts_with('/') {
            if let Some(path) = line.split_whitespace().next() {
                libs.push(path.to_string());
            }
        }
    }

    libs
}

/// Whether any library in `deps` has a file name starting with `prefix`.
pub fn links_against(deps: &[String], prefix: &str) -> bool {
    deps.iter().any(|dep| {
        Path::new(dep)
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(prefix))
    })
}

/// Parse `blkid` output into per-device tokens.
pub fn parse_blkid(output: &str) -> BTreeMap<String, BlkidInfo> {
    let token = match Regex::new(r#"([A-Z_]+)="([^"]*)""#) {
        Ok(re) => re,
        Err(_) => return BTreeMap::new(),
    };

    let mut devices = BTreeMap::new();
    for line in output.lines() {
        let Some((device, rest)) = line.split_once(": ") else {
            continue;
        };
        let mut info = BlkidInfo::default();
        for cap in token.captures_iter(rest) {
            let value = Some(cap[2].to_string());
            match &cap[1] {
                "UUID" => info.uuid = value,
                "PARTUUID" => info.partuuid = value,
                "LABEL" => info.label = value,
                "TYPE" => info.fs_type = value,
                _ => {}
            }
        }
        devices.insert(device.trim().to_string(), info);
    }
    devices
}

/// Header UUID from `cryptsetup luksDump --debug` output.
pub fn parse_luks_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("UUID"))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}

/// Host with canned responses.
///
/// Commands with no canned output fail the way a missing tool would.
#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct FixedHost {
    pub dm: BTreeMap<String, DmDevice>,
    pub blkid: String,
    /// JSON header dumps keyed by device or header file path.
    pub luks_json: BTreeMap<String, String>,
    /// Debug dumps keyed by device or header file path.
    pub luks_debug: BTreeMap<String, String>,
    pub cryptsetup_debug: String,
    pub proc_crypto: String,
    pub openssl_kdfs: Option<String>,
    pub gcrypt_version: Option<String>,
    pub libraries: BTreeMap<String, Vec<String>>,
    /// Paths that exist. `None` defers to the real filesystem.
    pub paths: Option<Vec<PathBuf>>,
}

impl FixedHost {
    fn missing(program: &str, what: &str) -> Error {
        Error::Command {
            program: program.to_string(),
            message: format!("no output for {}", what),
        }
    }
}

impl Host for FixedHost {
    fn dm_devices(&self) -> Result<BTreeMap<String, DmDevice>> {
        Ok(self.dm.clone())
    }

    fn blkid(&self) -> Result<String> {
        Ok(self.blkid.clone())
    }

    fn luks_dump_json(&self, device: &str) -> Result<String> {
        self.luks_json
            .get(device)
            .cloned()
            .ok_or_else(|| Self::missing("cryptsetup", device))
    }

    fn luks_dump_debug(&self, device: &str) -> Result<String> {
        self.luks_debug
            .get(device)
            .cloned()
            .ok_or_else(|| Self::missing("cryptsetup", device))
    }

    fn cryptsetup_debug(&self) -> Result<String> {
        Ok(self.cryptsetup_debug.clone())
    }

    fn proc_crypto(&self) -> Result<String> {
        Ok(self.proc_crypto.clone())
    }

    fn openssl_kdfs(&self) -> Result<String> {
        self.openssl_kdfs
            .clone()
            .ok_or_else(|| Self::missing("openssl", "list -kdf-algorithms"))
    }

    fn gcrypt_version(&self) -> Result<String> {
        self.gcrypt_version
            .clone()
            .ok_or_else(|| Self::missing("libgcrypt-config", "--version"))
    }

    fn library_deps(&self, binary: &str) -> Result<Vec<String>> {
        Ok(self.libraries.get(binary).cloned().unwrap_or_default())
    }

    fn path_exists(&self, path: &Path) -> bool {
        match &self.paths {
            Some(paths) => paths.iter().any(|p| p == path),
            None => path.exists(),
        }
    }
}

//! LUKS2 header inspection.
//!
//! `cryptsetup luksDump --dump-json-metadata` gives the keyslot, segment and
//! digest tables but not the header UUID, which is recovered from the debug
//! dump instead.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::volume::CryptsetupVolume;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::host::parse_luks_uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LuksHeader {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub keyslots: BTreeMap<String, Keyslot>,
    #[serde(default)]
    pub segments: BTreeMap<String, Segment>,
    #[serde(default)]
    pub digests: BTreeMap<String, Digest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Keyslot {
    #[serde(default)]
    pub area: Option<KeyslotArea>,
    #[serde(default)]
    pub af: Option<AntiForensic>,
    #[serde(default)]
    pub kdf: Option<Kdf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyslotArea {
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AntiForensic {
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Kdf {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Segment {
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Digest {
    pub hash: Option<String>,
}

impl LuksHeader {
    /// Parse the JSON metadata dump.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// AES cipher specs used by keyslot areas and segments, e.g. `aes-xts-plain64`.
    pub fn aes_ciphers(&self) -> Vec<&str> {
        let keyslots = self
            .keyslots
            .values()
            .filter_map(|k| k.area.as_ref()?.encryption.as_deref());
        let segments = self.segments.values().filter_map(|s| s.encryption.as_deref());
        keyslots.chain(segments).filter(|c| c.starts_with("aes")).collect()
    }

    /// SHA hashes used by keyslot anti-forensic splitters and digests.
    pub fn sha_hashes(&self) -> Vec<&str> {
        let keyslots = self.keyslots.values().filter_map(|k| k.af.as_ref()?.hash.as_deref());
        let digests = self.digests.values().filter_map(|d| d.hash.as_deref());
        keyslots.chain(digests).filter(|h| h.starts_with("sha")).collect()
    }

    /// Whether any keyslot derives its key with argon2id.
    pub fn wants_argon2id(&self) -> bool {
        self.keyslots
            .values()
            .filter_map(|k| k.kdf.as_ref()?.kind.as_deref())
            .any(|kind| kind == "argon2id")
    }
}

/// Read the header of a volume: its detached header file if configured,
/// otherwise the given slave device.
///
/// Failures are logged and give `None`; a detached header may not exist
/// until boot, so that case only warns.
pub fn read_header(ctx: &BuildContext, name: &str, volume: &CryptsetupVolume, slave: &str) -> Option<LuksHeader> {
    let source = volume.header_file.as_deref().unwrap_or(slave);
    match dump_header(ctx, source) {
        Ok(header) => {
            debug!("[{}] LUKS header information: {:?}", name, header);
            Some(header)
        }
        Err(e) if volume.header_file.is_some() => {
            warn!("[{}] Cannot read detached LUKS header for validation: {}", name, e);
            None
        }
        Err(e) => {
            error!("[{}] Unable to read LUKS header: {}", name, e);
            None
        }
    }
}

fn dump_header(ctx: &BuildContext, source: &str) -> Result<LuksHeader> {
    let mut header = LuksHeader::from_json(&ctx.host.luks_dump_json(source)?)?;
    let raw = ctx.host.luks_dump_debug(source)?;
    header.uuid = Some(parse_luks_uuid(&raw).ok_or_else(|| Error::Command {
        program: "cryptsetup".to_string(),
        message: format!("no UUID in luksDump output for {}", source),
    })?);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;

    const HEADER_JSON: &str = r#"{
        "keyslots": {
            "0": {
                "type": "luks2",
                "area": {"type": "raw", "encryption": "aes-xts-plain64", "key_size": 64},
                "af": {"type": "luks1", "stripes": 4000, "hash": "sha256"},
                "kdf": {"type": "argon2id", "time": 4, "memory": 1048576}
            }
        },
        "segments": {"0": {"type": "crypt", "encryption": "aes-xts-plain64"}},
        "digests": {"0": {"type": "pbkdf2", "hash": "sha512"}}
    }"#;

    #[test]
    fn test_parse_header_tables() {
        let header = LuksHeader::from_json(HEADER_JSON).unwrap();
        assert_eq!(header.aes_ciphers(), vec!["aes-xts-plain64", "aes-xts-plain64"]);
        assert_eq!(header.sha_hashes(), vec!["sha256", "sha512"]);
        assert!(header.wants_argon2id());
        assert_eq!(header.uuid, None);
    }

    #[test]
    fn test_header_without_tables() {
        let header = LuksHeader::from_json("{}").unwrap();
        assert!(header.aes_ciphers().is_empty());
        assert!(!header.wants_argon2id());
    }

    #[test]
    fn test_read_header_recovers_uuid() {
        let mut host = FixedHost::default();
        host.luks_json.insert("/dev/sda2".into(), HEADER_JSON.into());
        host.luks_debug
            .insert("/dev/sda2".into(), "LUKS header information\nVersion: 2\nUUID: abcd-1234\n".into());
        let ctx = BuildContext::for_testing(host).unwrap();
        let header = read_header(&ctx, "root", &CryptsetupVolume::default(), "/dev/sda2").unwrap();
        assert_eq!(header.uuid.as_deref(), Some("abcd-1234"));
    }

    #[test]
    fn test_read_header_failure_is_none() {
        let ctx = BuildContext::for_testing(FixedHost::default()).unwrap();
        let volume = CryptsetupVolume {
            header_file: Some("/boot/root.hdr".into()),
            ..Default::default()
        };
        assert!(read_header(&ctx, "root", &volume, "/dev/sda2").is_none());
        assert!(read_header(&ctx, "root", &CryptsetupVolume::default(), "/dev/sda2").is_none());
    }
}

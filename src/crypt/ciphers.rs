//! Kernel crypto support, from `/proc/crypto`.
//!
//! Ciphers and hashes found in a LUKS header are looked up here so the
//! modules that provide them can be requested for the image.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::shell::Script;

/// Which kernel module backs a crypto primitive. `module` is `kernel` for
/// built-in support.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherInfo {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub module: String,
}

impl CipherInfo {
    pub fn is_builtin(&self) -> bool {
        self.module == "kernel"
    }
}

/// Parse `/proc/crypto`. When a name appears more than once the last entry
/// wins.
pub fn parse_proc_crypto(text: &str) -> BTreeMap<String, CipherInfo> {
    let mut ciphers = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match field.trim() {
            "name" => {
                ciphers.insert(value.clone(), CipherInfo::default());
                current = Some(value);
            }
            "driver" | "module" => {
                let Some(info) = current.as_ref().and_then(|c| ciphers.get_mut(c)) else {
                    continue;
                };
                if field.trim() == "driver" {
                    info.driver = value;
                } else {
                    info.module = value;
                }
            }
            _ => {}
        }
    }
    ciphers
}

/// Populate `_crypto_ciphers` from the host.
pub fn detect_ciphers(ctx: &mut BuildContext) -> Result<Script> {
    if !ctx.config.get_bool("hostonly") {
        debug!("Skipping cipher detection, hostonly is disabled");
        return Ok(Script::new());
    }
    let ciphers = parse_proc_crypto(&ctx.host.proc_crypto()?);
    debug!("Detected {} crypto primitives", ciphers.len());
    ctx.config.overwrite("_crypto_ciphers", serde_json::to_value(ciphers)?)?;
    Ok(Script::new())
}

fn lookup(ctx: &BuildContext, name: &str) -> Result<CipherInfo> {
    let value = ctx
        .config
        .get_entry("_crypto_ciphers", name)
        .ok_or_else(|| Error::autodetect(format!("No /proc/crypto entry for: {}", name)))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn request(ctx: &mut BuildContext, module: &str) -> Result<()> {
    ctx.config.append_to("_kmod_auto", Value::from(module))
}

/// Request kernel support for an AES cipher spec such as `aes-xts-plain64`.
pub fn request_aes(ctx: &mut BuildContext, cipher: &str) -> Result<()> {
    let Some(mode) = cipher.split('-').nth(1) else {
        warn!("Unrecognized LUKS cipher: {}", cipher);
        return Ok(());
    };
    request(ctx, mode)?;

    let crypto_name = format!("{}(aes)", mode);
    let info = lookup(ctx, &crypto_name)?;
    if info.is_builtin() {
        debug!("Cipher kernel modules are builtin: {}", crypto_name);
    } else {
        info!("[{}] Adding kernel module for LUKS cipher: {}", crypto_name, info.module);
        request(ctx, &info.module)?;
    }
    Ok(())
}

/// Request kernel support for a SHA hash such as `sha256`.
pub fn request_sha(ctx: &mut BuildContext, hash: &str) -> Result<()> {
    let info = lookup(ctx, hash)?;
    if info.is_builtin() {
        debug!("[{}] Hash is builtin, driver: {}", hash, info.driver);
        return Ok(());
    }
    info!("[{}] Adding kernel module for LUKS hash: {} (driver: {})", hash, info.module, info.driver);
    request(ctx, &info.module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CRYPTSETUP;
    use crate::host::FixedHost;
    use serde_json::json;

    const PROC_CRYPTO: &str = "\
name         : xts(aes)
driver       : xts(aes-aesni)
module       : aesni_intel
priority     : 401

name         : sha256
driver       : sha256-avx2
module       : sha256_ssse3

name         : sha512
driver       : sha512-generic
module       : kernel

name         : xts(aes)
driver       : xts-aes-vaes-avx2
module       : aesni_intel
";

    fn ctx() -> BuildContext {
        let host = FixedHost {
            proc_crypto: PROC_CRYPTO.to_string(),
            ..Default::default()
        };
        let mut ctx = BuildContext::for_testing(host).unwrap();
        ctx.config.declare_all(CRYPTSETUP.parameters).unwrap();
        ctx
    }

    #[test]
    fn test_parse_proc_crypto_last_wins() {
        let ciphers = parse_proc_crypto(PROC_CRYPTO);
        assert_eq!(ciphers.len(), 3);
        assert_eq!(ciphers["xts(aes)"].driver, "xts-aes-vaes-avx2");
        assert!(ciphers["sha512"].is_builtin());
    }

    #[test]
    fn test_request_aes_adds_mode_and_module() {
        let mut ctx = ctx();
        detect_ciphers(&mut ctx).unwrap();
        request_aes(&mut ctx, "aes-xts-plain64").unwrap();
        assert_eq!(ctx.config.str_list("_kmod_auto"), vec!["xts", "aesni_intel"]);
    }

    #[test]
    fn test_request_sha_skips_builtin() {
        let mut ctx = ctx();
        detect_ciphers(&mut ctx).unwrap();
        request_sha(&mut ctx, "sha512").unwrap();
        assert!(ctx.config.str_list("_kmod_auto").is_empty());
        request_sha(&mut ctx, "sha256").unwrap();
        assert_eq!(ctx.config.str_list("_kmod_auto"), vec!["sha256_ssse3"]);
    }

    #[test]
    fn test_missing_cipher_is_autodetect_error() {
        let mut ctx = ctx();
        detect_ciphers(&mut ctx).unwrap();
        let err = request_aes(&mut ctx, "aes-cbc-essiv:sha256").unwrap_err();
        assert!(matches!(err, Error::Autodetect(_)));
    }

    #[test]
    fn test_detection_skipped_without_hostonly() {
        let mut ctx = ctx();
        ctx.config.overwrite("hostonly", json!(false)).unwrap();
        detect_ciphers(&mut ctx).unwrap();
        assert!(ctx.config.get_entry("_crypto_ciphers", "sha256").is_none());
    }
}

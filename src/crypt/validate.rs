//! Build-time validation of cryptsetup volumes against the host, and export
//! of each volume's source for the boot-time lookup.
//!
//! Checks run per volume in declaration order:
//!
//! ```text
//! validate? ── config   parameters, identity, detached header, key file
//!   hostonly? ─ device  dm mapping is LUKS, slave token matches
//!     header_validation? ─ header   uuid, ciphers, hashes, argon2id
//! export    CRYPTSETUP_TOKEN_<name> | CRYPTSETUP_SOURCE_<name>
//! ```

use std::path::Path;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::ciphers::{request_aes, request_sha};
use super::header::read_header;
use super::volume::{CryptsetupVolume, CRYPTSETUP_PARAMETERS};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::host::{BlkidInfo, DmDevice};
use crate::shell::Script;

/// Declared volumes, in declaration order.
pub fn volumes(ctx: &BuildContext) -> Result<Vec<(String, CryptsetupVolume)>> {
    let Some(entries) = ctx.config.get_map("cryptsetup") else {
        return Ok(Vec::new());
    };
    entries
        .iter()
        .map(|(name, value)| Ok((name.clone(), CryptsetupVolume::from_value(name, value)?)))
        .collect()
}

/// Validate every volume and export where to find it at boot.
pub fn export_crypt_sources(ctx: &mut BuildContext) -> Result<Script> {
    for (name, volume) in volumes(ctx)? {
        if ctx.config.get_bool("validate") {
            validate_config(ctx, &name)?;
            if ctx.config.get_bool("hostonly") {
                validate_device(ctx, &name, &volume)?;
            } else {
                warn!("[{}] Skipping cryptsetup device check, hostonly is disabled", name);
            }
        } else {
            warn!("[{}] Skipping cryptsetup configuration validation", name);
        }
        export_source(ctx, &name, &volume)?;
    }
    Ok(Script::new())
}

fn export_source(ctx: &mut BuildContext, name: &str, volume: &CryptsetupVolume) -> Result<()> {
    if let Some(path) = &volume.path {
        if ctx.config.get_bool("validate") {
            return Err(Error::validation(
                "Validation must be disabled to use device paths with the cryptsetup module.",
            ));
        }
        warn!("Using device paths is unreliable and can result in boot failures. Consider using partuuid.");
        let key = format!("CRYPTSETUP_SOURCE_{}", name);
        info!("Set {}: {}", key, path);
        return ctx.config.set("exports", json!({ key: path }));
    }

    let Some((kind, token)) = volume.token() else {
        return Err(Error::validation(format!(
            "A partuuid or uuid must be specified for cryptsetup mount: {}",
            name
        )));
    };
    let key = format!("CRYPTSETUP_TOKEN_{}", name);
    let value = format!("{}={}", kind.to_uppercase(), token);
    debug!("Set {}: {}", key, value);
    ctx.config.set("exports", json!({ key: value }))
}

/// Parameter and identity checks that need nothing from the host beyond
/// file existence.
pub fn validate_config(ctx: &mut BuildContext, name: &str) -> Result<()> {
    let raw = ctx
        .config
        .get_entry("cryptsetup", name)
        .cloned()
        .ok_or_else(|| Error::validation(format!("No cryptsetup configuration found for: {}", name)))?;
    if let Value::Object(map) = &raw {
        if let Some(parameter) = map.keys().find(|k| !CRYPTSETUP_PARAMETERS.contains(&k.as_str())) {
            return Err(Error::invalid_parameter(parameter.as_str(), format!("cryptsetup.{}", name)));
        }
    }
    let volume = CryptsetupVolume::from_value(name, &raw)?;

    match volume.source_count() {
        0 => {
            return Err(Error::validation(format!(
                "A device uuid, partuuid, or path must be specified for cryptsetup mount: {}",
                name
            )))
        }
        1 => {}
        _ => {
            return Err(Error::validation(format!(
                "Only one of partuuid, uuid or path may be set for cryptsetup mount: {}",
                name
            )))
        }
    }

    if let Some(header_file) = &volume.header_file {
        if volume.uuid.is_some() {
            return Err(Error::validation(format!(
                "A UUID cannot be used with a detached header: {}",
                name
            )));
        }
        if !ctx.host.path_exists(Path::new(header_file)) {
            warn!("[{}] Header file not found: {}", name, header_file);
        }
    }

    if let Some(key_file) = &volume.key_file {
        validate_key(ctx, name, key_file, &volume)?;
    }
    Ok(())
}

fn validate_key(ctx: &mut BuildContext, name: &str, key_file: &str, volume: &CryptsetupVolume) -> Result<()> {
    if volume.include_key {
        info!("[{}] Skipping key validation for included key", name);
        return Ok(());
    }
    if volume.validate_key == Some(false) || !ctx.config.get_bool("cryptsetup_keyfile_validation") {
        info!("[{}] Skipping key validation for: {}", name, key_file);
        return Ok(());
    }
    if !ctx.host.path_exists(Path::new(key_file)) {
        return Err(Error::validation(format!("[{}] Key file not found: {}", name, key_file)));
    }
    ctx.config.append_to("check_included_or_mounted", json!(key_file))
}

fn dm_info(ctx: &BuildContext, name: &str) -> Result<DmDevice> {
    ctx.config
        .get_map("_vblk_info")
        .into_iter()
        .flat_map(|m| m.values())
        .filter_map(|v| serde_json::from_value::<DmDevice>(v.clone()).ok())
        .find(|device| device.name == name)
        .ok_or_else(|| Error::autodetect(format!("No device mapper information found for: {}", name)))
}

/// Backing device of a mapping and its blkid tokens.
fn slave_info(ctx: &BuildContext, device: &DmDevice) -> Result<(String, BlkidInfo)> {
    let slave = device
        .slaves
        .first()
        .ok_or_else(|| Error::autodetect(format!("Device mapper entry has no slaves: {}", device.name)))?;
    for path in [format!("/dev/{}", slave), format!("/dev/mapper/{}", slave)] {
        if let Some(value) = ctx.config.get_entry("_blkid_info", &path) {
            return Ok((path, serde_json::from_value(value.clone())?));
        }
    }
    Err(Error::autodetect(format!("No blkid information found for: {}", slave)))
}

/// Compare the configured token with the live device behind the mapping.
pub fn validate_device(ctx: &mut BuildContext, name: &str, volume: &CryptsetupVolume) -> Result<()> {
    let device = dm_info(ctx, name)?;
    if !device.uuid.starts_with("CRYPT-LUKS") {
        return Err(Error::validation(format!(
            "Device is not a crypt device: {} ({})",
            name, device.uuid
        )));
    }
    if volume.validate == Some(false) {
        warn!("Skipping cryptsetup device validation: {}", name);
        return Ok(());
    }

    let (slave, blkid) = slave_info(ctx, &device)?;
    let Some((kind, expected)) = volume.token() else {
        return Err(Error::validation(format!(
            "[{}] No UUID or PARTUUID set for LUKS source",
            name
        )));
    };
    let found = blkid.token(kind);
    if found != Some(expected) {
        return Err(Error::validation(format!(
            "[{}] LUKS {} mismatch, found '{}', expected: {}",
            name,
            kind,
            found.unwrap_or(""),
            expected
        )));
    }
    debug!("[{}] {} matches {}", name, kind, slave);

    validate_header(ctx, name, volume, &slave)
}

/// Check the on-disk header and request the crypto it needs.
pub fn validate_header(ctx: &mut BuildContext, name: &str, volume: &CryptsetupVolume, slave: &str) -> Result<()> {
    if !ctx.config.get_bool("cryptsetup_header_validation") {
        warn!("Skipping cryptsetup header validation");
        return Ok(());
    }
    if volume.validate_header == Some(false) {
        warn!("Skipping cryptsetup header validation for: {}", name);
        return Ok(());
    }

    let Some(header) = read_header(ctx, name, volume, slave) else {
        return Err(Error::validation(format!("[{}] Unable to read LUKS header.", name)));
    };

    if let Some(uuid) = &volume.uuid {
        if header.uuid.as_ref() != Some(uuid) {
            return Err(Error::validation(format!(
                "[{}] LUKS UUID mismatch, found '{}', expected: {}",
                name,
                header.uuid.as_deref().unwrap_or(""),
                uuid
            )));
        }
    }

    for cipher in header.aes_ciphers() {
        request_aes(ctx, cipher)?;
    }
    for hash in header.sha_hashes() {
        request_sha(ctx, hash)?;
    }

    if !ctx.config.get_bool("argon2") && header.wants_argon2id() {
        return Err(Error::validation(format!(
            "[{}] Missing cryptsetup dependency: libargon2.so",
            name
        )));
    }

    if let Some(header_file) = &volume.header_file {
        ctx.config.append_to("check_included_or_mounted", json!(header_file))?;
    }
    Ok(())
}

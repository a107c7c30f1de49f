//! Cryptsetup (LUKS) support.
//!
//! Volumes are declared under `cryptsetup.<mapped_name>` and processed as
//! they are loaded ([`process`]). At build time the host's device-mapper,
//! blkid and crypto state is collected, each volume is validated against it
//! ([`validate`]) and the unlock sequence is generated for `init_early`
//! ([`unlock`]).

pub mod backend;
pub mod ciphers;
pub mod header;
pub mod process;
pub mod unlock;
pub mod validate;
pub mod volume;

use tracing::debug;

use crate::context::BuildContext;
use crate::error::Result;
use crate::hook::{func, Hook};
use crate::host::parse_blkid;
use crate::module::{Dep, Module, Processor};
use crate::shell::Script;
use crate::store::{param, scalar, Kind, Lit};

pub use volume::{CryptsetupVolume, KeyType};

pub static CRYPTSETUP: Module = Module {
    name: "cryptsetup",
    depends: &[Dep::Module("base")],
    binaries: &["cryptsetup", "blkid"],
    parameters: &[
        param("cryptsetup", Kind::Table),
        param("cryptsetup_key_types", Kind::Table),
        param("cryptsetup_key_type", Kind::Scalar),
        scalar("cryptsetup_retries", Lit::Int(5)),
        scalar("cryptsetup_autoretry", Lit::Bool(true)),
        scalar("cryptsetup_prompt", Lit::Bool(false)),
        scalar("cryptsetup_trim", Lit::Bool(false)),
        scalar("cryptsetup_header_validation", Lit::Bool(true)),
        scalar("cryptsetup_keyfile_validation", Lit::Bool(true)),
        param("argon2", Kind::Scalar),
        param("_cryptsetup_backend", Kind::Scalar),
        param("_crypto_ciphers", Kind::Map),
        param("_vblk_info", Kind::Map),
        param("_blkid_info", Kind::Map),
    ],
    hooks: &[
        (
            Hook::BuildPre,
            &[
                func("detect_block_devices", detect_block_devices),
                func("detect_ciphers", ciphers::detect_ciphers),
                func("detect_cryptsetup_backend", backend::detect_cryptsetup_backend),
                func("detect_argon2", backend::detect_argon2),
            ],
        ),
        (
            Hook::BuildTasks,
            &[func("export_crypt_sources", validate::export_crypt_sources)],
        ),
        (Hook::Functions, &[func("get_crypt_dev", unlock::get_crypt_dev)]),
        (Hook::InitEarly, &[func("crypt_init", unlock::crypt_init)]),
    ],
    processors: &[
        Processor::Multi("cryptsetup", process::process_volume),
        Processor::Multi("cryptsetup_key_types", process::process_key_type),
    ],
    setup: Some(process::builtin_key_types),
    ..Module::EMPTY
};

/// Collect device-mapper and blkid state for validation.
pub fn detect_block_devices(ctx: &mut BuildContext) -> Result<Script> {
    if !ctx.config.get_bool("hostonly") {
        debug!("Skipping block device detection, hostonly is disabled");
        return Ok(Script::new());
    }
    let dm = ctx.host.dm_devices()?;
    debug!("Device mapper devices: {:?}", dm);
    ctx.config.overwrite("_vblk_info", serde_json::to_value(dm)?)?;

    let blkid = parse_blkid(&ctx.host.blkid()?);
    debug!("Block device tokens: {:?}", blkid);
    ctx.config.overwrite("_blkid_info", serde_json::to_value(blkid)?)?;
    Ok(Script::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DmDevice, FixedHost};
    use crate::module::Registry;
    use serde_json::json;

    #[test]
    fn test_load_registers_builtin_key_types() {
        let registry = Registry::builtin();
        let mut config = crate::store::ConfigStore::with_core_schema().unwrap();
        registry.load(&mut config, "base").unwrap();
        registry.load(&mut config, "cryptsetup").unwrap();
        assert!(config.get_entry("cryptsetup_key_types", "gpg").is_some());
        assert!(config.get_entry("cryptsetup_key_types", "openssl").is_some());
        assert_eq!(config.get_u64("cryptsetup_retries"), Some(5));
        assert_eq!(
            config.get_entry("imports", "init_early"),
            Some(&json!(["crypt_init"]))
        );
        assert!(registry.processor(&config, "cryptsetup").is_some());
    }

    #[test]
    fn test_detect_block_devices() {
        let mut host = FixedHost {
            blkid: "/dev/nvme0n1p2: UUID=\"abcd\" TYPE=\"crypto_LUKS\" PARTUUID=\"p\"\n".into(),
            ..Default::default()
        };
        host.dm.insert(
            "dm-0".into(),
            DmDevice {
                name: "root".into(),
                uuid: "CRYPT-LUKS2-abcd-root".into(),
                slaves: vec!["nvme0n1p2".into()],
            },
        );
        let mut ctx = BuildContext::for_testing(host).unwrap();
        ctx.config.declare_all(CRYPTSETUP.parameters).unwrap();
        detect_block_devices(&mut ctx).unwrap();
        assert_eq!(
            ctx.config.get_entry("_vblk_info", "dm-0").unwrap()["name"],
            json!("root")
        );
        assert_eq!(
            ctx.config.get_entry("_blkid_info", "/dev/nvme0n1p2").unwrap()["partuuid"],
            json!("p")
        );
    }
}

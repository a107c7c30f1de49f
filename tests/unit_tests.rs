//! Unit tests for rdgen building blocks.
//!
//! These exercise pure functions and the store in isolation, without a
//! generator or build tree.

mod helpers;

use rdgen::crypt::ciphers::parse_proc_crypto;
use rdgen::crypt::header::LuksHeader;
use rdgen::crypt::unlock::{Attempt, UnlockOptions, UnlockPlan};
use rdgen::crypt::volume::{check_mapped_name, substitute};
use rdgen::crypt::CryptsetupVolume;
use rdgen::error::Error;
use rdgen::hook::Hook;
use rdgen::host::{parse_blkid, parse_ldd_output};
use rdgen::shell::{Dq, Line, Script, Stmt};
use rdgen::store::{ConfigStore, Kind};
use serde_json::json;

// =============================================================================
// store
// =============================================================================

#[test]
fn test_sequence_set_appends() {
    let mut config = ConfigStore::with_core_schema().unwrap();
    config.set("kernel_modules", json!(["ext4"])).unwrap();
    config.set("kernel_modules", json!("xts")).unwrap();
    config.set("kernel_modules", json!(["ext4"])).unwrap();
    assert_eq!(config.str_list("kernel_modules"), vec!["ext4", "xts", "ext4"]);
}

#[test]
fn test_mapping_set_keeps_siblings() {
    let mut config = ConfigStore::new();
    config.declare("settings", Kind::Map).unwrap();
    config.set("settings", json!({"a": {"x": 1}, "b": 2})).unwrap();
    config.set("settings", json!({"a": {"y": 3}})).unwrap();
    assert_eq!(config.get("settings"), Some(&json!({"a": {"x": 1, "y": 3}, "b": 2})));
}

#[test]
fn test_scalar_conflict_and_overwrite() {
    let mut config = ConfigStore::with_core_schema().unwrap();
    config.set("shebang", json!("#!/bin/sh")).unwrap();
    config.set("shebang", json!("#!/bin/sh")).unwrap();
    assert!(matches!(
        config.set("shebang", json!("#!/bin/bash")),
        Err(Error::Conflict { .. })
    ));
    config.overwrite("shebang", json!("#!/bin/bash")).unwrap();
    assert_eq!(config.get_str("shebang"), Some("#!/bin/bash"));
}

#[test]
fn test_defaults_are_replaceable() {
    let mut config = ConfigStore::with_core_schema().unwrap();
    assert_eq!(config.get_u64("loglevel"), Some(5));
    config.set("loglevel", json!(7)).unwrap();
    assert!(config.set("loglevel", json!(3)).is_err());
}

#[test]
fn test_masks_accumulate() {
    let mut config = ConfigStore::with_core_schema().unwrap();
    config.set("masks", json!({"init_mount": "mount_root"})).unwrap();
    config.set("masks", json!({"init_mount": ["mount_other"]})).unwrap();
    assert_eq!(
        config.get_entry("masks", "init_mount"),
        Some(&json!(["mount_root", "mount_other"]))
    );
}

// =============================================================================
// hooks and shell
// =============================================================================

#[test]
fn test_hook_order_is_fixed() {
    let names: Vec<&str> = Hook::ALL.iter().map(|h| h.name()).collect();
    let early = names.iter().position(|n| *n == "init_early").unwrap();
    let mount = names.iter().position(|n| *n == "init_mount").unwrap();
    let cleanup = names.iter().position(|n| *n == "init_cleanup").unwrap();
    assert!(early < mount && mount < cleanup);
    assert_eq!("init_premount".parse::<Hook>().unwrap(), Hook::InitPremount);
    assert!("init_whenever".parse::<Hook>().is_err());
}

#[test]
fn test_shell_quoting() {
    let line = Line::cmd("einfo").dq(Dq::new().text("opening ").var("name"));
    assert_eq!(line.render(), r#"einfo "opening ${name}""#);

    let script = Script::from(vec![Stmt::if_then(
        Line::cmd("[ -e /dev/sda2 ]"),
        vec![Line::cmd("echo").lit("it's here").into()],
    )]);
    assert_eq!(
        script.lines(),
        vec!["if [ -e /dev/sda2 ]; then", r#"    echo 'it'\''s here'"#, "fi"]
    );
}

// =============================================================================
// host parsers
// =============================================================================

#[test]
fn test_parse_blkid_tokens() {
    let output = "/dev/sda1: UUID=\"1111\" TYPE=\"vfat\" PARTUUID=\"aaaa\"\n\
                  /dev/sda2: UUID=\"2222\" TYPE=\"crypto_LUKS\" PARTUUID=\"bbbb\"\n";
    let devices = parse_blkid(output);
    assert_eq!(devices.len(), 2);
    assert_eq!(devices["/dev/sda2"].token("uuid"), Some("2222"));
    assert_eq!(devices["/dev/sda2"].token("partuuid"), Some("bbbb"));
    assert_eq!(devices["/dev/sda1"].token("type"), Some("vfat"));
}

#[test]
fn test_parse_ldd_skips_vdso() {
    let output = "\tlinux-vdso.so.1 (0x00007ffd)\n\
                  \tlibcryptsetup.so.12 => /lib64/libcryptsetup.so.12 (0x00007f)\n\
                  \t/lib64/ld-linux-x86-64.so.2 (0x00007f)\n";
    let libs = parse_ldd_output(output);
    assert!(libs.contains(&"/lib64/libcryptsetup.so.12".to_string()));
    assert!(!libs.iter().any(|l| l.contains("vdso")));
}

#[test]
fn test_parse_proc_crypto_modules() {
    let ciphers = parse_proc_crypto(
        "name : xts(aes)\ndriver : xts(aes-aesni)\nmodule : xts\n\n\
         name : sha256\ndriver : sha256-ni\nmodule : kernel\n",
    );
    assert_eq!(ciphers["xts(aes)"].module, "xts");
    assert!(ciphers["sha256"].is_builtin());
}

#[test]
fn test_luks_header_primitives() {
    let header = LuksHeader::from_json(helpers::PBKDF2_HEADER).unwrap();
    assert_eq!(header.aes_ciphers(), vec!["aes-xts-plain64", "aes-xts-plain64"]);
    assert_eq!(header.sha_hashes(), vec!["sha256", "sha256"]);
    assert!(!header.wants_argon2id());
}

// =============================================================================
// cryptsetup volumes
// =============================================================================

#[test]
fn test_mapped_names() {
    assert!(check_mapped_name("root").is_ok());
    assert!(check_mapped_name("luks-home_1.2").is_ok());
    assert!(check_mapped_name("..").is_err());
    assert!(check_mapped_name("root; reboot").is_err());
}

#[test]
fn test_key_command_substitution() {
    let values = json!({"key_file": "/boot/root.gpg"});
    let command = substitute(
        "gpg --decrypt {key_file} | awk '{{print}}'",
        values.as_object().unwrap(),
    )
    .unwrap();
    assert_eq!(command, "gpg --decrypt /boot/root.gpg | awk '{print}'");
    assert!(substitute("{missing}", values.as_object().unwrap()).is_err());
}

#[test]
fn test_unlock_attempts_for_interactive_volume() {
    let volume = CryptsetupVolume {
        uuid: Some("abcd".into()),
        ..Default::default()
    };
    let plan = UnlockPlan::new("root", volume, UnlockOptions::default());
    assert_eq!(plan.retries(), 5);
    assert_eq!(plan.attempts(), vec![Attempt::Interactive]);
    assert!(plan.fallback().is_none());
}

//! Crypto backend and argon2 capability detection.
//!
//! Both detections are soft: a failure is logged and the build continues,
//! since the host may differ from the booted system in ways only the boot
//! itself reveals.

use regex::Regex;
use serde_json::json;
use tracing::{debug, error, info};

use crate::context::BuildContext;
use crate::error::{Outcome, Result};
use crate::host::{links_against, Host};
use crate::shell::Script;

/// Backend named on the `# Crypto backend` line of `cryptsetup --debug`
/// output, e.g. `openssl` or `gcrypt`.
pub fn parse_backend(output: &str) -> Option<String> {
    let re = Regex::new(r"backend \((.+)\)").ok()?;
    let line = output.lines().find(|l| l.starts_with("# Crypto backend"))?;
    let backend = re.captures(line)?.get(1)?.as_str();
    backend.split_whitespace().next().map(str::to_lowercase)
}

/// Detect which crypto library cryptsetup was built against.
pub fn detect_cryptsetup_backend(ctx: &mut BuildContext) -> Result<Script> {
    if ctx.config.contains("_cryptsetup_backend") {
        return Ok(Script::new());
    }
    let output = match ctx.host.cryptsetup_debug() {
        Ok(output) => output,
        Err(e) => {
            error!("Unable to determine cryptsetup backend: {}", e);
            return Ok(Script::new());
        }
    };
    match parse_backend(&output) {
        Some(backend) => {
            info!("Detected cryptsetup backend: {}", backend);
            ctx.config.set_scalar("_cryptsetup_backend", json!(backend))?;
        }
        None => error!("Unable to determine cryptsetup backend"),
    }
    Ok(Script::new())
}

/// `(major, minor, patch)` from `libgcrypt-config --version`, e.g. `1.10.3-unknown`.
pub fn parse_gcrypt_version(output: &str) -> Option<(u32, u32, u32)> {
    let version = output.trim().split('-').next()?;
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

/// Whether argon2id is available to cryptsetup, with what was found along
/// the way.
pub fn argon2_support(host: &dyn Host, backend: Option<&str>, deps: &[String]) -> (bool, Vec<Outcome>) {
    let mut outcomes = Vec::new();
    let mut available = false;

    match backend {
        Some("openssl") => {
            match host.openssl_kdfs() {
                Ok(kdfs) => {
                    let kdfs = kdfs.to_lowercase();
                    debug!("OpenSSL KDFs: {:?}", kdfs);
                    available = kdfs
                        .lines()
                        .any(|kdf| kdf.trim_start().starts_with("argon2id") && kdf.contains("default"));
                }
                Err(e) => outcomes.push(Outcome::Failed(format!("Unable to list OpenSSL KDFs: {}", e))),
            }
            if !links_against(deps, "libcrypto.so") {
                outcomes.push(Outcome::Failed(
                    "Cryptsetup is linked against OpenSSL, but libcrypto.so is not in dependencies.".into(),
                ));
            }
        }
        Some("gcrypt") => {
            if !links_against(deps, "libgcrypt.so") {
                outcomes.push(Outcome::Failed(
                    "Cryptsetup is linked against Libgcrypt, but libgcrypt.so is not in dependencies.".into(),
                ));
            }
            match host.gcrypt_version().map(|v| (parse_gcrypt_version(&v), v)) {
                Ok((Some(version), _)) if version >= (1, 11, 0) => available = true,
                Ok((_, raw)) => outcomes.push(Outcome::Failed(format!(
                    "Gcrypt version {} may not support argon2id.",
                    raw.trim()
                ))),
                Err(e) => outcomes.push(Outcome::Failed(format!("Unable to read gcrypt version: {}", e))),
            }
        }
        _ => outcomes.push(Outcome::Failed("Unable to determine cryptsetup backend.".into())),
    }

    if links_against(deps, "libargon2.so") {
        available = true;
    }
    if available {
        outcomes.push(Outcome::Ok);
    } else {
        outcomes.push(Outcome::Failed("Cryptsetup is not linked against libargon2.".into()));
    }
    (available, outcomes)
}

/// Record whether argon2id key derivation is available in `argon2`.
pub fn detect_argon2(ctx: &mut BuildContext) -> Result<Script> {
    if ctx.config.contains("argon2") {
        return Ok(Script::new());
    }
    let deps = ctx.host.library_deps("cryptsetup").unwrap_or_else(|e| {
        error!("Unable to read cryptsetup library dependencies: {}", e);
        Vec::new()
    });
    let backend = ctx.config.get_str("_cryptsetup_backend").map(str::to_string);
    let (available, outcomes) = argon2_support(ctx.host.as_ref(), backend.as_deref(), &deps);
    for outcome in &outcomes {
        outcome.log("argon2");
    }
    ctx.config.set_scalar("argon2", json!(available))?;
    Ok(Script::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CRYPTSETUP;
    use crate::host::FixedHost;

    const DEBUG_OUTPUT: &str = "\
# cryptsetup 2.7.0 processing \"cryptsetup --debug luksDump /dev/null\"
# Running command luksDump.
# Crypto backend (OpenSSL 3.1.4 24 Oct 2023 [default][legacy]) initialized in cryptsetup library version 2.7.0.
";

    fn ctx(host: FixedHost) -> BuildContext {
        let mut ctx = BuildContext::for_testing(host).unwrap();
        ctx.config.declare_all(CRYPTSETUP.parameters).unwrap();
        ctx
    }

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("/usr/lib64/{}", n)).collect()
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend(DEBUG_OUTPUT).as_deref(), Some("openssl"));
        assert_eq!(
            parse_backend("# Crypto backend (gcrypt 1.10.3) initialized").as_deref(),
            Some("gcrypt")
        );
        assert_eq!(parse_backend("nothing here"), None);
    }

    #[test]
    fn test_parse_gcrypt_version() {
        assert_eq!(parse_gcrypt_version("1.10.3-unknown\n"), Some((1, 10, 3)));
        assert_eq!(parse_gcrypt_version("1.11.0"), Some((1, 11, 0)));
        assert_eq!(parse_gcrypt_version("garbage"), None);
    }

    #[test]
    fn test_openssl_argon2() {
        let host = FixedHost {
            openssl_kdfs: Some("Provided KDFs:\n  ARGON2ID @ default\n  HKDF @ default\n".into()),
            ..Default::default()
        };
        let (available, outcomes) =
            argon2_support(&host, Some("openssl"), &deps(&["libcrypto.so.3"]));
        assert!(available);
        assert_eq!(outcomes, vec![Outcome::Ok]);
    }

    #[test]
    fn test_old_gcrypt_without_libargon2() {
        let host = FixedHost {
            gcrypt_version: Some("1.10.3".into()),
            ..Default::default()
        };
        let (available, outcomes) = argon2_support(&host, Some("gcrypt"), &deps(&["libgcrypt.so.20"]));
        assert!(!available);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.is_ok()));
    }

    #[test]
    fn test_libargon2_is_enough() {
        let host = FixedHost::default();
        let (available, _) = argon2_support(&host, None, &deps(&["libargon2.so.1"]));
        assert!(available);
    }

    #[test]
    fn test_detect_hooks_set_config() {
        let mut host = FixedHost {
            cryptsetup_debug: DEBUG_OUTPUT.into(),
            openssl_kdfs: Some("  ARGON2ID @ default\n".into()),
            ..Default::default()
        };
        host.libraries
            .insert("cryptsetup".into(), deps(&["libcrypto.so.3", "libargon2.so.1"]));
        let mut ctx = ctx(host);
        detect_cryptsetup_backend(&mut ctx).unwrap();
        detect_argon2(&mut ctx).unwrap();
        assert_eq!(ctx.config.get_str("_cryptsetup_backend"), Some("openssl"));
        assert!(ctx.config.get_bool("argon2"));
    }

    #[test]
    fn test_detection_failure_does_not_abort() {
        let mut ctx = ctx(FixedHost::default());
        detect_cryptsetup_backend(&mut ctx).unwrap();
        detect_argon2(&mut ctx).unwrap();
        assert!(!ctx.config.contains("_cryptsetup_backend"));
        assert_eq!(ctx.config.get("argon2"), Some(&json!(false)));
    }
}

//! Base module: boot-time helper functions, pseudo filesystem setup and the
//! final switch into the real root.
//!
//! The helpers form the environment every other module's shell relies on:
//! `einfo`/`ewarn`/`eerror`/`edebug` for logging, `setvar`/`readvar` for
//! values persisted under `/run/vars`, `rd_fail` as the fatal abort.

use std::path::Path;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::Module;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::hook::{func, Hook};
use crate::shell::{Line, Script, Stmt};
use crate::staging;
use crate::store::{param, scalar, ConfigStore, Kind, Lit};

/// Where the real root is mounted unless configured otherwise.
pub const DEFAULT_ROOT_TARGET: &str = "/target_rootfs";

pub static BASE: Module = Module {
    name: "base",
    binaries: &[
        "sh", "awk", "grep", "cat", "ls", "mount", "switch_root", "stty", "dd", "bc",
    ],
    parameters: &[
        scalar("init_target", Lit::Str("/sbin/init")),
        param("switch_root_target", Kind::Scalar),
    ],
    hooks: &[
        (Hook::BuildPre, &[func("set_shebang", set_shebang)]),
        (
            Hook::BuildTasks,
            &[
                func("export_switch_root_target", export_switch_root_target),
                func("export_init_target", export_init_target),
                func("deploy_dependencies", deploy_dependencies),
            ],
        ),
        (
            Hook::Functions,
            &[
                func("check_var", check_var),
                func("setvar", setvar),
                func("readvar", readvar),
                func("edebug", edebug),
                func("einfo", einfo),
                func("ewarn", ewarn),
                func("eerror", eerror),
                func("klog", klog),
                func("wait_enter", wait_enter),
                func("prompt_user", prompt_user),
                func("retry", retry),
                func("rd_restart", rd_restart),
                func("rd_fail", rd_fail),
                func("_find_init", find_init),
            ],
        ),
        (
            Hook::InitPre,
            &[
                func("mount_base", mount_base),
                func("export_vars", export_vars),
                func("set_loglevel", set_loglevel),
            ],
        ),
        (Hook::InitFinal, &[func("do_switch_root", do_switch_root)]),
    ],
    setup: Some(setup),
    ..Module::EMPTY
};

fn setup(config: &mut ConfigStore) -> Result<()> {
    config.append_to("paths", json!(["/proc", "/sys", "/dev", "/run"]))
}

fn splash(ctx: &BuildContext) -> bool {
    ctx.has_module("plymouth")
}

// ─────────────────────────────────────────────────────────────────────────────
// Build time
// ─────────────────────────────────────────────────────────────────────────────

fn set_shebang(ctx: &mut BuildContext) -> Result<Script> {
    if ctx.config.contains("shebang") {
        return Ok(Script::new());
    }
    let args = ctx.config.get_str("shebang_args").unwrap_or("");
    let shebang = format!("#!/bin/sh {}", args).trim_end().to_string();
    info!("Setting shebang to: {}", shebang);
    ctx.config.set_scalar("shebang", json!(shebang))?;
    Ok(Script::new())
}

fn export_switch_root_target(ctx: &mut BuildContext) -> Result<Script> {
    let target = match ctx.config.get_str("switch_root_target") {
        Some(target) => target.to_string(),
        None => ctx
            .config
            .get_entry("mounts", "root")
            .and_then(|root| root.get("destination"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ROOT_TARGET)
            .to_string(),
    };
    ctx.config
        .set("exports", json!({ "SWITCH_ROOT_TARGET": target }))?;
    Ok(Script::new())
}

fn export_init_target(ctx: &mut BuildContext) -> Result<Script> {
    let init = ctx.config.get_str("init_target").unwrap_or("/sbin/init").to_string();
    let loglevel = ctx.config.get_u64("loglevel").unwrap_or(5);
    ctx.config
        .set("exports", json!({ "init": init, "loglevel": loglevel.to_string() }))?;
    Ok(Script::new())
}

/// Copy every file in `dependencies` into the build tree, once each.
fn deploy_dependencies(ctx: &mut BuildContext) -> Result<Script> {
    let build_dir = ctx.build_dir();
    let mut seen = std::collections::HashSet::new();
    for dependency in ctx.config.str_list("dependencies") {
        if !seen.insert(dependency.clone()) {
            continue;
        }
        staging::copy_into(&build_dir, Path::new(&dependency))?;
    }
    Ok(Script::new())
}

/// Files needed at boot that are neither embedded nor on a filesystem the
/// init mounts. Other modules only fill `check_included_or_mounted` during
/// their build tasks, so this runs once all of them are done.
pub fn check_included_or_mounted(config: &ConfigStore) -> Vec<String> {
    let included = config.str_list("dependencies");
    let mount_points: Vec<String> = config
        .get_map("mounts")
        .into_iter()
        .flat_map(|m| m.values())
        .filter_map(|m| m.get("destination").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    let mut unavailable = Vec::new();
    for path in config.str_list("check_included_or_mounted") {
        if included.contains(&path) || unavailable.contains(&path) {
            continue;
        }
        if mount_points
            .iter()
            .any(|mp| mp != "/" && Path::new(&path).starts_with(mp))
        {
            continue;
        }
        warn!("File is not included and not on a mounted filesystem: {}", path);
        unavailable.push(path);
    }
    unavailable
}

// ─────────────────────────────────────────────────────────────────────────────
// Boot-time helpers
// ─────────────────────────────────────────────────────────────────────────────

fn check_var(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        value=$(readvar "$1")
        if [ -z "$value" ]; then
            cmdline=$(awk -F '--' '{print $1}' /proc/cmdline)
            if echo "$cmdline" | grep -qE "(^|\s)$1(\s|$)"; then
                return 0
            fi
            return 1
        fi
        if [ "$value" = "1" ]; then
            return 0
        fi
        return 1
        "#,
    ))
}

fn setvar(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        if check_var debug; then
            edebug "Setting $1 to $2"
        fi
        printf "%s" "$2" > "/run/vars/${1}"
        "#,
    ))
}

fn readvar(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(r#"cat "/run/vars/${1}" 2>/dev/null || echo "${2}""#))
}

fn edebug(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        if check_var quiet; then
            return
        fi
        if [ "$(readvar debug)" != "1" ]; then
            return
        fi
        printf "\033[1;34m *\033[0m %s\n" "${*}"
        "#,
    ))
}

/// Message helper that goes to the splash when it is running.
fn message(ctx: &BuildContext, splash_prefix: &str, color: &str, quietable: bool) -> Script {
    let mut script = Script::new();
    if splash(ctx) {
        script.push(Stmt::if_then(
            Line::cmd("plymouth --ping"),
            vec![
                Stmt::Raw(format!(
                    r#"plymouth display-message --text="{}${{*}}""#,
                    splash_prefix
                )),
                Stmt::Raw("return".into()),
            ],
        ));
    }
    if quietable {
        script.extend(Script::raw(
            r#"
            if check_var quiet; then
                return
            fi
            "#,
        ));
    }
    script.push(Stmt::Raw(format!(
        r#"printf "\033[{}m *\033[0m %s\n" "${{*}}""#,
        color
    )));
    script
}

fn einfo(ctx: &mut BuildContext) -> Result<Script> {
    Ok(message(ctx, "", "1;32", true))
}

fn ewarn(ctx: &mut BuildContext) -> Result<Script> {
    Ok(message(ctx, "Warning: ", "1;33", true))
}

fn eerror(ctx: &mut BuildContext) -> Result<Script> {
    Ok(message(ctx, "Error: ", "1;31", false))
}

fn klog(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(r#"echo "${*}" > /dev/kmsg"#))
}

fn wait_enter(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        tty_env=$(stty -g)
        t=$(printf "%.0f" "$(echo "${1:-0} * 10" | bc)")
        if [ "$t" -gt 300 ]; then
            stty raw -echo min 0 time 300
        elif [ "$t" -gt 0 ]; then
            stty raw -echo min 0 time "$t"
        else
            stty raw -echo
        fi
        char="$(dd bs=1 count=1 2>/dev/null)"
        stty "$tty_env"
        case "$char" in
            $(printf '\r')) return 0 ;;
            *) return 1 ;;
        esac
        "#,
    ))
}

fn prompt_user(ctx: &mut BuildContext) -> Result<Script> {
    let echo = Stmt::Raw(r#"printf "\033[1;35m *\033[0m %s\n" "$prompt""#.into());
    let mut script = Script::raw(r#"prompt=${1:-"Press enter to continue."}"#);
    if splash(ctx) {
        script.push(Stmt::If {
            branches: vec![(
                Line::cmd("plymouth --ping"),
                vec![Stmt::Raw(r#"plymouth display-message --text="$prompt""#.into())],
            )],
            otherwise: Some(vec![echo]),
        });
    } else {
        script.push(echo);
    }
    script.extend(Script::raw("wait_enter \"$2\"\nreturn \"$?\""));
    Ok(script)
}

fn retry(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        retries=${1}
        timeout=${2}
        shift 2
        if [ "$retries" -eq 0 ]; then
            "$@"
            return "$?"
        elif [ "$retries" -lt 0 ]; then
            retries=1000
        fi
        i=-1; while [ "$((i += 1))" -lt "$retries" ]; do
            if "$@"; then
                return 0
            fi
            ewarn "[${i}/${retries}] Failed: ${*}"
            if [ "$i" -lt "$((retries - 1))" ]; then
                prompt_user "Retrying in: ${timeout}s" "$timeout"
            fi
        done
        return 1
        "#,
    ))
}

fn rd_restart(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        if [ "$$" -eq 1 ]; then
            einfo "Restarting init"
            exec /init ; exit
        else
            ewarn "PID is not 1, exiting: $$"
            exit 1
        fi
        "#,
    ))
}

fn rd_fail(ctx: &mut BuildContext) -> Result<Script> {
    let mut script = Script::raw(
        r#"
        if [ -n "$1" ]; then
            eerror "Failure: $1"
        else
            eerror "Boot failed."
        fi
        prompt_user "Press enter to display debug info."
        eerror "Loaded modules:\n$(cat /proc/modules)"
        eerror "Block devices:\n$(blkid)"
        eerror "Mounts:\n$(mount)"
        "#,
    );
    let shell = Stmt::Raw("sh -l".into());
    let recovery = if splash(ctx) {
        vec![
            Stmt::Raw(r#"einfo "Entering recovery shell""#.into()),
            Stmt::If {
                branches: vec![(
                    Line::cmd("plymouth --ping"),
                    vec![
                        Stmt::Raw(r#"plymouth display-message --text="Entering recovery shell""#.into()),
                        Stmt::Raw("plymouth hide-splash".into()),
                        shell.clone(),
                        Stmt::Raw("plymouth show-splash".into()),
                    ],
                )],
                otherwise: Some(vec![shell]),
            },
        ]
    } else {
        vec![Stmt::Raw(r#"einfo "Entering recovery shell""#.into()), shell]
    };
    script.push(Stmt::if_then(Line::cmd(r#"[ "$(readvar recovery)" = "1" ]"#), recovery));
    script.extend(Script::raw("prompt_user \"Press enter to restart init.\"\nrd_restart"));
    Ok(script)
}

fn find_init(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        for init_path in "/sbin/init" "/bin/init" "/init"; do
            if [ -e "$(readvar SWITCH_ROOT_TARGET)$init_path" ] ; then
                einfo "Found init at: $(readvar SWITCH_ROOT_TARGET)$init_path"
                setvar init "$init_path"
                return
            fi
        done
        eerror "Unable to find init."
        return 1
        "#,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Boot phases
// ─────────────────────────────────────────────────────────────────────────────

fn mount_base(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        mount -t proc proc /proc
        mount -t sysfs sysfs /sys
        mount -t devtmpfs devtmpfs /dev
        mount -t tmpfs tmpfs /run
        mkdir -p /run/vars
        "#,
    ))
}

/// Exports become files under `/run/vars`.
fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Persist every export with `setvar`.
fn export_vars(ctx: &mut BuildContext) -> Result<Script> {
    let mut script = Script::new();
    let Some(exports) = ctx.config.get_map("exports") else {
        return Ok(script);
    };
    for (name, value) in exports {
        if !is_var_name(name) {
            return Err(Error::invalid_parameter(name.as_str(), "exports (not a valid variable name)"));
        }
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        script.push(Line::cmd("setvar").raw(name.as_str()).lit(value));
    }
    Ok(script)
}

fn set_loglevel(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw("readvar loglevel > /proc/sys/kernel/printk"))
}

fn do_switch_root(ctx: &mut BuildContext) -> Result<Script> {
    if !ctx.config.contains("init_target") {
        return Err(Error::validation("init_target must be set"));
    }
    let version = crate::VERSION;
    Ok(Script::raw(&format!(
        r#"
        if [ $$ -ne 1 ] ; then
            eerror "Cannot switch_root from PID: $$, exiting."
            exit 1
        fi
        init_target=$(readvar init) || rd_fail "init_target not set."
        einfo "Checking root mount: $(readvar SWITCH_ROOT_TARGET)"
        if ! grep -q " $(readvar SWITCH_ROOT_TARGET) " /proc/mounts ; then
            rd_fail "Root not found at: $(readvar SWITCH_ROOT_TARGET)"
        elif [ ! -e "$(readvar SWITCH_ROOT_TARGET)${{init_target}}" ] ; then
            ewarn "$init_target not found at: $(readvar SWITCH_ROOT_TARGET)"
            einfo "Target root contents:\n$(ls -l "$(readvar SWITCH_ROOT_TARGET)")"
            if _find_init ; then
                einfo "Switching root to: $(readvar SWITCH_ROOT_TARGET) $(readvar init)"
                klog "[rdgen {version}] Running init: $(readvar init)"
                exec switch_root "$(readvar SWITCH_ROOT_TARGET)" "$(readvar init)"
            fi
            rd_fail "Unable to find init."
        else
            einfo "Switching root to: $(readvar SWITCH_ROOT_TARGET) $init_target"
            klog "[rdgen {version}] Running init: $init_target"
            exec switch_root "$(readvar SWITCH_ROOT_TARGET)" "$init_target"
        fi
        "#
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;
    use crate::module::Registry;

    fn ctx_with(modules: &[&str]) -> BuildContext {
        let mut ctx = BuildContext::for_testing(FixedHost::default()).unwrap();
        let registry = Registry::builtin();
        for m in modules {
            registry.load(&mut ctx.config, m).unwrap();
        }
        ctx
    }

    #[test]
    fn test_set_shebang_default_and_args() {
        let mut ctx = ctx_with(&["base"]);
        set_shebang(&mut ctx).unwrap();
        assert_eq!(ctx.config.get_str("shebang"), Some("#!/bin/sh"));

        let mut ctx = ctx_with(&["base"]);
        ctx.config.set("shebang_args", json!("-l")).unwrap();
        set_shebang(&mut ctx).unwrap();
        assert_eq!(ctx.config.get_str("shebang"), Some("#!/bin/sh -l"));
    }

    #[test]
    fn test_set_shebang_keeps_configured() {
        let mut ctx = ctx_with(&["base"]);
        ctx.config.set("shebang", json!("#!/bin/busybox sh")).unwrap();
        set_shebang(&mut ctx).unwrap();
        assert_eq!(ctx.config.get_str("shebang"), Some("#!/bin/busybox sh"));
    }

    #[test]
    fn test_switch_root_target_from_root_mount() {
        let mut ctx = ctx_with(&["base", "mounts"]);
        ctx.config
            .set("mounts", json!({"root": {"uuid": "x", "destination": "/newroot"}}))
            .unwrap();
        export_switch_root_target(&mut ctx).unwrap();
        assert_eq!(
            ctx.config.get_entry("exports", "SWITCH_ROOT_TARGET"),
            Some(&json!("/newroot"))
        );
    }

    #[test]
    fn test_export_vars_quotes_values() {
        let mut ctx = ctx_with(&["base"]);
        ctx.config
            .set("exports", json!({"A": "it's", "loglevel": 5}))
            .unwrap();
        let lines = export_vars(&mut ctx).unwrap().lines();
        assert_eq!(lines, vec![r"setvar A 'it'\''s'", "setvar loglevel '5'"]);
    }

    #[test]
    fn test_export_vars_rejects_bad_name() {
        let mut ctx = ctx_with(&["base"]);
        ctx.config.set("exports", json!({"BAD/NAME": "x"})).unwrap();
        assert!(matches!(
            export_vars(&mut ctx),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_helpers_are_splash_aware() {
        let mut plain = ctx_with(&["base"]);
        let lines = einfo(&mut plain).unwrap().lines();
        assert!(!lines.iter().any(|l| l.contains("plymouth")));

        let mut splash = ctx_with(&["base", "plymouth"]);
        let lines = einfo(&mut splash).unwrap().lines();
        assert_eq!(lines[0], "if plymouth --ping; then");
        assert!(rd_fail(&mut splash).unwrap().render().contains("plymouth hide-splash"));
    }

    #[test]
    fn test_do_switch_root_carries_version() {
        let mut ctx = ctx_with(&["base"]);
        let text = do_switch_root(&mut ctx).unwrap().render();
        assert!(text.contains(&format!("[rdgen {}]", crate::VERSION)));
        assert!(text.starts_with("if [ $$ -ne 1 ] ; then"));
    }

    #[test]
    fn test_check_included_or_mounted() {
        let mut ctx = ctx_with(&["base", "mounts"]);
        ctx.config
            .set("mounts", json!({"keys": {"destination": "/mnt/keys"}}))
            .unwrap();
        ctx.config.append_to("dependencies", json!("/etc/embedded.key")).unwrap();
        ctx.config
            .append_to(
                "check_included_or_mounted",
                json!(["/etc/embedded.key", "/mnt/keys/root.key", "/etc/lost.key", "/etc/lost.key"]),
            )
            .unwrap();
        assert_eq!(check_included_or_mounted(&ctx.config), vec!["/etc/lost.key"]);
    }

    #[test]
    fn test_deploy_dependencies_copies_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let source = temp.path().join("libfoo.so");
        std::fs::write(&source, "lib").unwrap();
        let mut ctx = ctx_with(&["base"]);
        let build = temp.path().join("build");
        ctx.config.set("build_dir", json!(build.to_string_lossy())).unwrap();
        let dep = source.to_string_lossy().to_string();
        ctx.config.append_to("dependencies", json!(dep)).unwrap();
        ctx.config.append_to("dependencies", json!(dep)).unwrap();

        deploy_dependencies(&mut ctx).unwrap();
        assert!(staging::build_path(&build, &source).exists());
    }
}

//! Root filesystem mount.

use serde_json::{Map, Value};

use super::{Dep, Module};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::hook::{func, Hook};
use crate::module::base::DEFAULT_ROOT_TARGET;
use crate::shell::{Dq, Line, Script};

/// Tokens that can identify the root source, in order of preference.
const SOURCE_TOKENS: [&str; 4] = ["uuid", "partuuid", "label", "path"];

pub static MOUNTS: Module = Module {
    name: "mounts",
    depends: &[Dep::Module("base")],
    binaries: &["umount"],
    hooks: &[(Hook::InitMount, &[func("mount_root", mount_root)])],
    ..Module::EMPTY
};

/// `mount` arguments for the configured root: source spec and destination.
pub fn root_source(ctx: &BuildContext) -> Result<(String, String, Map<String, Value>)> {
    let root = ctx
        .config
        .get_entry("mounts", "root")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| Error::validation("mounts.root is not configured"))?;

    let source = SOURCE_TOKENS
        .iter()
        .find_map(|token| {
            root.get(*token).and_then(Value::as_str).map(|value| match *token {
                "path" => value.to_string(),
                other => format!("{}={}", other.to_uppercase(), value),
            })
        })
        .ok_or_else(|| {
            Error::validation("mounts.root requires one of uuid, partuuid, label or path")
        })?;

    let destination = root
        .get("destination")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ROOT_TARGET)
        .to_string();
    Ok((source, destination, root))
}

/// Mount the root with extra options prepended to the configured ones.
pub fn mount_root_script(ctx: &BuildContext, extra_options: &[String]) -> Result<Script> {
    let (source, destination, root) = root_source(ctx)?;

    let mut options: Vec<String> = extra_options.to_vec();
    match root.get("options") {
        Some(Value::Array(list)) => options.extend(list.iter().filter_map(Value::as_str).map(str::to_string)),
        Some(Value::String(s)) => options.push(s.clone()),
        _ => options.push("ro".to_string()),
    }

    let mut mount = Line::cmd("mount");
    if let Some(fs_type) = root.get("type").and_then(Value::as_str) {
        mount = mount.raw("-t").lit(fs_type);
    }
    let mount = mount
        .raw("-o")
        .lit(options.join(","))
        .lit(source.as_str())
        .lit(destination.as_str())
        .raw("||")
        .raw("rd_fail")
        .dq(Dq::new().text(format!("Failed to mount root: {}", source)));

    let mut script = Script::line(
        Line::cmd("einfo").dq(Dq::new().text(format!("Mounting root: {} -> {}", source, destination))),
    );
    script.push(Line::cmd("mkdir -p").lit(destination));
    script.push(mount);
    Ok(script)
}

fn mount_root(ctx: &mut BuildContext) -> Result<Script> {
    mount_root_script(ctx, &[])
}

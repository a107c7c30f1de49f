//! Btrfs root subvolume support.
//!
//! Setting `root_subvol` masks the plain `mount_root` in `init_mount` and
//! mounts the subvolume instead.

use serde_json::{json, Value};
use tracing::info;

use super::{Dep, Module, Processor};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::hook::{func, Hook};
use crate::module::mounts;
use crate::shell::Script;
use crate::store::{param, ConfigStore, Kind};

pub static BTRFS: Module = Module {
    name: "btrfs",
    depends: &[Dep::Module("mounts")],
    binaries: &["btrfs"],
    parameters: &[param("root_subvol", Kind::Scalar)],
    hooks: &[(Hook::InitMount, &[func("mount_subvol", mount_subvol)])],
    processors: &[Processor::Single("root_subvol", process_root_subvol)],
    ..Module::EMPTY
};

fn process_root_subvol(config: &mut ConfigStore, value: Value) -> Result<()> {
    let Some(subvol) = value.as_str() else {
        return Err(Error::invalid_parameter("root_subvol", "btrfs (expected a string)"));
    };
    config.set_scalar("root_subvol", json!(subvol))?;
    config.set("masks", json!({ Hook::InitMount.name(): "mount_root" }))?;
    info!("Set root_subvol: {}", subvol);
    Ok(())
}

fn mount_subvol(ctx: &mut BuildContext) -> Result<Script> {
    let Some(subvol) = ctx.config.get_str("root_subvol") else {
        return Ok(Script::new());
    };
    let option = format!("subvol={}", subvol);
    mounts::mount_root_script(ctx, &[option])
}

//! Plymouth splash. Loading this module switches the logging and prompt
//! helpers, and the cryptsetup unlock, to splash-aware output.
//!
//! The daemon starts in `init_debug`, after the base mounts and before any
//! `init_early` function can prompt, whatever the order of `modules`.

use super::{Dep, Module};
use crate::context::BuildContext;
use crate::error::Result;
use crate::hook::{func, Hook};
use crate::shell::Script;

pub static PLYMOUTH: Module = Module {
    name: "plymouth",
    depends: &[Dep::Module("base")],
    binaries: &["plymouthd", "plymouth"],
    hooks: &[(Hook::InitDebug, &[func("start_plymouth", start_plymouth)])],
    ..Module::EMPTY
};

fn start_plymouth(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        mkdir -p /run/plymouth
        plymouthd --attach-to-session --pid-file /run/plymouth/pid --mode=boot
        plymouth show-splash
        "#,
    ))
}

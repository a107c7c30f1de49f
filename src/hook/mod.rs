//! Named hooks and the functions bound to them.
//!
//! A hook is a fixed point in either the build (directory setup, build
//! tasks, packing) or the generated boot sequence. Functions are bound to
//! hooks statically by modules; [`HookPipeline`] runs them in order.

pub mod pipeline;

pub use pipeline::HookPipeline;

use std::fmt;
use std::str::FromStr;

use crate::context::BuildContext;
use crate::error::{DependencyKind, Error, Result};
use crate::shell::Script;

/// Hook points, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Hook {
    /// Build tree preparation: clean, create directories, host detection.
    BuildPre = 1,
    /// Build tasks that need the fully processed configuration.
    BuildTasks = 2,
    /// Functions that must always be defined in `init_funcs.sh`.
    Functions = 3,
    /// Mount pseudo filesystems and export variables.
    InitPre = 4,
    InitDebug = 5,
    InitEarly = 6,
    InitMain = 7,
    InitLate = 8,
    InitPremount = 9,
    InitMount = 10,
    InitCleanup = 11,
    /// Switch into the real root.
    InitFinal = 12,
    /// Single function replacing every main phase.
    CustomInit = 13,
    /// Packing the finished build tree.
    Pack = 14,
}

impl Hook {
    pub const ALL: [Hook; 14] = [
        Hook::BuildPre,
        Hook::BuildTasks,
        Hook::Functions,
        Hook::InitPre,
        Hook::InitDebug,
        Hook::InitEarly,
        Hook::InitMain,
        Hook::InitLate,
        Hook::InitPremount,
        Hook::InitMount,
        Hook::InitCleanup,
        Hook::InitFinal,
        Hook::CustomInit,
        Hook::Pack,
    ];

    /// Boot phases between `init_pre` and `init_final`.
    pub const INIT_MAIN: [Hook; 7] = [
        Hook::InitDebug,
        Hook::InitEarly,
        Hook::InitMain,
        Hook::InitLate,
        Hook::InitPremount,
        Hook::InitMount,
        Hook::InitCleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Hook::BuildPre => "build_pre",
            Hook::BuildTasks => "build_tasks",
            Hook::Functions => "functions",
            Hook::InitPre => "init_pre",
            Hook::InitDebug => "init_debug",
            Hook::InitEarly => "init_early",
            Hook::InitMain => "init_main",
            Hook::InitLate => "init_late",
            Hook::InitPremount => "init_premount",
            Hook::InitMount => "init_mount",
            Hook::InitCleanup => "init_cleanup",
            Hook::InitFinal => "init_final",
            Hook::CustomInit => "custom_init",
            Hook::Pack => "pack",
        }
    }

    /// Whether output of this hook ends up in the generated init.
    pub fn is_boot_phase(self) -> bool {
        matches!(self, Hook::InitPre | Hook::InitFinal) || Hook::INIT_MAIN.contains(&self)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hook {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hook::ALL
            .into_iter()
            .find(|h| h.name() == s)
            .ok_or_else(|| Error::MissingDependency {
                kind: DependencyKind::Hook,
                name: s.to_string(),
                required_by: "hook lookup".to_string(),
            })
    }
}

/// Uniform signature of every hook function.
///
/// Build-time functions mutate the context and usually return an empty
/// script; boot-time functions return the shell they contribute.
pub type HookFn = fn(&mut BuildContext) -> Result<Script>;

/// A named hook function.
#[derive(Clone, Copy)]
pub struct Func {
    pub name: &'static str,
    pub run: HookFn,
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func").field("name", &self.name).finish()
    }
}

/// Bind a function name to its implementation.
pub const fn func(name: &'static str, run: HookFn) -> Func {
    Func { name, run }
}

/// Where a function being run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Part of the generator itself.
    Internal,
    /// Contributed by the named module.
    Module(&'static str),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Internal => f.write_str("internal"),
            Source::Module(name) => write!(f, "module '{}'", name),
        }
    }
}

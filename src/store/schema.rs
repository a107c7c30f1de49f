//! Parameter declarations: which keys exist, what kind of value they hold,
//! and their defaults.

use serde_json::Value;

/// How a key merges when it is assigned again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Single value. Re-assigning a different value is a conflict.
    Scalar,
    /// Ordered sequence. Assignment appends.
    List,
    /// Mapping merged recursively; differing scalars conflict.
    Map,
    /// Mapping whose values are sequences (masks, imports).
    MapOfLists,
    /// Mapping merged recursively where new keys win.
    Table,
}

impl Kind {
    pub fn is_mapping(self) -> bool {
        matches!(self, Kind::Map | Kind::MapOfLists | Kind::Table)
    }

    /// Infer the kind of an undeclared key from its current value.
    pub fn infer(value: &Value) -> Kind {
        match value {
            Value::Array(_) => Kind::List,
            Value::Object(_) => Kind::Map,
            _ => Kind::Scalar,
        }
    }
}

/// Static default value for a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lit {
    Bool(bool),
    Int(u64),
    Str(&'static str),
}

impl Lit {
    pub fn to_value(self) -> Value {
        match self {
            Lit::Bool(b) => Value::Bool(b),
            Lit::Int(n) => Value::from(n),
            Lit::Str(s) => Value::from(s),
        }
    }
}

/// A declared parameter.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub key: &'static str,
    pub kind: Kind,
    pub default: Option<Lit>,
}

/// Declare a parameter with no default.
pub const fn param(key: &'static str, kind: Kind) -> Param {
    Param {
        key,
        kind,
        default: None,
    }
}

/// Declare a scalar parameter with a default.
pub const fn scalar(key: &'static str, default: Lit) -> Param {
    Param {
        key,
        kind: Kind::Scalar,
        default: Some(default),
    }
}

/// Parameters every build has, before any module is loaded.
pub const CORE_PARAMETERS: &[Param] = &[
    param("modules", Kind::List),
    param("binaries", Kind::List),
    param("dependencies", Kind::List),
    param("paths", Kind::List),
    param("kernel_modules", Kind::List),
    param("_kmod_auto", Kind::List),
    param("check_included_or_mounted", Kind::List),
    param("masks", Kind::MapOfLists),
    param("imports", Kind::MapOfLists),
    param("exports", Kind::Map),
    param("mounts", Kind::Table),
    scalar("build_dir", Lit::Str("/tmp/initramfs")),
    scalar("out_dir", Lit::Str("/tmp/initramfs_out")),
    scalar("clean", Lit::Bool(true)),
    scalar("validate", Lit::Bool(true)),
    scalar("hostonly", Lit::Bool(true)),
    param("shebang", Kind::Scalar),
    scalar("shebang_args", Lit::Str("")),
    scalar("loglevel", Lit::Int(5)),
    scalar("timeout", Lit::Int(15)),
    scalar("custom_init_file", Lit::Str("init_main.sh")),
    scalar("check_shell_syntax", Lit::Bool(true)),
];

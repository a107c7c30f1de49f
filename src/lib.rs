//! rdgen: modular initramfs generator.
//!
//! Modules merge their configuration into a [`store::ConfigStore`], the
//! [`resolve`] pass checks dependencies and masks, and the
//! [`hook::HookPipeline`] runs build and boot phases whose output the
//! [`assemble`] step turns into `init` and `init_funcs.sh`.

pub mod assemble;
pub mod config;
pub mod context;
pub mod crypt;
pub mod error;
pub mod generator;
pub mod hook;
pub mod host;
pub mod module;
pub mod process;
pub mod resolve;
pub mod shell;
pub mod staging;
pub mod store;
pub mod timing;

pub use error::{Error, Result};
pub use generator::Generator;

/// Version stamped into generated scripts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Runtime settings.
//!
//! Read from the environment after `.env` has been loaded with dotenvy, so
//! real environment variables take precedence over the file.
//!
//! - `RDGEN_CONFIG`: module configuration file
//! - `RDGEN_BUILD_DIR`: overrides `build_dir`
//! - `RDGEN_TIMEOUT`: seconds allowed for each host inspection command

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const SYSTEM_CONFIG: &str = "/etc/rdgen/config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: None,
            build_dir: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> Self {
        let timeout = match env::var("RDGEN_TIMEOUT") {
            Ok(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("Ignoring invalid RDGEN_TIMEOUT: {}", raw);
                DEFAULT_TIMEOUT_SECS
            }),
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };
        Self {
            config_path: non_empty_var("RDGEN_CONFIG").map(PathBuf::from),
            build_dir: non_empty_var("RDGEN_BUILD_DIR").map(PathBuf::from),
            timeout: Duration::from_secs(timeout),
        }
    }

    /// Config files to try, in order.
    pub fn config_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config_path {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG));
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("rdgen/config.json"));
        }
        candidates
    }

    /// Pick the configuration file: an explicit path always wins, then
    /// `RDGEN_CONFIG`, then the first default location that exists.
    pub fn find_config(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        self.config_candidates().into_iter().find(|p| p.is_file())
    }

    pub fn print(&self) {
        println!("Settings:");
        match &self.config_path {
            Some(path) => println!("  RDGEN_CONFIG: {}", path.display()),
            None => println!("  RDGEN_CONFIG: (unset)"),
        }
        match &self.build_dir {
            Some(path) => println!("  RDGEN_BUILD_DIR: {}", path.display()),
            None => println!("  RDGEN_BUILD_DIR: (unset)"),
        }
        println!("  RDGEN_TIMEOUT: {}s", self.timeout.as_secs());
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for var in ["RDGEN_CONFIG", "RDGEN_BUILD_DIR", "RDGEN_TIMEOUT"] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let settings = Settings::load();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear();
        env::set_var("RDGEN_CONFIG", "/tmp/rd.json");
        env::set_var("RDGEN_BUILD_DIR", "/tmp/rd-build");
        env::set_var("RDGEN_TIMEOUT", "30");
        let settings = Settings::load();
        clear();
        assert_eq!(settings.config_path, Some(PathBuf::from("/tmp/rd.json")));
        assert_eq!(settings.build_dir, Some(PathBuf::from("/tmp/rd-build")));
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.config_candidates()[0], PathBuf::from("/tmp/rd.json"));
    }

    #[test]
    #[serial]
    fn test_invalid_timeout_falls_back() {
        clear();
        env::set_var("RDGEN_TIMEOUT", "soon");
        let settings = Settings::load();
        clear();
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_explicit_config_wins() {
        let settings = Settings {
            config_path: Some(PathBuf::from("/from/env.json")),
            ..Default::default()
        };
        assert_eq!(
            settings.find_config(Some(Path::new("cli.json"))),
            Some(PathBuf::from("cli.json"))
        );
        assert_eq!(settings.find_config(None), Some(PathBuf::from("/from/env.json")));
    }
}

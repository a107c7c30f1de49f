//! Build tree helpers.
//!
//! Everything the generator writes lands under `build_dir`. Absolute paths
//! from the configuration are re-rooted there.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::shell::Script;

/// Map an absolute target path to its location inside the build tree.
pub fn build_path(build_dir: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    build_dir.join(relative)
}

/// Remove the build tree if `clean` is set.
pub fn clean_build_dir(ctx: &mut BuildContext) -> Result<Script> {
    let build_dir = ctx.build_dir();
    if !ctx.config.get_bool("clean") {
        debug!(build_dir = %build_dir.display(), "clean disabled, keeping build dir");
        return Ok(Script::new());
    }
    if build_dir.exists() {
        info!("Cleaning build directory: {}", build_dir.display());
        fs::remove_dir_all(&build_dir).map_err(|e| Error::io(&build_dir, e))?;
    }
    Ok(Script::new())
}

/// Create the build tree and every directory in `paths`.
pub fn generate_structure(ctx: &mut BuildContext) -> Result<Script> {
    let build_dir = ctx.build_dir();
    create_dir(&build_dir)?;
    let mut paths = ctx.config.str_list("paths");
    paths.sort();
    paths.dedup();
    for path in paths {
        create_dir(&build_path(&build_dir, Path::new(&path)))?;
    }
    Ok(Script::new())
}

pub fn create_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
    debug!("Created directory: {}", path.display());
    Ok(())
}

/// Write `lines` to `path`, newline terminated, with the given mode.
pub fn write_file(path: &Path, lines: &[String], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(path, contents).map_err(|e| Error::io(path, e))?;
    set_mode(path, mode)?;
    info!("Wrote file: {}", path.display());
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Copy a host file into the same location inside the build tree.
pub fn copy_into(build_dir: &Path, source: &Path) -> Result<PathBuf> {
    let dest = build_path(build_dir, source);
    if dest.exists() {
        warn!("File already exists in build dir, skipping: {}", dest.display());
        return Ok(dest);
    }
    if let Some(parent) = dest.parent() {
        create_dir(parent)?;
    }
    fs::copy(source, &dest).map_err(|e| Error::io(source, e))?;
    debug!("Copied {} -> {}", source.display(), dest.display());
    Ok(dest)
}

/// File count and total size of the build tree.
pub fn summarize(build_dir: &Path) -> (usize, u64) {
    WalkDir::new(build_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(count, size), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, size + len)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;
    use serde_json::json;
    use tempfile::TempDir;

    fn ctx_in(dir: &Path) -> BuildContext {
        let mut ctx = BuildContext::for_testing(FixedHost::default()).unwrap();
        ctx.config
            .set("build_dir", json!(dir.join("build").to_string_lossy()))
            .unwrap();
        ctx
    }

    #[test]
    fn test_build_path_reroots_absolute() {
        let root = Path::new("/tmp/build");
        assert_eq!(build_path(root, Path::new("/etc/keys/root.key")), root.join("etc/keys/root.key"));
        assert_eq!(build_path(root, Path::new("run")), root.join("run"));
    }

    #[test]
    fn test_generate_structure_creates_paths() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_in(temp.path());
        ctx.config.set("paths", json!(["/proc", "/sys", "/proc"])).unwrap();

        let out = generate_structure(&mut ctx).unwrap();
        assert!(out.is_empty());
        assert!(temp.path().join("build/proc").is_dir());
        assert!(temp.path().join("build/sys").is_dir());
    }

    #[test]
    fn test_clean_build_dir_respects_flag() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_in(temp.path());
        let marker = temp.path().join("build/marker");
        write_file(&marker, &["x".to_string()], 0o644).unwrap();

        ctx.config.set("clean", json!(false)).unwrap();
        clean_build_dir(&mut ctx).unwrap();
        assert!(marker.exists());

        ctx.config.overwrite("clean", json!(true)).unwrap();
        clean_build_dir(&mut ctx).unwrap();
        assert!(!temp.path().join("build").exists());
    }

    #[test]
    fn test_write_file_sets_mode_and_summary() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/init");
        write_file(&path, &["#!/bin/sh".to_string(), "exit 0".to_string()], 0o755).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "#!/bin/sh\nexit 0\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        let (count, size) = summarize(temp.path());
        assert_eq!(count, 1);
        assert_eq!(size, 17);
    }

    #[test]
    fn test_copy_into() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("key.bin");
        fs::write(&source, "secret").unwrap();
        let build = temp.path().join("build");

        let dest = copy_into(&build, &source).unwrap();
        assert_eq!(dest, build_path(&build, &source));
        assert_eq!(fs::read_to_string(dest).unwrap(), "secret");
    }
}

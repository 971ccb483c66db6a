//! Entry-point launch with the bundle environment

use std::{
    env,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use log::debug;

use crate::{
    config::RuntimeConfig,
    error::{Error, Result},
};

const BIN_DIRS: &[&str] = &["bin", "usr/bin", "shared/bin"];
const LIB_DIRS: &[&str] = &[
    "lib",
    "usr/lib",
    "shared/lib",
    "lib64",
    "usr/lib64",
    "lib32",
    "usr/lib32",
    "libx32",
    "usr/libx32",
];

fn existing_dirs(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| root.join(name))
        .filter(|path| path.is_dir())
        .collect()
}

fn join_search_path(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Splice the bundle dirs into a host search path. The bundle side only wins
/// when the matching overtake toggle is set.
fn compose_search_path(host: Option<String>, bundle: &str, overtake: bool) -> String {
    match host.filter(|h| !h.is_empty()) {
        None => bundle.to_string(),
        Some(host) if bundle.is_empty() => host,
        Some(host) if overtake => format!("{bundle}:{host}"),
        Some(host) => format!("{host}:{bundle}"),
    }
}

/// The environment of the entry-point child.
pub fn bundle_env(cfg: &RuntimeConfig, argv0: &str) -> Vec<(String, String)> {
    let bin_path = join_search_path(&existing_dirs(&cfg.mount_dir, BIN_DIRS));
    let lib_path = join_search_path(&existing_dirs(&cfg.mount_dir, LIB_DIRS));

    let overtake_path = env::var_os("PBUNDLE_OVERTAKE_PATH").is_some_and(|v| !v.is_empty());
    let mut vars = vec![
        (
            "PATH".to_string(),
            compose_search_path(env::var("PATH").ok(), &bin_path, overtake_path),
        ),
        (format!("{}_binDir", cfg.r_exe_name), bin_path),
        (format!("{}_libDir", cfg.r_exe_name), lib_path.clone()),
        (
            format!("{}_mountDir", cfg.r_exe_name),
            cfg.mount_dir.to_string_lossy().into_owned(),
        ),
        (
            "APPDIR".to_string(),
            cfg.mount_dir.to_string_lossy().into_owned(),
        ),
        (
            "SELF".to_string(),
            cfg.self_path.to_string_lossy().into_owned(),
        ),
        (
            "APPIMAGE".to_string(),
            cfg.self_path.to_string_lossy().into_owned(),
        ),
        ("ARGV0".to_string(), argv0.to_string()),
    ];

    if env::var_os("PBUNDLE_OVERTAKE_LD_LIBRARY_PATH").is_some_and(|v| !v.is_empty()) {
        vars.push((
            "LD_LIBRARY_PATH".to_string(),
            compose_search_path(env::var("LD_LIBRARY_PATH").ok(), &lib_path, true),
        ));
    }

    // Portable dirs created by --pbundle_portableHome / --pbundle_portableConfig
    let home = portable_dir(&cfg.self_path, "home");
    if home.is_dir() {
        vars.push(("HOME".to_string(), home.to_string_lossy().into_owned()));
    }
    let config = portable_dir(&cfg.self_path, "config");
    if config.is_dir() {
        vars.push((
            "XDG_CONFIG_HOME".to_string(),
            config.to_string_lossy().into_owned(),
        ));
    }

    vars
}

/// `<selfPath>.home` / `<selfPath>.config`
pub fn portable_dir(self_path: &Path, kind: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", self_path.display(), kind))
}

/// Resolve the entry point. A `--pbundle_link` target with a slash is taken
/// as a path; a bare name is looked up in the bundle bin dirs first.
pub fn resolve_entry(cfg: &RuntimeConfig, link: Option<&str>) -> PathBuf {
    match link {
        None => cfg.entrypoint.clone(),
        Some(target) if target.contains('/') => PathBuf::from(target),
        Some(name) => {
            for dir in existing_dirs(&cfg.mount_dir, BIN_DIRS) {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return candidate;
                }
            }
            PathBuf::from(name)
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

/// Spawn the entry point with forwarded stdio and wait for it.
pub fn run_entrypoint(cfg: &RuntimeConfig, entry: &Path, args: &[String]) -> Result<i32> {
    let argv0 = env::args().next().unwrap_or_default();
    let argv0 = Path::new(&argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    debug!("launching {} {:?}", entry.display(), args);
    let status = Command::new(entry)
        .args(args)
        .envs(bundle_env(cfg, &argv0))
        .status()
        .map_err(|e| Error::Other(format!("failed to launch {}: {}", entry.display(), e)))?;

    Ok(exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compose_search_path_polarity() {
        assert_eq!(
            compose_search_path(Some("/usr/bin".into()), "/m/bin", false),
            "/usr/bin:/m/bin"
        );
        assert_eq!(
            compose_search_path(Some("/usr/bin".into()), "/m/bin", true),
            "/m/bin:/usr/bin"
        );
        assert_eq!(compose_search_path(None, "/m/bin", false), "/m/bin");
        assert_eq!(
            compose_search_path(Some("/usr/bin".into()), "", true),
            "/usr/bin"
        );
    }

    #[test]
    fn test_existing_dirs_filters() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::create_dir_all(root.path().join("shared/bin")).unwrap();

        let found = existing_dirs(root.path(), BIN_DIRS);
        assert_eq!(
            found,
            vec![root.path().join("usr/bin"), root.path().join("shared/bin")]
        );
    }

    #[test]
    fn test_portable_dir_naming() {
        assert_eq!(
            portable_dir(Path::new("/apps/editor.AppBundle"), "home"),
            PathBuf::from("/apps/editor.AppBundle.home")
        );
        assert_eq!(
            portable_dir(Path::new("/apps/editor.AppBundle"), "config"),
            PathBuf::from("/apps/editor.AppBundle.config")
        );
    }
}

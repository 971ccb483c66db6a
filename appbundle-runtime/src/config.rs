//! Process-lifetime configuration
//!
//! Assembled once at startup from the bundle's own bytes (xattr fast path or
//! ELF slow path) plus environment and filesystem inspection. Single owner,
//! never shared across threads.

use std::{
    env,
    fs::{self, File},
    path::{Path, PathBuf},
};

use log::debug;
use pbundle_meta::{
    cache::{self, CachedConfig},
    elf, id,
    FilesystemType, RuntimeInfo, DEFAULT_MOUNT_OR_EXTRACT,
};

use crate::error::{Error, Result};

pub struct RuntimeConfig {
    pub self_path: PathBuf,
    /// Held open for the whole process so the bundle cannot vanish while the
    /// FUSE helper and the entry point still read from it.
    pub self_file: File,
    pub fs_type: FilesystemType,
    pub app_bundle_id: String,
    pub pelf_version: String,
    pub host_info: String,
    pub hash: String,
    pub disable_random_workdir: bool,
    pub mount_or_extract: u8,
    pub archive_offset: u64,
    /// Size of the trailing filesystem image (`EOF - archive_offset`).
    pub image_size: u64,
    pub r_exe_name: String,
    pub pool_dir: PathBuf,
    pub work_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub entrypoint: PathBuf,
    pub static_tools_dir: PathBuf,
    /// Deterministic workdirs are reused across runs; nothing is torn down.
    pub no_cleanup: bool,
}

impl RuntimeConfig {
    pub fn discover() -> Result<Self> {
        let self_path = fs::canonicalize(env::current_exe()?)?;
        let self_file = File::open(&self_path)?;

        // Fast path: the xattr projection written on a previous run. The
        // projection does not carry mountOrExtract, so cached runs use the
        // default strategy.
        let (cached, mount_or_extract) = match cache::read(&self_path) {
            Some(cached) => {
                debug!("bundle metadata served from xattr cache");
                (cached, DEFAULT_MOUNT_OR_EXTRACT)
            }
            None => slow_path(&self_path)?,
        };

        let bundle_len = self_file.metadata()?.len();
        if cached.archive_offset > bundle_len {
            return Err(Error::BadBundle(format!(
                "archive offset {} exceeds file size {}",
                cached.archive_offset, bundle_len
            )));
        }
        let image_size = bundle_len - cached.archive_offset;

        let r_exe_name = id::sanitize(&cached.app_bundle_id);
        if r_exe_name.is_empty() {
            return Err(Error::BadBundle(format!(
                "identity {:?} sanitizes to nothing",
                cached.app_bundle_id
            )));
        }

        let pool_dir = env::var_os("TMPDIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".pelfbundles");

        let disable_random_workdir = cached.disable_random_work_dir
            || env::var_os("PBUNDLE_DISABLE_RANDOM_WORKDIR").is_some_and(|v| !v.is_empty());

        let override_var = format!("{}_workDir", r_exe_name);
        let work_dir = match env::var_os(&override_var).filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None if disable_random_workdir => {
                pool_dir.join(deterministic_workdir_name(&r_exe_name, &cached.hash))
            }
            None => pool_dir.join(random_workdir_name(&r_exe_name)),
        };

        let mount_dir = work_dir.join("mounted");
        let entrypoint = mount_dir.join("AppRun");
        let static_tools_dir = pool_dir.join(".static");

        Ok(Self {
            self_path,
            self_file,
            fs_type: cached.filesystem_type,
            app_bundle_id: cached.app_bundle_id,
            pelf_version: cached.pelf_version,
            host_info: cached.host_info,
            hash: cached.hash,
            disable_random_workdir,
            mount_or_extract,
            archive_offset: cached.archive_offset,
            image_size,
            r_exe_name,
            pool_dir,
            work_dir,
            mount_dir,
            entrypoint,
            static_tools_dir,
            no_cleanup: disable_random_workdir,
        })
    }
}

/// ELF parse + CBOR decode, then populate the xattr cache for next time.
/// Every failure here is fatal before any pool directory exists.
fn slow_path(self_path: &Path) -> Result<(CachedConfig, u8)> {
    let (section_end, section) = elf::introspect(self_path, elf::RUNTIME_INFO_SECTION)?;
    let bytes = section.ok_or_else(|| {
        Error::BadBundle(format!(
            "{} carries no {} section",
            self_path.display(),
            elf::RUNTIME_INFO_SECTION
        ))
    })?;
    let info = RuntimeInfo::from_cbor(&bytes)?;
    let cached = CachedConfig::from_info(&info, section_end);
    cache::write(self_path, &cached);
    Ok((cached, info.mount_or_extract))
}

fn deterministic_workdir_name(r_exe_name: &str, hash: &str) -> String {
    format!("pbundle_{}_{}", r_exe_name, hash.get(..8).unwrap_or(hash))
}

fn random_workdir_name(r_exe_name: &str) -> String {
    const HEX: [char; 16] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
    ];
    format!("pbundle_{}_{}", r_exe_name, nanoid::nanoid!(16, &HEX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_name_is_stable() {
        let hash = "ab".repeat(32);
        let a = deterministic_workdir_name("nanoutils", &hash);
        let b = deterministic_workdir_name("nanoutils", &hash);
        assert_eq!(a, b);
        assert_eq!(a, "pbundle_nanoutils_abababab");
    }

    #[test]
    fn test_random_names_differ() {
        let a = random_workdir_name("nanoutils");
        let b = random_workdir_name("nanoutils");
        assert_ne!(a, b);
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! FUSE helper provisioning
//!
//! The loader prefers helpers already present in the pool-wide tool cache or
//! on the host PATH; only when one is missing does it unpack the embedded
//! `.pbundle_static_tools` archive. Extraction skips entries that already
//! exist, which keeps concurrent loaders idempotent at file granularity.

use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use log::debug;
use pbundle_meta::{elf, FilesystemType};
use walkdir::WalkDir;

use crate::{
    config::RuntimeConfig,
    error::{Error, Result},
};

/// Helpers needed to FUSE-mount an image of the given filesystem.
pub fn mount_tools(fs_type: FilesystemType) -> &'static [&'static str] {
    match fs_type {
        FilesystemType::Squashfs => &["squashfuse", "fusermount"],
        FilesystemType::Dwarfs => &["dwarfs", "fusermount3"],
    }
}

/// The tool behind the extract strategies.
pub fn extract_tool(fs_type: FilesystemType) -> &'static str {
    match fs_type {
        FilesystemType::Squashfs => "unsquashfs",
        FilesystemType::Dwarfs => "dwarfsextract",
    }
}

/// Tool lookup: the shared tool cache first, then the host PATH.
pub fn find_tool(cfg: &RuntimeConfig, name: &str) -> Option<PathBuf> {
    let local = cfg.static_tools_dir.join(name);
    if is_executable(&local) {
        return Some(local);
    }
    which::which(name).ok()
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn resolve_all(cfg: &RuntimeConfig, names: &[&str]) -> Option<Vec<PathBuf>> {
    names.iter().map(|name| find_tool(cfg, name)).collect()
}

/// Resolve every named tool, unpacking the embedded archive once if needed.
/// A tool that is still missing afterwards is fatal.
pub fn ensure_tools(cfg: &RuntimeConfig, names: &[&str]) -> Result<Vec<PathBuf>> {
    if let Some(found) = resolve_all(cfg, names) {
        return Ok(found);
    }

    extract_static_tools(cfg)?;

    resolve_all(cfg, names).ok_or_else(|| {
        let missing: Vec<&str> = names
            .iter()
            .filter(|name| find_tool(cfg, name).is_none())
            .copied()
            .collect();
        Error::ToolMissing(missing.join(", "))
    })
}

fn extract_static_tools(cfg: &RuntimeConfig) -> Result<()> {
    let bytes = elf::read_section(&cfg.self_path, elf::STATIC_TOOLS_SECTION)?.ok_or_else(|| {
        Error::BadBundle(
            "required helpers are not installed and this bundle embeds no static tools".into(),
        )
    })?;

    debug!(
        "provisioning static tools into {}",
        cfg.static_tools_dir.display()
    );
    fs::create_dir_all(&cfg.static_tools_dir)?;
    let present = size_map(&cfg.static_tools_dir);
    unpack_into(&bytes, &cfg.static_tools_dir, &present)
}

/// Relative path -> size of everything already provisioned. Presence in this
/// map is the skip-if-exists witness.
fn size_map(root: &Path) -> HashMap<PathBuf, u64> {
    let mut map = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let (Ok(rel), Ok(meta)) = (entry.path().strip_prefix(root), entry.metadata()) {
            map.insert(rel.to_path_buf(), meta.len());
        }
    }
    map
}

fn unpack_into(bytes: &[u8], dest: &Path, present: &HashMap<PathBuf, u64>) -> Result<()> {
    let decoder = zstd::Decoder::new(bytes)?;
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let target = dest.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular => {
                if present.contains_key(&rel) {
                    debug!("skipping {} (already provisioned)", rel.display());
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mode = entry.header().mode().unwrap_or(0o755) | 0o111;
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            tar::EntryType::Symlink => {
                let Some(link) = entry.link_name()? else {
                    continue;
                };
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                match symlink(link.as_ref(), &target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            tar::EntryType::Link => {
                let Some(link) = entry.link_name()? else {
                    continue;
                };
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                match fs::hard_link(dest.join(link.as_ref()), &target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e.into()),
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn archive_with(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let encoder = zstd::Encoder::new(Vec::new(), 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        for (name, content, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(*mode);
            header.set_mtime(0);
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_unpack_writes_files_with_exec_bits() {
        let dest = TempDir::new().unwrap();
        let bytes = archive_with(&[("squashfuse", b"helper", 0o644)]);

        unpack_into(&bytes, dest.path(), &HashMap::new()).unwrap();

        let path = dest.path().join("squashfuse");
        assert_eq!(fs::read(&path).unwrap(), b"helper");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_unpack_skips_present_entries() {
        let dest = TempDir::new().unwrap();
        let existing = dest.path().join("squashfuse");
        let mut file = File::create(&existing).unwrap();
        file.write_all(b"already-here").unwrap();
        drop(file);

        let bytes = archive_with(&[("squashfuse", b"fresh", 0o755)]);
        let present = size_map(dest.path());
        unpack_into(&bytes, dest.path(), &present).unwrap();

        // The provisioned copy wins; a second extraction must not rewrite it.
        assert_eq!(fs::read(&existing).unwrap(), b"already-here");
    }

    #[test]
    fn test_unpack_restores_symlinks() {
        let dest = TempDir::new().unwrap();

        let encoder = zstd::Encoder::new(Vec::new(), 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(9);
        header.set_mode(0o755);
        header.set_mtime(0);
        builder
            .append_data(&mut header, "dwarfs", &b"universal"[..])
            .unwrap();
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "dwarfsextract", "dwarfs").unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        unpack_into(&bytes, dest.path(), &HashMap::new()).unwrap();
        unpack_into(&bytes, dest.path(), &size_map(dest.path())).unwrap(); // idempotent

        let link_path = dest.path().join("dwarfsextract");
        assert_eq!(fs::read_link(&link_path).unwrap(), PathBuf::from("dwarfs"));
        assert_eq!(fs::read(&link_path).unwrap(), b"universal");
    }

    #[test]
    fn test_tool_sets() {
        assert_eq!(
            mount_tools(FilesystemType::Squashfs),
            &["squashfuse", "fusermount"]
        );
        assert_eq!(mount_tools(FilesystemType::Dwarfs), &["dwarfs", "fusermount3"]);
        assert_eq!(extract_tool(FilesystemType::Squashfs), "unsquashfs");
    }
}

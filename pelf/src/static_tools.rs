//! Static-tools packer: collects FUSE helpers into a zstd-compressed tar
//!
//! The archive lands in the `.pbundle_static_tools` section so the loader
//! can provision helpers on hosts that lack them.

use std::{
    collections::HashSet,
    fs::{self, File},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use pbundle_meta::{hash, FilesystemType};
use tracing::warn;

use crate::{
    error::{Error, Result},
    toolset::ToolSearch,
};

const ZSTD_LEVEL: i32 = 19;

/// Helpers that must ship with a bundle of the given filesystem.
pub fn required_tools(fs_type: FilesystemType) -> &'static [&'static str] {
    match fs_type {
        FilesystemType::Squashfs => &["mksquashfs", "squashfuse", "fusermount"],
        FilesystemType::Dwarfs => &["dwarfs", "mkdwarfs", "fusermount3"],
    }
}

/// The extractor behind the extract strategies. Packed when resolvable so
/// extract-only bundles work on bare hosts, but its absence at build time is
/// only a warning.
pub fn extractor_tool(fs_type: FilesystemType) -> &'static str {
    match fs_type {
        FilesystemType::Squashfs => "unsquashfs",
        FilesystemType::Dwarfs => "dwarfsextract",
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub name: String,
    pub path: PathBuf,
}

/// Resolve every tool the bundle should carry. Missing required tools are
/// fatal; a missing extractor is not.
pub fn resolve(fs_type: FilesystemType, search: &ToolSearch) -> Result<Vec<ResolvedTool>> {
    let mut resolved = Vec::new();
    for name in required_tools(fs_type) {
        let path = search.require(name)?;
        resolved.push(ResolvedTool {
            name: name.to_string(),
            path,
        });
    }

    let extractor = extractor_tool(fs_type);
    match search.find(extractor) {
        Some(path) => resolved.push(ResolvedTool {
            name: extractor.to_string(),
            path,
        }),
        None => warn!(
            "{} not found; extract strategies will rely on the target host",
            extractor
        ),
    }
    Ok(resolved)
}

/// `<name> # <blake3>` lines for `--list-static-tools`.
pub fn listing(tools: &[ResolvedTool]) -> Result<Vec<String>> {
    tools
        .iter()
        .map(|tool| {
            let digest = hash::b3sum(&tool.path)?;
            Ok(format!("{} # {}", tool.name, digest))
        })
        .collect()
}

/// Produce the zstd-compressed tar stream.
///
/// Mode bits are preserved with the executable bits forced on. A tool that
/// is a symlink to another packed tool stays a symlink; any other symlink is
/// followed and packed as the file it resolves to.
pub fn pack(tools: &[ResolvedTool], upx: bool, search: &ToolSearch) -> Result<Vec<u8>> {
    let upx_tool = if upx {
        let found = search.find("upx");
        if found.is_none() {
            warn!("upx not found; embedding uncompressed tools");
        }
        found
    } else {
        None
    };

    let scratch = tempfile::tempdir()?;
    let names: HashSet<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();

    let encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for tool in tools {
        let meta = fs::symlink_metadata(&tool.path)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&tool.path)?;
            let base = target
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string);
            if let Some(base) = base.filter(|b| names.contains(b.as_str()) && *b != tool.name) {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, &tool.name, &base)?;
                continue;
            }
        }

        let src = match &upx_tool {
            Some(upx) => compress_with_upx(upx, &tool.path, scratch.path(), &tool.name)?,
            None => tool.path.clone(),
        };
        let file_meta = fs::metadata(&src)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file_meta.len());
        header.set_mode(file_meta.permissions().mode() | 0o111);
        header.set_mtime(0);
        builder.append_data(&mut header, &tool.name, File::open(&src)?)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn compress_with_upx(upx: &Path, src: &Path, scratch: &Path, name: &str) -> Result<PathBuf> {
    let out = scratch.join(name);
    let output = Command::new(upx)
        .arg("--best")
        .arg("-qq")
        .arg("-o")
        .arg(&out)
        .arg(src)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::ToolFailed {
            tool: "upx".to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        // Not every binary is packable (already-compressed, too small).
        warn!("upx could not compress {}; embedding as-is", name);
        return Ok(src.to_path_buf());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Read, os::unix::fs::symlink};
    use tempfile::TempDir;

    fn fake_tool(dir: &Path, name: &str, content: &[u8], mode: u32) -> ResolvedTool {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        ResolvedTool {
            name: name.to_string(),
            path,
        }
    }

    fn unpack(bytes: &[u8]) -> Vec<(String, tar::EntryType, u32, Vec<u8>)> {
        let decoder = zstd::Decoder::new(bytes).unwrap();
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let kind = entry.header().entry_type();
                let mode = entry.header().mode().unwrap();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, kind, mode, data)
            })
            .collect()
    }

    #[test]
    fn test_pack_preserves_contents_and_modes() {
        let dir = TempDir::new().unwrap();
        let tools = vec![
            fake_tool(dir.path(), "squashfuse", b"fuse-helper", 0o755),
            fake_tool(dir.path(), "fusermount", b"unmounter", 0o644),
        ];

        let bytes = pack(&tools, false, &ToolSearch::new()).unwrap();
        let entries = unpack(&bytes);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "squashfuse");
        assert_eq!(entries[0].3, b"fuse-helper");
        // Executable bits are forced on even when the source lacked them.
        assert_eq!(entries[1].2 & 0o111, 0o111);
    }

    #[test]
    fn test_pack_keeps_internal_symlinks() {
        let dir = TempDir::new().unwrap();
        let real = fake_tool(dir.path(), "dwarfs", b"universal", 0o755);
        let link_path = dir.path().join("mkdwarfs");
        symlink("dwarfs", &link_path).unwrap();

        let tools = vec![
            real,
            ResolvedTool {
                name: "mkdwarfs".to_string(),
                path: link_path,
            },
        ];
        let bytes = pack(&tools, false, &ToolSearch::new()).unwrap();
        let entries = unpack(&bytes);

        assert_eq!(entries[1].0, "mkdwarfs");
        assert_eq!(entries[1].1, tar::EntryType::Symlink);
    }

    #[test]
    fn test_listing_format() {
        let dir = TempDir::new().unwrap();
        let tools = vec![fake_tool(dir.path(), "squashfuse", b"hello world", 0o755)];
        let lines = listing(&tools).unwrap();
        assert_eq!(
            lines[0],
            "squashfuse # d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_required_tool_sets() {
        assert_eq!(
            required_tools(FilesystemType::Squashfs),
            &["mksquashfs", "squashfuse", "fusermount"]
        );
        assert_eq!(
            required_tools(FilesystemType::Dwarfs),
            &["dwarfs", "mkdwarfs", "fusermount3"]
        );
        assert_eq!(extractor_tool(FilesystemType::Dwarfs), "dwarfsextract");
    }
}

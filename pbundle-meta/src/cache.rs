//! `user.RuntimeConfig` extended-attribute cache
//!
//! After the first successful slow-path parse the loader projects the record
//! onto the bundle file itself, so subsequent runs skip ELF parsing. The
//! projection is newline-separated text, seven fields in fixed order.

use std::path::Path;

use crate::info::{FilesystemType, RuntimeInfo};

pub const XATTR_NAME: &str = "user.RuntimeConfig";

/// The cached projection: RuntimeInfo plus the archive offset the slow path
/// computed from the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedConfig {
    pub filesystem_type: FilesystemType,
    pub archive_offset: u64,
    pub app_bundle_id: String,
    pub pelf_version: String,
    pub host_info: String,
    pub hash: String,
    pub disable_random_work_dir: bool,
}

impl CachedConfig {
    pub fn from_info(info: &RuntimeInfo, archive_offset: u64) -> Self {
        Self {
            filesystem_type: info.filesystem_type,
            archive_offset,
            app_bundle_id: info.app_bundle_id.clone(),
            pelf_version: info.pelf_version.clone(),
            host_info: info.host_info.clone(),
            hash: info.hash.clone(),
            disable_random_work_dir: info.disable_random_work_dir,
        }
    }

    pub fn serialize(&self) -> String {
        [
            self.filesystem_type.as_str(),
            &self.archive_offset.to_string(),
            &self.app_bundle_id,
            &self.pelf_version,
            &self.host_info,
            &self.hash,
            if self.disable_random_work_dir { "1" } else { "" },
        ]
        .join("\n")
    }

    /// Parse the seven-field projection. Anything malformed yields `None`,
    /// which sends the caller down the slow path.
    pub fn parse(text: &str) -> Option<Self> {
        let fields: Vec<&str> = text.split('\n').collect();
        if fields.len() != 7 {
            return None;
        }
        let filesystem_type: FilesystemType = fields[0].parse().ok()?;
        let archive_offset: u64 = fields[1].parse().ok()?;
        if fields[2].is_empty() {
            return None;
        }
        Some(Self {
            filesystem_type,
            archive_offset,
            app_bundle_id: fields[2].to_string(),
            pelf_version: fields[3].to_string(),
            host_info: fields[4].to_string(),
            hash: fields[5].to_string(),
            disable_random_work_dir: fields[6] == "1",
        })
    }
}

/// Read the cache from a bundle file. `None` when absent or malformed.
pub fn read<P: AsRef<Path>>(path: P) -> Option<CachedConfig> {
    let raw = xattr::get(path.as_ref(), XATTR_NAME).ok()??;
    CachedConfig::parse(std::str::from_utf8(&raw).ok()?)
}

/// Write the cache. Best-effort: bundles on filesystems without xattr
/// support simply stay on the slow path.
pub fn write<P: AsRef<Path>>(path: P, cached: &CachedConfig) {
    let _ = xattr::set(path.as_ref(), XATTR_NAME, cached.serialize().as_bytes());
}

/// Drop a (possibly stale) cache. Best-effort, like `write`.
pub fn remove<P: AsRef<Path>>(path: P) {
    let _ = xattr::remove(path.as_ref(), XATTR_NAME);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedConfig {
        CachedConfig {
            filesystem_type: FilesystemType::Dwarfs,
            archive_offset: 123456,
            app_bundle_id: "nano#utils:8.2@20240311".into(),
            pelf_version: "0.2.0".into(),
            host_info: "Linux 6.8.0 x86_64".into(),
            hash: "ab".repeat(32),
            disable_random_work_dir: true,
        }
    }

    #[test]
    fn test_round_trip() {
        let cached = sample();
        let text = cached.serialize();
        assert_eq!(text.matches('\n').count(), 6);
        assert_eq!(CachedConfig::parse(&text), Some(cached));
    }

    #[test]
    fn test_round_trip_matches_info() {
        let info = RuntimeInfo {
            app_bundle_id: "nano#utils".into(),
            pelf_version: "0.2.0".into(),
            host_info: "Linux".into(),
            filesystem_type: FilesystemType::Squashfs,
            hash: "00".repeat(32),
            disable_random_work_dir: false,
            mount_or_extract: 2,
        };
        let cached = CachedConfig::from_info(&info, 4096);
        let back = CachedConfig::parse(&cached.serialize()).unwrap();
        assert_eq!(back.app_bundle_id, info.app_bundle_id);
        assert_eq!(back.hash, info.hash);
        assert_eq!(back.archive_offset, 4096);
        assert!(!back.disable_random_work_dir);
    }

    #[test]
    fn test_malformed_is_none() {
        assert!(CachedConfig::parse("").is_none());
        assert!(CachedConfig::parse("squashfs\n123\nid\nv\nhost\nhash").is_none());
        assert!(CachedConfig::parse("ext4\n123\nid\nv\nhost\nhash\n1").is_none());
        assert!(CachedConfig::parse("squashfs\nnotanumber\nid\nv\nhost\nhash\n").is_none());
        // Empty bundle id
        assert!(CachedConfig::parse("squashfs\n123\n\nv\nhost\nhash\n1").is_none());
    }
}

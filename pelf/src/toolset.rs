//! Ordered helper-tool lookup
//!
//! The search order is data, not process state: candidate directories are
//! consulted front to back, then the host PATH via `which`. Flipping
//! `prefer_path` puts the host PATH first instead.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ToolSearch {
    dirs: Vec<PathBuf>,
    prefer_path: bool,
}

impl ToolSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate directory. Missing directories are tolerated and
    /// simply never match.
    pub fn with_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dirs.push(dir.into());
        self
    }

    pub fn with_optional_dir<P: Into<PathBuf>>(self, dir: Option<P>) -> Self {
        match dir {
            Some(dir) => self.with_dir(dir),
            None => self,
        }
    }

    /// Consult the host PATH before the candidate directories.
    pub fn prefer_path(mut self, yes: bool) -> Self {
        self.prefer_path = yes;
        self
    }

    pub fn find(&self, tool: &str) -> Option<PathBuf> {
        if self.prefer_path {
            if let Ok(found) = which::which(tool) {
                return Some(found);
            }
        }
        for dir in &self.dirs {
            let candidate = dir.join(tool);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
        if !self.prefer_path {
            if let Ok(found) = which::which(tool) {
                return Some(found);
            }
        }
        None
    }

    pub fn require(&self, tool: &str) -> Result<PathBuf> {
        self.find(tool).ok_or_else(|| Error::ToolNotFound(tool.to_string()))
    }

    /// First hit among several interchangeable tool names.
    pub fn find_any(&self, tools: &[&str]) -> Option<PathBuf> {
        tools.iter().find_map(|tool| self.find(tool))
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_dir_order_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let a = fake_tool(first.path(), "mktool");
        fake_tool(second.path(), "mktool");

        let search = ToolSearch::new().with_dir(first.path()).with_dir(second.path());
        assert_eq!(search.find("mktool"), Some(a));
    }

    #[test]
    fn test_non_executable_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plainfile");
        fs::write(&path, "data").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let search = ToolSearch::new().with_dir(dir.path());
        assert_eq!(search.find("plainfile"), None);
    }

    #[test]
    fn test_require_reports_the_name() {
        let search = ToolSearch::new();
        let err = search.require("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }
}

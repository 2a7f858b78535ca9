//! Hosts file block region
//!
//! The region is delimited by sentinel comments and is always rewritten as a
//! whole: the old region is stripped, the new one appended.

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::constants::{BLOCK_END_MARKER, BLOCK_START_MARKER};

/// Handle on the hosts file the daemon enforces
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    region: Regex,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let pattern = format!(
            r"(?s)\n?{}\n.*{}\n?",
            regex::escape(BLOCK_START_MARKER),
            regex::escape(BLOCK_END_MARKER)
        );
        let region = Regex::new(&pattern).context("Failed to compile block region pattern")?;
        Ok(Self {
            path: path.into(),
            region,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 of the current file content
    pub fn digest(&self) -> Result<String> {
        let content = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read hosts file: {}", self.path.display()))?;
        Ok(hex::encode(Sha256::digest(&content)))
    }

    /// Remove the block region, leaving every other line as it was
    pub fn clear(&self) -> Result<()> {
        let content = self.read()?;
        let stripped = self.strip_region(&content);
        if stripped != content {
            self.write(&stripped)?;
        }
        Ok(())
    }

    /// Rewrite the block region for `sites`; returns the digest of the result
    pub fn block(&self, sites: &BTreeSet<String>) -> Result<String> {
        let mut content = self.strip_region(&self.read()?);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&render_region(sites));
        self.write(&content)?;
        Ok(hex::encode(Sha256::digest(content.as_bytes())))
    }

    #[cfg(test)]
    fn is_blocked(&self) -> Result<bool> {
        Ok(self.region.is_match(&self.read()?))
    }

    fn strip_region(&self, content: &str) -> String {
        let stripped = self.region.replace_all(content, "\n").into_owned();
        // A region at the very top leaves a newline the file never had
        if !content.starts_with('\n') {
            if let Some(rest) = stripped.strip_prefix('\n') {
                return rest.to_string();
            }
        }
        stripped
    }

    fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read hosts file: {}", self.path.display()))
    }

    fn write(&self, content: &str) -> Result<()> {
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write hosts file: {}", self.path.display()))
    }
}

/// Block region text for `sites`, including both sentinels and a trailing newline
pub fn render_region(sites: &BTreeSet<String>) -> String {
    let mut region = String::new();
    region.push_str(BLOCK_START_MARKER);
    region.push('\n');
    for site in sites {
        region.push_str(&format!("127.0.0.1 {}\n", site));
        region.push_str(&format!("127.0.0.1 www.{}\n", site));
        region.push_str(&format!("127.0.0.1 *.{}\n", site));
    }
    region.push_str(BLOCK_END_MARKER);
    region.push('\n');
    region
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

    fn sites(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_region() {
        let region = render_region(&sites(&["news.example"]));
        assert_eq!(
            region,
            "#carrotblock\n\
             127.0.0.1 news.example\n\
             127.0.0.1 www.news.example\n\
             127.0.0.1 *.news.example\n\
             #/carrotblock\n"
        );
    }

    #[test]
    fn test_block_then_clear_restores_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, BASE).unwrap();
        let hosts = HostsFile::new(&path).unwrap();

        let digest = hosts.block(&sites(&["a.example", "b.example"])).unwrap();
        assert_eq!(digest, hosts.digest().unwrap());
        let blocked = std::fs::read_to_string(&path).unwrap();
        assert!(blocked.starts_with(BASE));
        assert!(blocked.contains("127.0.0.1 *.b.example\n"));
        assert!(hosts.is_blocked().unwrap());

        hosts.clear().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BASE);
        assert!(!hosts.is_blocked().unwrap());
    }

    #[test]
    fn test_rewrite_replaces_region_as_a_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, BASE).unwrap();
        let hosts = HostsFile::new(&path).unwrap();

        let first = hosts.block(&sites(&["a.example"])).unwrap();
        let second = hosts.block(&sites(&["a.example"])).unwrap();
        assert_eq!(first, second, "rewriting the same sites is byte-identical");

        hosts.block(&sites(&["a.example", "c.example"])).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(BLOCK_START_MARKER).count(), 1);
        assert!(content.contains("127.0.0.1 c.example"));
    }

    #[test]
    fn test_tampered_region_is_stripped_entirely() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            format!("{}#carrotblock\n# 127.0.0.1 a.example\n#/carrotblock\n10.0.0.1 nas\n", BASE),
        )
        .unwrap();
        let hosts = HostsFile::new(&path).unwrap();

        hosts.clear().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}10.0.0.1 nas\n", BASE)
        );
    }

    #[test]
    fn test_block_appends_newline_to_unterminated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost").unwrap();
        let hosts = HostsFile::new(&path).unwrap();

        hosts.block(&sites(&["a.example"])).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n#carrotblock\n"));
    }
}

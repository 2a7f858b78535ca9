//! macOS LaunchD integration for daemon service management
//!
//! Handles plist generation for a run identity and hands registrations to
//! `launchctl`

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::constants::DAEMON_RUN_SUBCOMMAND;
use crate::daemon::preservation::{Identity, Layout};

/// LaunchD plist configuration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchDPlist {
    /// Service label (reverse DNS format)
    pub label: String,
    /// Executable path and arguments
    pub program_arguments: Vec<String>,
    /// Whether to start as soon as the job is loaded
    pub run_at_load: bool,
    /// Whether to restart if the process exits
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard_out_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard_error_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,
}

impl LaunchDPlist {
    /// Descriptor launching the protected executable copy of `identity`
    pub fn for_identity(layout: &Layout, identity: &Identity) -> Self {
        let mut environment_variables = BTreeMap::new();
        environment_variables.insert("PATH".to_string(), "/usr/bin:/bin:/usr/sbin:/sbin".to_string());

        Self {
            label: identity.label(),
            program_arguments: vec![
                layout.executable(identity).to_string_lossy().to_string(),
                DAEMON_RUN_SUBCOMMAND.to_string(),
                identity.as_str().to_string(),
            ],
            run_at_load: true,
            keep_alive: true,
            working_directory: Some(layout.working_dir().to_path_buf()),
            standard_out_path: Some(layout.log_file()),
            standard_error_path: Some(layout.log_file()),
            environment_variables,
        }
    }

    /// Generate plist XML content
    pub fn generate_plist(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        plist::to_writer_xml(&mut buffer, self).context("Failed to serialize LaunchD plist")?;
        Ok(buffer)
    }

    /// Write the plist, replacing any previous registration for the label
    pub fn write_to(&self, plist_path: &Path) -> Result<()> {
        let content = self.generate_plist()?;
        if let Some(parent) = plist_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create plist directory: {}", parent.display()))?;
        }
        std::fs::write(plist_path, content)
            .with_context(|| format!("Failed to write plist file: {}", plist_path.display()))
    }
}

/// The OS process-supervision mechanism: keeps registered jobs alive
pub trait Supervisor {
    /// Load a registration so the job starts and is kept alive
    fn load(&self, plist_path: &Path) -> Result<()>;
    /// Drop a job by label
    fn remove(&self, label: &str) -> Result<()>;
}

/// `launchctl` backed supervisor
#[derive(Debug, Clone, Copy, Default)]
pub struct Launchctl;

impl Supervisor for Launchctl {
    fn load(&self, plist_path: &Path) -> Result<()> {
        let output = Command::new("launchctl")
            .arg("load")
            .arg(plist_path)
            .output()
            .context("Failed to execute launchctl load")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("launchctl load failed: {}", stderr);
        }

        Ok(())
    }

    fn remove(&self, label: &str) -> Result<()> {
        let output = Command::new("launchctl")
            .args(["remove", label])
            .output()
            .context("Failed to execute launchctl remove")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("launchctl remove failed: {}", stderr);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plist_points_at_identity_copy() {
        let layout = Layout::rooted(Path::new("/sandbox"));
        let identity = Identity::from("0b6f6c5e-run");
        let plist = LaunchDPlist::for_identity(&layout, &identity);

        assert_eq!(plist.label, "com.digitalcarrot.0b6f6c5e-run");
        assert_eq!(
            plist.program_arguments,
            vec![
                "/sandbox/state/bin/0b6f6c5e-run".to_string(),
                "run".to_string(),
                "0b6f6c5e-run".to_string(),
            ]
        );
        assert!(plist.keep_alive);
        assert_eq!(plist.standard_out_path, Some(PathBuf::from("/sandbox/state/daemon.log")));
    }

    #[test]
    fn test_generated_xml_declares_supervision() {
        let layout = Layout::rooted(Path::new("/sandbox"));
        let plist = LaunchDPlist::for_identity(&layout, &Identity::from("abc"));
        let xml = String::from_utf8(plist.generate_plist().unwrap()).unwrap();

        assert!(xml.contains("<key>Label</key>"));
        assert!(xml.contains("<string>com.digitalcarrot.abc</string>"));
        assert!(xml.contains("<key>ProgramArguments</key>"));
        assert!(xml.contains("<key>KeepAlive</key>"));
        assert!(xml.contains("<key>RunAtLoad</key>"));
        assert!(xml.contains("<true/>"));
        assert!(xml.contains("<key>StandardErrorPath</key>"));
        assert!(xml.contains("<string>/sandbox/state/daemon.log</string>"));
    }
}

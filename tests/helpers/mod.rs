#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use digital_carrot::daemon::config::{hash_password, Config};
use digital_carrot::daemon::launchd::Supervisor;
use digital_carrot::daemon::preservation::{Identity, Layout, MissingScript, Preserver};
use digital_carrot::enforcement::{Engine, HostsFile};

pub const BASE_HOSTS: &str = "127.0.0.1 localhost\n::1 localhost\n";
pub const PASSWORD: &str = "correct horse";

/// Supervisor fake recording every call
#[derive(Default, Clone)]
pub struct RecordingSupervisor {
    pub loaded: Arc<Mutex<Vec<PathBuf>>>,
    pub removed: Arc<Mutex<Vec<String>>>,
}

impl Supervisor for RecordingSupervisor {
    fn load(&self, plist_path: &Path) -> anyhow::Result<()> {
        self.loaded.lock().unwrap().push(plist_path.to_path_buf());
        Ok(())
    }

    fn remove(&self, label: &str) -> anyhow::Result<()> {
        self.removed.lock().unwrap().push(label.to_string());
        Ok(())
    }
}

/// Monday 2026-10-19 at `hour`:00
pub fn monday_at(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 19)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .unwrap()
}

/// Temporary root holding a rooted layout, a hosts file and user scripts
pub struct Sandbox {
    pub dir: TempDir,
    pub layout: Layout,
    pub supervisor: RecordingSupervisor,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::rooted(dir.path());
        std::fs::write(layout.hosts_file(), BASE_HOSTS).unwrap();
        Self {
            dir,
            layout,
            supervisor: RecordingSupervisor::default(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an executable /bin/sh script next to the layout
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Validator that passes once `marker` exists
    pub fn gated_script(&self, name: &str, marker: &Path) -> PathBuf {
        self.script(
            name,
            &format!(
                "if [ -f '{}' ]; then echo done; exit 0; else echo 'not yet'; exit 2; fi",
                marker.display()
            ),
        )
    }

    pub fn hosts(&self) -> String {
        std::fs::read_to_string(self.layout.hosts_file()).unwrap()
    }

    pub fn base_config(&self) -> Config {
        let mut config = Config::default();
        config.blocked_websites.insert("news.example".to_string());
        config.hashed_password = Some(hash_password(PASSWORD));
        config
    }

    /// Engine as the daemon builds it at startup, with a fixed clock
    pub fn engine(&self, mut config: Config, now: NaiveDateTime) -> Engine {
        let mut preserver = Preserver::new(
            self.layout.clone(),
            Identity::from("current"),
            b"#!/bin/sh\nexit 0\n".to_vec(),
            Box::new(self.supervisor.clone()),
        );
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        let hosts = HostsFile::new(self.layout.hosts_file()).unwrap();
        Engine::new(config, preserver, hosts).with_clock(Box::new(move || now))
    }
}

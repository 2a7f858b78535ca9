//! Self-preservation of the daemon's protected state
//!
//! The executable image, every validator script and the config are held in
//! memory. Disk copies are regenerated from memory on every persistence
//! cycle, so editing or deleting them only lasts until the next tick, and a
//! termination signal redeploys the whole set under a fresh identity.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::conditions::{load_script_preferring, ScriptLoad};
use crate::constants::{
    BIN_DIR_NAME, CONFIG_FILE_NAME, HOSTS_FILE, IN_PIPE_NAME, KILLSWITCH_NAME,
    LAUNCHD_LABEL_PREFIX, LAUNCH_DAEMONS_DIR, LOCK_FILE_NAME, LOG_FILE_NAME, OUT_PIPE_NAME,
    PAUSE_SCRIPT_KEY, SCRIPTS_DIR_NAME, WORKING_DIR,
};
use crate::daemon::config::Config;
use crate::daemon::launchd::{LaunchDPlist, Supervisor};

/// Mode applied to every protected executable artifact
const PROTECTED_EXEC_MODE: u32 = 0o700;

/// The daemon's current run name; every per-instance path derives from it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Fresh random identity for a respawn
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// LaunchD job label for this identity
    pub fn label(&self) -> String {
        format!("{}.{}", LAUNCHD_LABEL_PREFIX, self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed filesystem locations used by the daemon and the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    working_dir: PathBuf,
    launch_daemons_dir: PathBuf,
    hosts_file: PathBuf,
}

impl Layout {
    /// Locations used on a real installation
    pub fn system() -> Self {
        Self {
            working_dir: PathBuf::from(WORKING_DIR),
            launch_daemons_dir: PathBuf::from(LAUNCH_DAEMONS_DIR),
            hosts_file: PathBuf::from(HOSTS_FILE),
        }
    }

    /// Same structure rooted in an arbitrary directory
    pub fn rooted(root: &Path) -> Self {
        Self {
            working_dir: root.join("state"),
            launch_daemons_dir: root.join("LaunchDaemons"),
            hosts_file: root.join("hosts"),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn hosts_file(&self) -> &Path {
        &self.hosts_file
    }

    pub fn config_file(&self) -> PathBuf {
        self.working_dir.join(CONFIG_FILE_NAME)
    }

    pub fn in_pipe(&self) -> PathBuf {
        self.working_dir.join(IN_PIPE_NAME)
    }

    pub fn out_pipe(&self) -> PathBuf {
        self.working_dir.join(OUT_PIPE_NAME)
    }

    pub fn killswitch(&self) -> PathBuf {
        self.working_dir.join(KILLSWITCH_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.working_dir.join(LOCK_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.working_dir.join(LOG_FILE_NAME)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.working_dir.join(SCRIPTS_DIR_NAME)
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir().join(name)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.working_dir.join(BIN_DIR_NAME)
    }

    pub fn executable(&self, identity: &Identity) -> PathBuf {
        self.bin_dir().join(identity.as_str())
    }

    pub fn plist(&self, identity: &Identity) -> PathBuf {
        self.launch_daemons_dir.join(format!("{}.plist", identity.label()))
    }
}

/// How a condition whose script cannot be found is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingScript {
    /// Refuse to run with unknown protection state
    Fatal,
    /// Drop the condition from the config
    Drop,
}

/// What a termination signal led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A fresh instance was registered under this identity
    Respawned(Identity),
    /// The killswitch authorized a genuine exit
    Released,
}

/// Owner of the in-memory artifact set
pub struct Preserver {
    layout: Layout,
    identity: Identity,
    image: Vec<u8>,
    scripts: BTreeMap<String, String>,
    supervisor: Box<dyn Supervisor>,
}

impl Preserver {
    pub fn new(
        layout: Layout,
        identity: Identity,
        image: Vec<u8>,
        supervisor: Box<dyn Supervisor>,
    ) -> Self {
        Self {
            layout,
            identity,
            image,
            scripts: BTreeMap::new(),
            supervisor,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn supervisor(&self) -> &dyn Supervisor {
        self.supervisor.as_ref()
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    /// Read every script the config references but memory lacks.
    ///
    /// Scripts already in memory are never re-read, so whatever is on disk
    /// cannot replace them. With [`MissingScript::Drop`] a script that is
    /// missing or unreadable drops its condition, and the dropped names are
    /// returned; with [`MissingScript::Fatal`] either is an error.
    pub fn load_scripts(&mut self, config: &mut Config, on_missing: MissingScript) -> Result<Vec<String>> {
        let mut dropped = Vec::new();

        for (name, spec) in &config.conditions {
            if self.scripts.contains_key(name) {
                continue;
            }
            match load_or_drop(spec.internal_script.as_deref(), &spec.script, on_missing)? {
                ScriptLoad::Found(content) => {
                    self.scripts.insert(name.clone(), content);
                }
                ScriptLoad::Missing => match on_missing {
                    MissingScript::Fatal => bail!(
                        "Script for condition '{}' not found: {}",
                        name,
                        spec.script.display()
                    ),
                    MissingScript::Drop => dropped.push(name.clone()),
                },
            }
        }

        for name in &dropped {
            config.conditions.remove(name);
        }

        if let Some(pause) = &config.pause_condition {
            if !self.scripts.contains_key(PAUSE_SCRIPT_KEY) {
                match load_or_drop(pause.internal_script.as_deref(), &pause.script, on_missing)? {
                    ScriptLoad::Found(content) => {
                        self.scripts.insert(PAUSE_SCRIPT_KEY.to_string(), content);
                    }
                    ScriptLoad::Missing => match on_missing {
                        MissingScript::Fatal => bail!(
                            "Pause condition script not found: {}",
                            pause.script.display()
                        ),
                        MissingScript::Drop => {
                            log::warn!("Pause condition script missing: {}", pause.script.display())
                        }
                    },
                }
            }
        }

        Ok(dropped)
    }

    /// Remove a script from memory and its protected copy from disk
    pub fn forget_script(&mut self, name: &str) -> Result<()> {
        self.scripts.remove(name);
        remove_if_present(&self.layout.script(name))
    }

    /// Persist the full artifact set under the current identity
    pub fn dump_to_disk(&self, config: &mut Config) -> Result<()> {
        self.dump_as(config, &self.identity)
    }

    /// Persist scripts, config, executable image and supervisor registration
    /// for `identity`. Idempotent.
    pub fn dump_as(&self, config: &mut Config, identity: &Identity) -> Result<()> {
        let scripts_dir = self.layout.scripts_dir();
        std::fs::create_dir_all(&scripts_dir)
            .with_context(|| format!("Failed to create scripts directory: {}", scripts_dir.display()))?;

        for (name, content) in &self.scripts {
            let path = self.layout.script(name);
            write_protected(&path, content.as_bytes())?;

            if name == PAUSE_SCRIPT_KEY {
                if let Some(pause) = config.pause_condition.as_mut() {
                    pause.internal_script = Some(path);
                }
            } else if let Some(spec) = config.conditions.get_mut(name) {
                spec.internal_script = Some(path);
            }
        }

        config.save_to_file(&self.layout.config_file())?;

        let executable = self.layout.executable(identity);
        let unchanged = std::fs::read(&executable).is_ok_and(|existing| existing == self.image);
        if !unchanged {
            write_protected(&executable, &self.image)?;
        }

        LaunchDPlist::for_identity(&self.layout, identity).write_to(&self.layout.plist(identity))
    }

    /// Redeploy under a new identity and hand it to the supervisor
    pub fn propagate(&self, config: &mut Config) -> Result<Identity> {
        log::info!("Copying self to secure location...");
        let successor = Identity::generate();
        self.dump_as(config, &successor)?;
        self.supervisor.load(&self.layout.plist(&successor))?;
        Ok(successor)
    }

    /// Erase this identity's registration and executable copy
    pub fn delete_self(&self) -> Result<()> {
        remove_if_present(&self.layout.plist(&self.identity))?;
        remove_if_present(&self.layout.executable(&self.identity))
    }

    /// Remove the persisted config and every protected script
    pub fn purge_persisted_state(&self) -> Result<()> {
        remove_if_present(&self.layout.config_file())?;
        match std::fs::remove_dir_all(self.layout.scripts_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove protected scripts"),
        }
    }

    pub fn killswitch_present(&self) -> bool {
        self.layout.killswitch().exists()
    }

    pub fn write_killswitch(&self) -> Result<()> {
        let path = self.layout.killswitch();
        std::fs::write(&path, b"")
            .with_context(|| format!("Failed to write killswitch: {}", path.display()))
    }

    /// Respawn-or-release decision taken when a termination signal arrives
    pub fn on_termination(&self, config: &mut Config) -> Result<Termination> {
        let outcome = if self.killswitch_present() {
            Termination::Released
        } else {
            Termination::Respawned(self.propagate(config)?)
        };

        log::info!("killed {}", self.identity);
        self.delete_self()?;
        Ok(outcome)
    }
}

/// Read errors only propagate when a missing script would be fatal anyway
fn load_or_drop(internal: Option<&Path>, original: &Path, on_missing: MissingScript) -> Result<ScriptLoad> {
    match load_script_preferring(internal, original) {
        Ok(loaded) => Ok(loaded),
        Err(e) if on_missing == MissingScript::Drop => {
            log::warn!("{:#}", e);
            Ok(ScriptLoad::Missing)
        }
        Err(e) => Err(e),
    }
}

/// Replace `path` with `content` via rename so a running copy keeps its inode
fn write_protected(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let staging = path.with_file_name(format!(".{}.staging", file_name));

    std::fs::write(&staging, content)
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(PROTECTED_EXEC_MODE))
        .with_context(|| format!("Failed to mark executable: {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("Failed to install {}", path.display()))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConditionSpec, PauseCondition, Weekday};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default, Clone)]
    struct RecordingSupervisor {
        loaded: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Supervisor for RecordingSupervisor {
        fn load(&self, plist_path: &Path) -> Result<()> {
            self.loaded.lock().unwrap().push(plist_path.to_path_buf());
            Ok(())
        }

        fn remove(&self, _label: &str) -> Result<()> {
            Ok(())
        }
    }

    fn setup(root: &Path) -> (Preserver, RecordingSupervisor, Config) {
        let supervisor = RecordingSupervisor::default();
        let preserver = Preserver::new(
            Layout::rooted(root),
            Identity::from("current"),
            b"#!/bin/sh\necho image\n".to_vec(),
            Box::new(supervisor.clone()),
        );

        let script = root.join("study.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        let mut config = Config::default();
        config
            .conditions
            .insert("study".to_string(), ConditionSpec::new(&script, Weekday::ALL.to_vec()));
        (preserver, supervisor, config)
    }

    #[test]
    fn test_dump_materializes_everything() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();

        preserver.dump_to_disk(&mut config).unwrap();

        let layout = preserver.layout().clone();
        let internal = layout.script("study");
        assert_eq!(config.conditions["study"].internal_script.as_ref(), Some(&internal));
        let mode = std::fs::metadata(&internal).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(layout.config_file().exists());
        assert_eq!(
            std::fs::read(layout.executable(preserver.identity())).unwrap(),
            b"#!/bin/sh\necho image\n"
        );
        assert!(layout.plist(preserver.identity()).exists());
    }

    #[test]
    fn test_memory_overrides_tampered_disk_copy() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();

        let internal = preserver.layout().script("study");
        std::fs::write(&internal, "#!/bin/sh\necho cheated\nexit 0\n").unwrap();
        std::fs::write(dir.path().join("study.sh"), "#!/bin/sh\necho cheated\n").unwrap();

        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();

        assert_eq!(std::fs::read_to_string(&internal).unwrap(), "#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn test_missing_script_fatal_or_dropped() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        config.conditions.insert(
            "ghost".to_string(),
            ConditionSpec::new(dir.path().join("ghost.sh"), Weekday::ALL.to_vec()),
        );

        let err = preserver.load_scripts(&mut config.clone(), MissingScript::Fatal).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let dropped = preserver.load_scripts(&mut config, MissingScript::Drop).unwrap();
        assert_eq!(dropped, vec!["ghost".to_string()]);
        assert!(!config.conditions.contains_key("ghost"));
        assert!(preserver.has_script("study"));
    }

    #[test]
    fn test_unreadable_script_is_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        let not_a_script = dir.path().join("scripts-dir");
        std::fs::create_dir(&not_a_script).unwrap();
        config
            .conditions
            .insert("evil".to_string(), ConditionSpec::new(&not_a_script, Weekday::ALL.to_vec()));

        assert!(preserver.load_scripts(&mut config.clone(), MissingScript::Fatal).is_err());

        let dropped = preserver.load_scripts(&mut config, MissingScript::Drop).unwrap();
        assert_eq!(dropped, vec!["evil".to_string()]);
        assert!(!config.conditions.contains_key("evil"));
        assert!(!preserver.has_script("evil"));
    }

    #[test]
    fn test_pause_script_is_stored_under_reserved_key() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        config.pause_condition = Some(PauseCondition {
            script: dir.path().join("study.sh"),
            args: vec![],
            max_pause_days: Some(2),
            internal_script: None,
        });

        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();

        assert!(preserver.has_script(PAUSE_SCRIPT_KEY));
        assert_eq!(
            config.pause_condition.unwrap().internal_script,
            Some(preserver.layout().script(PAUSE_SCRIPT_KEY))
        );
    }

    #[test]
    fn test_termination_without_killswitch_respawns() {
        let dir = tempdir().unwrap();
        let (mut preserver, supervisor, mut config) = setup(dir.path());
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();

        let outcome = preserver.on_termination(&mut config).unwrap();

        let layout = preserver.layout();
        let Termination::Respawned(successor) = outcome else {
            panic!("expected a respawn");
        };
        assert_ne!(&successor, preserver.identity());
        assert_eq!(*supervisor.loaded.lock().unwrap(), vec![layout.plist(&successor)]);
        assert!(layout.executable(&successor).exists());
        assert!(!layout.plist(preserver.identity()).exists());
        assert!(!layout.executable(preserver.identity()).exists());
    }

    #[test]
    fn test_termination_with_killswitch_releases() {
        let dir = tempdir().unwrap();
        let (mut preserver, supervisor, mut config) = setup(dir.path());
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();
        preserver.write_killswitch().unwrap();

        assert_eq!(preserver.on_termination(&mut config).unwrap(), Termination::Released);
        assert!(supervisor.loaded.lock().unwrap().is_empty());
        assert!(!preserver.layout().plist(preserver.identity()).exists());
    }

    #[test]
    fn test_forget_script_removes_disk_copy() {
        let dir = tempdir().unwrap();
        let (mut preserver, _, mut config) = setup(dir.path());
        preserver.load_scripts(&mut config, MissingScript::Fatal).unwrap();
        preserver.dump_to_disk(&mut config).unwrap();

        preserver.forget_script("study").unwrap();
        assert!(!preserver.has_script("study"));
        assert!(!preserver.layout().script("study").exists());
        preserver.forget_script("study").unwrap();
    }
}

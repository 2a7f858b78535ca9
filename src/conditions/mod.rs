//! Condition script runner
//!
//! Executes validator programs and loads their content into memory. The
//! runner reports what happened; deciding what an exit code means is up to
//! the enforcement engine.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

/// Captured result of one validator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRun {
    /// Exit code, `None` when the process was terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptRun {
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// Outcome of reading a script from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLoad {
    Found(String),
    Missing,
}

/// Run `script` with `args` once, blocking until it exits
pub fn run_script(script: &Path, args: &[String]) -> Result<ScriptRun> {
    let output = Command::new(script)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute validator: {}", script.display()))?;

    Ok(ScriptRun {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Read a script into memory. A missing file is an outcome, not an error;
/// any other I/O failure is.
pub fn load_script(path: &Path) -> Result<ScriptLoad> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(ScriptLoad::Found(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(ScriptLoad::Missing),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read script: {}", path.display()))
        }
    }
}

/// Load from the protected copy when it exists, otherwise from the
/// operator-supplied path
pub fn load_script_preferring(internal: Option<&Path>, original: &Path) -> Result<ScriptLoad> {
    if let Some(internal) = internal {
        if let ScriptLoad::Found(content) = load_script(internal)? {
            return Ok(ScriptLoad::Found(content));
        }
    }
    load_script(original)
}

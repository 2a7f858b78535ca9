//! Daemon module: the supervised enforcement process
//!
//! This module provides:
//! - Persisted config I/O and validation
//! - The self-preservation manager and LaunchD registration
//! - The two-pipe command channel
//! - The single-instance lock and structured logging
//! - The run loop tying them together

pub mod config;
pub mod ipc;
pub mod launchd;
pub mod lock;
pub mod logging;
pub mod preservation;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

use crate::constants::{
    APP_SUBSYSTEM, ENFORCE_EVERY_TICKS, LOCK_ATTEMPTS, LOCK_RETRY_DELAY, TICK_INTERVAL,
};
use crate::daemon::config::Config;
use crate::daemon::ipc::{dispatch, Command, CommandChannel};
use crate::daemon::launchd::{Launchctl, Supervisor};
use crate::daemon::lock::InstanceLock;
use crate::daemon::logging::{DaemonLogger, LogLevel};
use crate::daemon::preservation::{Identity, Layout, MissingScript, Preserver};
use crate::enforcement::{Engine, HostsFile, StopReason};

/// How long a starting instance waits for the single-instance lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: LOCK_ATTEMPTS,
            delay: LOCK_RETRY_DELAY,
        }
    }
}

/// Entry point of the supervised process (`digital-carrot run <identity>`)
pub fn run_daemon(identity: Identity) -> Result<()> {
    let logger = DaemonLogger::new(APP_SUBSYSTEM, LogLevel::Info)?;
    run_with(
        Layout::system(),
        identity,
        Box::new(Launchctl),
        LockRetry::default(),
        &logger,
    )
}

/// Run the daemon against an explicit layout and supervisor.
///
/// An instance that cannot take the lock removes its own registration and
/// returns `Ok` without touching shared state. A fault removes it too, and
/// the error is returned.
pub fn run_with(
    layout: Layout,
    identity: Identity,
    supervisor: Box<dyn Supervisor>,
    lock_retry: LockRetry,
    logger: &DaemonLogger,
) -> Result<()> {
    let image = read_own_image()?;
    let mut preserver = Preserver::new(layout.clone(), identity.clone(), image, supervisor);

    let (config, hosts) = match load_startup_state(&layout, &mut preserver) {
        Ok(state) => state,
        Err(e) => return Err(abandon(&preserver, logger, e)),
    };
    let mut engine = Engine::new(config, preserver, hosts);

    let _lock = match InstanceLock::acquire(&layout.lock_file(), lock_retry.attempts, lock_retry.delay) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            logger.log_error("Another instance is running; removing this one", Some("startup"));
            engine.preserver().delete_self()?;
            return Ok(());
        }
        Err(e) => return Err(abandon(engine.preserver(), logger, e)),
    };

    logger.log_startup(&identity, std::process::id());

    let result = CommandChannel::open(&layout).and_then(|mut channel| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build runtime")?
            .block_on(run_loop(&mut engine, &mut channel, logger))
    });
    if let Err(e) = result {
        return Err(abandon(engine.preserver(), logger, e));
    }

    if let Some(reason) = engine.stop_reason() {
        if *reason == StopReason::Disabled {
            let label = identity.label();
            if let Err(e) = engine.preserver().supervisor().remove(&label) {
                log::warn!("Failed to remove job {}: {:#}", label, e);
            }
        }
        logger.log_shutdown(&identity, reason);
    }

    Ok(())
}

/// Persisted config and scripts, loaded before the loop starts
fn load_startup_state(layout: &Layout, preserver: &mut Preserver) -> Result<(Config, HostsFile)> {
    let mut config = Config::load_from_file(&layout.config_file())?;
    // Force a full rewrite of the block region on the first tick
    config.hosts_sha = None;
    preserver.load_scripts(&mut config, MissingScript::Fatal)?;
    let hosts = HostsFile::new(layout.hosts_file())?;
    Ok((config, hosts))
}

fn read_own_image() -> Result<Vec<u8>> {
    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    std::fs::read(&exe).with_context(|| format!("Failed to read executable image: {}", exe.display()))
}

/// Remove this identity's artifacts before a fault ends the process
fn abandon(preserver: &Preserver, logger: &DaemonLogger, error: anyhow::Error) -> anyhow::Error {
    logger.log_error(&format!("{:#}", error), Some("run loop"));
    if let Err(e) = preserver.delete_self() {
        logger.log_error(&format!("{:#}", e), Some("delete_self"));
    }
    error
}

async fn run_loop(engine: &mut Engine, channel: &mut CommandChannel, logger: &DaemonLogger) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                engine.on_termination()?;
                return Ok(());
            }
            _ = sigint.recv() => {
                engine.on_termination()?;
                return Ok(());
            }
            _ = ticker.tick() => {
                tick += 1;
                log::debug!("heartbeat {}", tick);
                if tick % ENFORCE_EVERY_TICKS != 0 {
                    continue;
                }

                engine.enforce()?;
                handle_pending_commands(engine, channel, logger)?;
                if engine.stop_reason().is_some() {
                    return Ok(());
                }
            }
        }
    }
}

/// Answer every command line waiting in the input pipe; returns how many
/// were handled. Stops early once a command ends the loop.
pub fn handle_pending_commands(
    engine: &mut Engine,
    channel: &mut CommandChannel,
    logger: &DaemonLogger,
) -> Result<usize> {
    let lines = channel.poll()?;
    let mut handled = 0;

    for line in lines {
        logger.log_command(&line);
        let reply = match line.parse::<Command>() {
            Ok(command) => dispatch(engine, command)?,
            Err(e) => e.to_string(),
        };
        channel.send(&reply);
        handled += 1;

        if engine.stop_reason().is_some() {
            break;
        }
    }

    Ok(handled)
}

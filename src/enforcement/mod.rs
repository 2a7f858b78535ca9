//! Hosts-file enforcement: the block/unblock/pause state machine and the
//! block region it maintains

pub mod engine;
pub mod hosts;

pub use engine::{Clock, EnforceOutcome, Engine, StopReason, UnblockReport};
pub use hosts::HostsFile;

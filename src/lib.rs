//! digital-carrot - hosts-file website blocker with earned unblocks
//!
//! This library exposes the enforcement engine, the self-preserving daemon
//! and the admin client used by the `digital-carrot` binary.

pub mod cli;
pub mod client;
pub mod conditions;
pub mod constants;
pub mod daemon;
pub mod enforcement;
pub mod models;

//! Testing utilities for lineshell
//!
//! Provides an SSH client for driving a running server from tests and the
//! `sshtest` tool.

mod ssh_client;

pub use ssh_client::{strip_ansi, ChannelEvent, LineClient};

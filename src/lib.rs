//! lineshell - minimal SSH server with line-oriented sessions
//!
//! Accepts SSH connections, admits interactive `session` channels and hands
//! each granted shell to application code as a [`LineSession`] with plain
//! `write`/`write_line`/`read_line` calls. The demo echo server is in
//! `main.rs`, a scripted test client in `bin/sshtest.rs`.

pub mod config;
pub mod identity;
pub mod paths;
pub mod ssh;
pub mod testing;

pub use config::Config;
pub use identity::{ensure_identity, IdentityError, KeyAlgorithm, ServerIdentity};
pub use ssh::{AuthPolicy, LineServer, LineSession, ReadLineError, ServerConfig, ServerError};

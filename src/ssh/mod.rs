//! SSH server module
//!
//! Accepts SSH connections and hands every granted shell to application code
//! as a [`LineSession`].

mod auth;
mod handler;
mod mux;
mod server;
mod session;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::identity::ServerIdentity;

pub use auth::{AuthPolicy, Authenticator, Credential};
pub use handler::ConnectionHandler;
pub use mux::{
    admit, multiplex, Admission, ChannelControl, ChannelOutcome, ChannelRequest, RequestGate,
    SessionHandler, SESSION_CHANNEL,
};
pub use server::{LineServer, ServerError};
pub use session::{DuplexStream, LineSession, ReadLineError, SessionContext};

/// Immutable settings shared by every connection
pub struct ServerConfig {
    pub identity: Arc<ServerIdentity>,
    pub auth: AuthPolicy,
    /// Deadline for a new connection to finish authenticating
    pub handshake_timeout: Option<Duration>,
    transport: Arc<russh::server::Config>,
}

impl ServerConfig {
    pub fn new(identity: ServerIdentity, auth: AuthPolicy) -> Self {
        Self::build(identity, auth, None, None)
    }

    /// Build from file/env configuration
    pub fn from_config(identity: ServerIdentity, config: &Config) -> Self {
        Self::build(
            identity,
            AuthPolicy::default(),
            config.handshake_timeout(),
            config.inactivity_timeout(),
        )
    }

    fn build(
        identity: ServerIdentity,
        auth: AuthPolicy,
        handshake_timeout: Option<Duration>,
        inactivity_timeout: Option<Duration>,
    ) -> Self {
        let transport = russh::server::Config {
            keys: vec![identity.key().clone()],
            inactivity_timeout,
            ..Default::default()
        };
        Self {
            identity: Arc::new(identity),
            auth,
            handshake_timeout,
            transport: Arc::new(transport),
        }
    }

    pub fn with_auth_policy(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// russh transport settings
    pub fn transport(&self) -> Arc<russh::server::Config> {
        self.transport.clone()
    }
}

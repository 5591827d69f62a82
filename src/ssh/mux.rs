//! Per-channel request multiplexing
//!
//! Channel requests are answered by the connection handler the moment russh
//! delivers them, using one [`RequestGate`] per channel: the first `shell` is
//! granted, everything else denied. Every accepted `session` channel also gets
//! a task running [`multiplex`], which waits for the granted shell and then
//! runs the application's [`SessionHandler`] over a [`LineSession`] wrapping
//! the channel stream. When the handler finishes the channel is closed,
//! whatever way it finished.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::session::{DuplexStream, LineSession, SessionContext};

/// The only channel type this server accepts
pub const SESSION_CHANNEL: &str = "session";

/// Decision for a channel-open attempt
///
/// The message is for logs only; russh picks the reason code on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject { message: &'static str },
}

/// Decide whether a channel of `channel_type` may be opened
pub fn admit(channel_type: &str) -> Admission {
    if channel_type == SESSION_CHANNEL {
        Admission::Accept
    } else {
        Admission::Reject {
            message: "unknown channel type",
        }
    }
}

/// An in-channel request forwarded from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Shell,
    Pty { term: String },
    Env { name: String, value: String },
    Exec { command: String },
    Subsystem { name: String },
    X11 { screen: u32 },
}

impl ChannelRequest {
    /// Wire name of the request type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Pty { .. } => "pty-req",
            Self::Env { .. } => "env",
            Self::Exec { .. } => "exec",
            Self::Subsystem { .. } => "subsystem",
            Self::X11 { .. } => "x11-req",
        }
    }
}

impl fmt::Display for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Request state of one channel
///
/// russh expects each want-reply request to be answered before the next one
/// arrives, so the decision is made synchronously in the handler callback.
#[derive(Debug, Default)]
pub struct RequestGate {
    shell_granted: bool,
}

impl RequestGate {
    /// Answer one request: `true` only for the channel's first `shell`
    pub fn decide(&mut self, request: &ChannelRequest) -> bool {
        match request {
            ChannelRequest::Shell if !self.shell_granted => {
                self.shell_granted = true;
                true
            }
            _ => false,
        }
    }

    pub fn shell_granted(&self) -> bool {
        self.shell_granted
    }
}

/// Transport-side controls for one channel
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Report `exit_status` (if any) and close the channel
    async fn close(&self, exit_status: Option<u32>);
}

/// Application logic run once per granted shell
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn run(&self, session: LineSession) -> Result<()>;
}

#[async_trait]
impl<F, Fut> SessionHandler for F
where
    F: Fn(LineSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, session: LineSession) -> Result<()> {
        (self)(session).await
    }
}

/// How a channel's session task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Channel went away before any shell was granted
    NoShell,
    /// Handler returned `Ok`
    Completed,
    /// Handler returned an error
    Failed,
    /// Handler panicked
    Panicked,
}

impl ChannelOutcome {
    fn exit_status(self) -> Option<u32> {
        match self {
            Self::NoShell => None,
            Self::Completed => Some(0),
            Self::Failed | Self::Panicked => Some(1),
        }
    }
}

/// Run one channel's session from shell grant to close
///
/// `shell` fires after the grant has been sent to the client; dropping its
/// sender means the channel closed without a shell, and nothing is sent.
pub async fn multiplex<S, C>(
    shell: oneshot::Receiver<()>,
    stream: S,
    control: C,
    handler: Arc<dyn SessionHandler>,
    context: SessionContext,
) -> ChannelOutcome
where
    S: DuplexStream + 'static,
    C: ChannelControl,
{
    if shell.await.is_err() {
        debug!("channel closed before shell request");
        return ChannelOutcome::NoShell;
    }

    info!(user = %context.user, peer = ?context.peer, "session started");
    let session = LineSession::with_context(stream, context);
    let outcome = match AssertUnwindSafe(handler.run(session)).catch_unwind().await {
        Ok(Ok(())) => ChannelOutcome::Completed,
        Ok(Err(e)) => {
            warn!(error = %e, "session handler failed");
            ChannelOutcome::Failed
        }
        Err(_) => {
            warn!("session handler panicked");
            ChannelOutcome::Panicked
        }
    };

    control.close(outcome.exit_status()).await;
    info!(?outcome, "session ended");
    outcome
}

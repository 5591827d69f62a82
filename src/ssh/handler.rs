//! SSH connection handler
//!
//! One [`ConnectionHandler`] per TCP connection. russh drives it from the
//! connection's session loop; it decides on auth, admits channels and answers
//! each channel request inside the callback that delivered it. A granted
//! shell only signals the channel's session task to start. The handler never
//! waits on a session task, so one busy session cannot stall the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use russh::server::{self, Handle, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use super::auth::Credential;
use super::mux::{self, Admission, ChannelControl, ChannelRequest, RequestGate, SessionHandler};
use super::session::SessionContext;
use super::ServerConfig;

/// Per-connection SSH handler
pub struct ConnectionHandler {
    config: Arc<ServerConfig>,
    sessions: Arc<dyn SessionHandler>,
    peer: Option<SocketAddr>,
    /// Set once auth succeeds
    user: Option<String>,
    /// Signalled on successful auth, ends the handshake deadline
    authenticated: Arc<Notify>,
    /// Live session channels
    channels: HashMap<ChannelId, ChannelSlot>,
}

/// Handler-side state of one session channel
struct ChannelSlot {
    gate: RequestGate,
    /// Starts the channel's session task; taken when the shell is granted
    start: Option<oneshot::Sender<()>>,
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<ServerConfig>,
        sessions: Arc<dyn SessionHandler>,
        peer: Option<SocketAddr>,
        authenticated: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            sessions,
            peer,
            user: None,
            authenticated,
            channels: HashMap::new(),
        }
    }

    fn authorize(&mut self, user: &str, credential: Credential<'_>) -> server::Auth {
        if self.config.auth.permits(user, credential) {
            info!(user, method = credential.method(), peer = ?self.peer, "authenticated");
            self.user = Some(user.to_string());
            self.authenticated.notify_one();
            server::Auth::Accept
        } else {
            warn!(user, method = credential.method(), peer = ?self.peer, "auth rejected");
            server::Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    /// Turn away a channel type other than `session`
    fn refuse_channel(&self, channel_type: &str) -> bool {
        match mux::admit(channel_type) {
            Admission::Accept => true,
            Admission::Reject { message } => {
                debug!(channel_type, reason = message, peer = ?self.peer, "rejecting channel");
                false
            }
        }
    }

    /// Answer a channel request on the spot
    ///
    /// russh keeps a single want-reply flag per channel, so the reply has to
    /// go out before the callback returns.
    fn answer(&mut self, channel: ChannelId, request: ChannelRequest, session: &mut Session) {
        let Some(slot) = self.channels.get_mut(&channel) else {
            debug!(?channel, %request, "request for unknown channel");
            let _ = session.channel_failure(channel);
            return;
        };

        if !slot.gate.decide(&request) {
            debug!(?channel, %request, "denying channel request");
            let _ = session.channel_failure(channel);
            return;
        }

        let _ = session.channel_success(channel);
        match slot.start.take().map(|start| start.send(()).is_ok()) {
            Some(true) => {
                debug!(?channel, "shell granted");
            }
            _ => warn!(?channel, "session task gone before shell start"),
        }
    }
}

impl server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<server::Auth, Self::Error> {
        Ok(self.authorize(user, Credential::None))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<server::Auth, Self::Error> {
        Ok(self.authorize(user, Credential::Password(password)))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &russh::keys::PublicKey,
    ) -> Result<server::Auth, Self::Error> {
        Ok(self.authorize(user, Credential::PublicKey(key)))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let (start, shell) = oneshot::channel();
        self.channels.insert(
            id,
            ChannelSlot {
                gate: RequestGate::default(),
                start: Some(start),
            },
        );

        let control = RusshChannel {
            handle: session.handle(),
            id,
        };
        let context = SessionContext {
            user: self.user.clone().unwrap_or_default(),
            peer: self.peer,
        };
        tokio::spawn(mux::multiplex(
            shell,
            channel.into_stream(),
            control,
            self.sessions.clone(),
            context,
        ));

        info!(channel = ?id, peer = ?self.peer, "session channel opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("direct-tcpip"))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("forwarded-tcpip"))
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        _socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("direct-streamlocal@openssh.com"))
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // dropping an unused start signal ends the session task
        if self.channels.remove(&channel).is_some() {
            debug!(?channel, "session channel closed by peer");
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
        };
        self.answer(channel, request, session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.answer(channel, request, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer(channel, ChannelRequest::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Exec {
            command: String::from_utf8_lossy(data).into_owned(),
        };
        self.answer(channel, request, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Subsystem {
            name: name.to_string(),
        };
        self.answer(channel, request, session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::X11 {
            screen: x11_screen_number,
        };
        self.answer(channel, request, session);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(address, port = *port, "declining global request tcpip-forward");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(address, port, "declining global request cancel-tcpip-forward");
        Ok(false)
    }
}

/// [`ChannelControl`] backed by the connection's russh handle
struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

#[async_trait]
impl ChannelControl for RusshChannel {
    async fn close(&self, exit_status: Option<u32>) {
        if let Some(status) = exit_status {
            let _ = self.handle.exit_status_request(self.id, status).await;
        }
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

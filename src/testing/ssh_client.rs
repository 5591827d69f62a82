//! SSH test client for automated testing
//!
//! Connects to a lineshell server, drives one session channel and records
//! everything the server sends back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, ChannelOpenFailure, Disconnect};
use tokio::time::Instant;

/// What the server sent on the session channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Success,
    Failure,
    Data(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Close,
}

/// Test client holding one connection and at most one open session channel
pub struct LineClient {
    handle: Handle<ClientHandler>,
    channel: Option<Channel<client::Msg>>,
}

impl LineClient {
    /// Connect and authenticate with the `none` method
    pub async fn connect(addr: impl Into<SocketAddr>, user: &str) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr.into(), ClientHandler)
            .await
            .context("failed to connect")?;

        let auth = handle
            .authenticate_none(user)
            .await
            .context("authentication failed")?;
        if !auth.success() {
            bail!("authentication rejected");
        }

        Ok(Self {
            handle,
            channel: None,
        })
    }

    /// Open the session channel later requests go to
    pub async fn open_session(&mut self) -> Result<()> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;
        self.channel = Some(channel);
        Ok(())
    }

    /// Try a `direct-tcpip` channel, returning the server's refusal reason
    pub async fn try_direct_tcpip(
        &self,
        host: &str,
        port: u32,
    ) -> Result<Option<ChannelOpenFailure>> {
        let opened = self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await;
        open_refusal(opened.map(drop)).context("direct-tcpip open failed")
    }

    /// Try a `direct-streamlocal@openssh.com` channel, returning the refusal reason
    pub async fn try_direct_streamlocal(
        &self,
        socket_path: &str,
    ) -> Result<Option<ChannelOpenFailure>> {
        let opened = self
            .handle
            .channel_open_direct_streamlocal(socket_path)
            .await;
        open_refusal(opened.map(drop)).context("direct-streamlocal open failed")
    }

    pub async fn request_pty(&self) -> Result<()> {
        self.channel()?
            .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
            .await
            .context("failed to request PTY")
    }

    pub async fn set_env(&self, name: &str, value: &str) -> Result<()> {
        self.send_env(name, value, true).await
    }

    /// Env request, optionally without asking for a reply
    pub async fn send_env(&self, name: &str, value: &str, want_reply: bool) -> Result<()> {
        self.channel()?
            .set_env(want_reply, name, value)
            .await
            .context("failed to send env request")
    }

    pub async fn request_shell(&self) -> Result<()> {
        self.channel()?
            .request_shell(true)
            .await
            .context("failed to request shell")
    }

    pub async fn exec(&self, command: &str) -> Result<()> {
        self.channel()?
            .exec(true, command)
            .await
            .context("failed to send exec request")
    }

    /// Send one line of input (adds newline if not present)
    pub async fn send(&self, input: &str) -> Result<()> {
        let data = if input.ends_with('\n') {
            input.as_bytes().to_vec()
        } else {
            format!("{}\n", input).into_bytes()
        };

        self.channel()?
            .data(&data[..])
            .await
            .context("failed to send data")
    }

    /// Next event from the server, or `None` once `timeout` passes
    pub async fn next_event(&mut self, timeout: Duration) -> Result<Option<ChannelEvent>> {
        let channel = self.channel_mut()?;
        loop {
            let msg = match tokio::time::timeout(timeout, channel.wait()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(Some(ChannelEvent::Close)),
                Err(_) => return Ok(None),
            };
            let event = match msg {
                ChannelMsg::Success => ChannelEvent::Success,
                ChannelMsg::Failure => ChannelEvent::Failure,
                ChannelMsg::Data { data } => ChannelEvent::Data(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Close,
                _ => continue,
            };
            return Ok(Some(event));
        }
    }

    /// Next request reply, skipping any output that arrives first
    pub async fn next_reply(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining).await? {
                Some(ChannelEvent::Success) => return Ok(true),
                Some(ChannelEvent::Failure) => return Ok(false),
                Some(ChannelEvent::Close) => bail!("channel closed while waiting for reply"),
                Some(_) => continue,
                None => bail!("timeout waiting for reply"),
            }
        }
    }

    /// Collect every event until the channel closes
    pub async fn collect_until_close(&mut self, timeout: Duration) -> Result<Vec<ChannelEvent>> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining).await? {
                Some(ChannelEvent::Close) => {
                    events.push(ChannelEvent::Close);
                    return Ok(events);
                }
                Some(event) => events.push(event),
                None => bail!("timeout waiting for close, got {:?}", events),
            }
        }
    }

    /// Wait until pattern appears in output, or timeout
    ///
    /// Returns all collected output once pattern is found.
    /// Pattern is matched against the visible text (ANSI codes stripped).
    pub async fn wait_for_pattern(&mut self, pattern: &str, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();
        loop {
            let text = strip_ansi(&output);
            if text.contains(pattern) {
                return Ok(text);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining).await? {
                Some(ChannelEvent::Data(data)) => output.extend_from_slice(&data),
                Some(ChannelEvent::Close) | Some(ChannelEvent::Eof) => {
                    bail!("channel ended before {:?} appeared in {:?}", pattern, text)
                }
                Some(_) => {}
                None => bail!("timeout waiting for {:?}, got {:?}", pattern, text),
            }
        }
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")
    }

    fn channel(&self) -> Result<&Channel<client::Msg>> {
        self.channel.as_ref().context("no session channel open")
    }

    fn channel_mut(&mut self) -> Result<&mut Channel<client::Msg>> {
        self.channel.as_mut().context("no session channel open")
    }
}

/// `None` when the channel opened, the reason when the server refused it
fn open_refusal(
    opened: Result<(), russh::Error>,
) -> Result<Option<ChannelOpenFailure>, russh::Error> {
    match opened {
        Ok(()) => Ok(None),
        Err(russh::Error::ChannelOpenFailure(reason)) => Ok(Some(reason)),
        Err(e) => Err(e),
    }
}

/// Strip ANSI escape sequences from bytes, return as string
pub fn strip_ansi(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut result = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        // CSI runs to the first letter; anything else is a two-byte escape
        if chars.next() == Some('[') {
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        }
    }

    result
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // local test servers only
        Ok(true)
    }
}

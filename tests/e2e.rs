//! End-to-end tests for lineshell
//!
//! Each test starts a real server on a loopback port with a throwaway Ed25519
//! host key and drives it with the SSH test client.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use russh::ChannelOpenFailure;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lineshell::ssh::Credential;
use lineshell::testing::{ChannelEvent, LineClient};
use lineshell::{
    ensure_identity, AuthPolicy, KeyAlgorithm, LineServer, LineSession, ServerConfig,
};

const WAIT: Duration = Duration::from_secs(5);

/// Running server plus what keeps it alive
struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    _key_dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(config: impl FnOnce(ServerConfig) -> ServerConfig) -> Result<Self> {
        let key_dir = tempfile::tempdir()?;
        let identity = ensure_identity(key_dir.path().join("host_key"), KeyAlgorithm::Ed25519)?;
        let config = config(ServerConfig::new(identity, AuthPolicy::default()));
        let server = LineServer::new(config, echo_terminal);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve_until(listener, token).await });

        Ok(Self {
            addr,
            shutdown,
            task,
            _key_dir: key_dir,
        })
    }

    async fn default() -> Result<Self> {
        Self::start(|config| config).await
    }

    /// Connect, open a session channel and get a shell granted
    async fn shell(&self, user: &str) -> Result<LineClient> {
        let mut client = LineClient::connect(self.addr, user).await?;
        client.open_session().await?;
        client.request_shell().await?;
        assert!(client.next_reply(WAIT).await?, "shell should be granted");
        Ok(client)
    }
}

/// Echo terminal: greets, echoes, says goodbye on `exit`, fails on `boom`
async fn echo_terminal(mut conn: LineSession) -> Result<()> {
    let user = conn.user().to_string();
    let greeting = conn.write_formatted(format_args!("welcome {}\r\n", user));
    greeting.await?;

    loop {
        let line = match conn.read_line().await {
            Ok(line) => line,
            Err(_) => return Ok(()),
        };
        match line.as_str() {
            "exit" => {
                conn.write_line("byee").await?;
                return Ok(());
            }
            "boom" => anyhow::bail!("asked to fail"),
            _ => conn.write_line(format!("you wrote: {}", line)).await?,
        }
    }
}

fn output_of(events: &[ChannelEvent]) -> String {
    let bytes: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Data(data) => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_echo_then_exit_closes_with_status_zero() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = server.shell("alice").await?;

    client.wait_for_pattern("welcome alice", WAIT).await?;
    client.send("  hello there  ").await?;
    client.wait_for_pattern("you wrote: hello there\n", WAIT).await?;

    client.send("exit").await?;
    let events = client.collect_until_close(WAIT).await?;
    assert!(output_of(&events).contains("byee"));
    assert!(events.contains(&ChannelEvent::ExitStatus(0)));
    assert_eq!(events.last(), Some(&ChannelEvent::Close));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_pty_and_env_denied_then_shell_granted() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = LineClient::connect(server.addr, "bob").await?;
    client.open_session().await?;

    client.request_pty().await?;
    assert!(!client.next_reply(WAIT).await?);
    client.set_env("LANG", "C").await?;
    assert!(!client.next_reply(WAIT).await?);
    client.exec("ls").await?;
    assert!(!client.next_reply(WAIT).await?);

    client.request_shell().await?;
    assert!(client.next_reply(WAIT).await?);
    client.wait_for_pattern("welcome bob", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_pipelined_requests_each_get_their_reply() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = LineClient::connect(server.addr, "bob").await?;
    client.open_session().await?;

    // the way OpenSSH sends them: no waiting between requests
    client.request_pty().await?;
    client.set_env("LANG", "C").await?;
    client.request_shell().await?;

    let mut replies = Vec::new();
    for _ in 0..3 {
        replies.push(client.next_reply(WAIT).await?);
    }
    assert_eq!(replies, vec![false, false, true]);
    client.wait_for_pattern("welcome bob", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_no_reply_request_does_not_shift_replies() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = LineClient::connect(server.addr, "bob").await?;
    client.open_session().await?;

    client.request_pty().await?;
    client.send_env("LANG", "C", false).await?;
    client.request_shell().await?;

    assert!(!client.next_reply(WAIT).await?);
    assert!(client.next_reply(WAIT).await?);
    client.wait_for_pattern("welcome bob", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_pipelined_second_shell_denied() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = LineClient::connect(server.addr, "carol").await?;
    client.open_session().await?;

    client.request_shell().await?;
    client.request_shell().await?;

    assert!(client.next_reply(WAIT).await?);
    assert!(!client.next_reply(WAIT).await?);
    client.send("one shell").await?;
    client.wait_for_pattern("you wrote: one shell", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_second_shell_request_denied() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = server.shell("carol").await?;
    client.wait_for_pattern("welcome carol", WAIT).await?;

    client.request_shell().await?;
    assert!(!client.next_reply(WAIT).await?);

    // the first shell is unaffected
    client.send("still here").await?;
    client.wait_for_pattern("you wrote: still here", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_non_session_channel_rejected() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = LineClient::connect(server.addr, "dave").await?;

    // russh reports refused known channel types as administratively prohibited
    let refusal = client.try_direct_tcpip("example.com", 80).await?;
    assert!(
        matches!(refusal, Some(ChannelOpenFailure::AdministrativelyProhibited)),
        "unexpected refusal {:?}",
        refusal
    );
    let refusal = client.try_direct_streamlocal("/run/docker.sock").await?;
    assert!(
        matches!(refusal, Some(ChannelOpenFailure::AdministrativelyProhibited)),
        "unexpected refusal {:?}",
        refusal
    );

    // the connection survives the rejection
    client.open_session().await?;
    client.request_shell().await?;
    assert!(client.next_reply(WAIT).await?);
    client.wait_for_pattern("welcome dave", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_handler_error_closes_with_status_one() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = server.shell("erin").await?;

    client.send("boom").await?;
    let events = client.collect_until_close(WAIT).await?;
    assert!(events.contains(&ChannelEvent::ExitStatus(1)));
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_independent() -> Result<()> {
    let server = TestServer::default().await?;
    let mut first = server.shell("frank").await?;
    let mut second = server.shell("grace").await?;

    first.send("exit").await?;
    let events = first.collect_until_close(WAIT).await?;
    assert!(events.contains(&ChannelEvent::ExitStatus(0)));

    second.send("ping").await?;
    second.wait_for_pattern("you wrote: ping", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_auth_policy_rejects_user() -> Result<()> {
    let server = TestServer::start(|config| {
        config.with_auth_policy(AuthPolicy::custom(|user: &str, _: Credential<'_>| {
            user == "alice"
        }))
    })
    .await?;

    assert!(LineClient::connect(server.addr, "mallory").await.is_err());
    let mut client = server.shell("alice").await?;
    client.wait_for_pattern("welcome alice", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn test_silent_client_dropped_after_handshake_timeout() -> Result<()> {
    let server = TestServer::start(|config| {
        config.with_handshake_timeout(Some(Duration::from_millis(200)))
    })
    .await?;

    let mut stream = tokio::net::TcpStream::connect(server.addr).await?;
    let mut seen = Vec::new();
    // the server banner may arrive, then the connection must end
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut seen)).await;
    assert!(read.is_ok(), "connection still open after handshake deadline");
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_accepting() -> Result<()> {
    let server = TestServer::default().await?;
    let mut client = server.shell("heidi").await?;
    client.wait_for_pattern("welcome heidi", WAIT).await?;

    server.shutdown.cancel();
    tokio::time::timeout(WAIT, server.task).await??;

    // established sessions keep running
    client.send("after").await?;
    client.wait_for_pattern("you wrote: after", WAIT).await?;

    assert!(LineClient::connect(server.addr, "ivan").await.is_err());
    Ok(())
}

//! SSH test client CLI
//!
//! Simple tool for poking at a lineshell server.
//!
//! Usage:
//!   cargo run --bin sshtest -- --line "hello" --line "exit"
//!   cargo run --bin sshtest -- --addr 127.0.0.1:2222 --pty --env LANG=C

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lineshell::testing::{ChannelEvent, LineClient};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct Args {
    addr: String,
    username: String,
    lines: Vec<String>,
    env: Vec<(String, String)>,
    pty: bool,
    wait_ms: u64,
    raw: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        addr: "localhost:2222".to_string(),
        username: std::env::var("USER").unwrap_or_else(|_| "guest".to_string()),
        lines: Vec::new(),
        env: Vec::new(),
        pty: false,
        wait_ms: 500,
        raw: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().ok_or_else(|| anyhow!("{} requires value", flag));
        match arg.as_str() {
            "--addr" | "-a" => args.addr = value("--addr")?,
            "--user" | "-u" => args.username = value("--user")?,
            "--line" | "-l" => args.lines.push(value("--line")?),
            "--env" | "-e" => {
                let pair = value("--env")?;
                let (name, val) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--env expects NAME=VALUE, got {}", pair))?;
                args.env.push((name.to_string(), val.to_string()));
            }
            "--pty" | "-p" => args.pty = true,
            "--wait" | "-w" => args.wait_ms = value("--wait")?.parse()?,
            "--raw" | "-r" => args.raw = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    Ok(args)
}

fn print_help() {
    eprintln!(
        r#"sshtest - SSH test client for lineshell

USAGE:
    sshtest [OPTIONS]

OPTIONS:
    -a, --addr <ADDR>        Server address [default: localhost:2222]
    -u, --user <NAME>        Username [default: $USER]
    -l, --line <TEXT>        Line to send (can be repeated)
    -e, --env <NAME=VALUE>   Environment request before the shell (can be repeated)
    -p, --pty                Request a PTY before the shell
    -w, --wait <MS>          Wait time after the last line [default: 500]
    -r, --raw                Print raw bytes (hex dump)
    -h, --help               Print help

EXAMPLES:
    sshtest --line "hello" --line "exit"
    sshtest --addr 192.168.1.10:2222 --pty --line q
"#
    );
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to nothing", addr))
}

fn report(request: &str, granted: bool) {
    eprintln!("{}: {}", request, if granted { "granted" } else { "denied" });
}

fn print_hex(output: &[u8]) {
    for (i, chunk) in output.chunks(16).enumerate() {
        print!("{:04x}: ", i * 16);
        for byte in chunk {
            print!("{:02x} ", byte);
        }
        print!("  ");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                print!("{}", *byte as char);
            } else {
                print!(".");
            }
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let addr = resolve(&args.addr)?;

    eprintln!("connecting to {} as {}...", addr, args.username);
    let mut client = LineClient::connect(addr, &args.username).await?;
    client.open_session().await?;

    if args.pty {
        client.request_pty().await?;
        report("pty-req", client.next_reply(REPLY_TIMEOUT).await?);
    }
    for (name, value) in &args.env {
        client.set_env(name, value).await?;
        report(&format!("env {}", name), client.next_reply(REPLY_TIMEOUT).await?);
    }
    client.request_shell().await?;
    let granted = client.next_reply(REPLY_TIMEOUT).await?;
    report("shell", granted);
    if !granted {
        return client.close().await;
    }

    // Wait a bit for the greeting
    tokio::time::sleep(Duration::from_millis(200)).await;

    for line in &args.lines {
        eprintln!("> {}", line);
        client.send(line).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(event) = client
        .next_event(Duration::from_millis(args.wait_ms))
        .await?
    {
        match event {
            ChannelEvent::Data(data) => output.extend_from_slice(&data),
            ChannelEvent::ExitStatus(status) => exit_status = Some(status),
            ChannelEvent::Close => break,
            _ => {}
        }
    }

    eprintln!("--- output ({} bytes) ---", output.len());
    if args.raw {
        print_hex(&output);
    } else {
        print!("{}", String::from_utf8_lossy(&output));
    }
    eprintln!("---");
    if let Some(status) = exit_status {
        eprintln!("exit status {}", status);
    }

    client.close().await?;
    eprintln!("disconnected");
    Ok(())
}

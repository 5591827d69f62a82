//! lineshell demo - SSH echo terminal
//!
//! Greets each client, echoes every line back and says goodbye on `exit`
//! or `q`. Try it with `ssh -p 2222 localhost`.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lineshell::config::Config;
use lineshell::paths;
use lineshell::{LineServer, LineSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lineshell=info".parse()?),
        )
        .init();

    let config = Config::load(paths::config_path())?.apply_env()?;
    paths::log_paths(&config);
    info!(addr = %config.listen_addr, "starting lineshell");

    let server = LineServer::init(&config, terminal).context("failed to initialize server")?;
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            on_signal.cancel();
        }
    });

    server.serve_until(listener, shutdown).await;
    Ok(())
}

async fn terminal(mut conn: LineSession) -> Result<()> {
    conn.write_line("\x1bcWelcome to the lineshell echo server!").await?;
    let user = conn.user().to_string();
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let greeting = conn.write_formatted(format_args!("connected as {} at {}\r\n", user, now));
    greeting.await?;
    conn.write("\r\ntype a line and it comes back, `exit` or `q` to leave\r\n\r\n")
        .await?;

    loop {
        let answer = match conn.read_line().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, partial = e.partial(), "session input ended");
                return Ok(());
            }
        };

        if answer == "exit" || answer == "q" {
            conn.write_line("byee").await?;
            return conn.close().await.map_err(Into::into);
        }
        conn.write_line(format!("you wrote: {}", answer)).await?;
    }
}

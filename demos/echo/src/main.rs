//! Line echo server and client built on `sockline`.
//!
//! ```text
//! sockline-echo server <port>
//! sockline-echo client <host> <port> <message>
//! ```
//!
//! Set `SOCKLINE_CONFIG` to a JSON file to override [`NetConfig`] fields
//! and `RUST_LOG` to change the log filter.

use std::error::Error;
use std::time::Duration;

use sockline::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: sockline-echo server <port> | client <host> <port> <message>";

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Removes every complete `\n`-terminated line from the front of the
/// handle's text and returns them without terminators. A trailing partial
/// line stays for the next receive.
fn take_lines(handle: &ConnectionHandle) -> Vec<String> {
    let complete = handle.with_data(|text| text.rfind('\n').map(|end| text[..=end].to_owned()));
    let Some(complete) = complete else {
        return Vec::new();
    };
    handle.remove_data(0, complete.len());
    complete.lines().map(str::to_owned).collect()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn on_client(handle: ConnectionHandle) {
    match handle.event() {
        NetEvent::Connected => {
            if let Some(socket) = handle.socket() {
                info!(id = %handle.id(), peer = %socket.peer_addr(), "client connected");
            }
        }
        NetEvent::Data => {
            for line in take_lines(&handle) {
                debug!(id = %handle.id(), %line, "echoing");
                handle.send(&format!("{line}\n"));
            }
        }
        NetEvent::Closed => {
            info!(id = %handle.id(), "client disconnected");
            return;
        }
        NetEvent::Error => {
            warn!(id = %handle.id(), error = ?handle.error_message(), "connection error");
            return;
        }
    }
    receive(&handle);
}

async fn run_server(config: NetConfig, port: u16) -> Result<(), Box<dyn Error>> {
    let listener = start_server_with(config, on_client, port)?;
    info!(port = listener.port(), "echo server ready, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    stop_server(Some(&listener))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sends `message` as one line and waits for the echoed line.
async fn echo_once(
    config: NetConfig,
    host: &str,
    port: u16,
    message: &str,
) -> Result<String, Box<dyn Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<String, String>>();
    let line = format!("{message}\n");

    connect_to_server_with(
        config,
        move |handle| {
            match handle.event() {
                NetEvent::Connected => {
                    handle.send(&line);
                }
                NetEvent::Data => {
                    if let Some(reply) = take_lines(&handle).into_iter().next() {
                        let _ = tx.send(Ok(reply));
                        if let Some(socket) = handle.socket() {
                            socket.close();
                        }
                        return;
                    }
                }
                NetEvent::Closed | NetEvent::Error => {
                    let _ = tx.send(Err(handle.error_message().unwrap_or_default()));
                    return;
                }
            }
            receive(&handle);
        },
        host,
        port,
    );

    match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
        Ok(Some(Ok(reply))) => Ok(reply),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) | Err(_) => Err("no reply from server".into()),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn load_config() -> Result<NetConfig, Box<dyn Error>> {
    match std::env::var("SOCKLINE_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&text)?)
        }
        Err(_) => Ok(NetConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [mode, port] if mode == "server" => run_server(config, port.parse()?).await,
        [mode, host, port, message] if mode == "client" => {
            let reply = echo_once(config, host, port.parse()?, message).await?;
            println!("{reply}");
            Ok(())
        }
        _ => Err(USAGE.into()),
    }
}

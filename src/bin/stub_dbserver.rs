//! Minimal stand-in for a database server.
//!
//! Reads the `key = value` file written by dbfixture, listens on
//! `bind_ip:port` and echoes whatever clients send until SIGTERM or SIGINT.
//!
//! Extra parameters understood for testing:
//! - `startup_delay_ms`: wait this long before binding
//! - `fail_fast`: exit with status 1 instead of binding
//! - `ignore_sigterm`: keep serving after SIGTERM, so only SIGKILL stops it

use dbfixture::instance::{read_config_file, Params, BIND_IP_PARAM, PORT_PARAM};
use dbfixture::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        if let Some(suggestion) = e.suggestion() {
            eprintln!("\nHint: {}", suggestion);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.as_slice() {
        [flag] if flag == "--version" => {
            println!("stub-dbserver {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        [flag, path] if flag == "--config" => PathBuf::from(path),
        _ => {
            return Err(Error::Config(
                "usage: stub-dbserver --config <file> | --version".to_string(),
            ))
        }
    };

    let params = read_config_file(&config_path)?;
    if is_set(&params, "fail_fast") {
        return Err(Error::Config("fail_fast is set, exiting".to_string()));
    }
    if let Some(delay) = params
        .get("startup_delay_ms")
        .and_then(|v| v.parse::<u64>().ok())
    {
        debug!("Delaying startup by {}ms", delay);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let host = params
        .get(BIND_IP_PARAM)
        .map(String::as_str)
        .unwrap_or("127.0.0.1");
    let port = params
        .get(PORT_PARAM)
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| Error::Config(format!("'{}' must hold a valid port", PORT_PARAM)))?;

    let listener = TcpListener::bind((host, port)).await?;
    info!("Listening on {} (pid {})", listener.local_addr()?, std::process::id());

    let ignore_sigterm = is_set(&params, "ignore_sigterm");
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    tokio::spawn(serve(stream));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = sigterm.recv() => {
                if ignore_sigterm {
                    info!("Ignoring SIGTERM");
                    continue;
                }
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn is_set(params: &Params, key: &str) -> bool {
    params
        .get(key)
        .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

async fn serve(mut stream: TcpStream) {
    if stream.write_all(b"stub-dbserver ready\n").await.is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

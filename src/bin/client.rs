//! veil Client Binary
//!
//! Usage: veil-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -t, --test <FILE>    Test a handshake with the server
//!   -h, --help           Print help information

use std::env;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use veil::handshake::client::ClientStream;
use veil::server::ClientConfigFile;
use veil::{ClientInstance, Error};

/// Bytes of a resumed connection kept for a resend after rejection.
const REPLAY_LIMIT: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-t" | "--test" => {
            if args.len() < 3 {
                eprintln!("Error: --test requires a config file path");
                return Ok(());
            }
            test_connection(&args[2]).await?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"veil Client - obfuscated post-quantum tunnel

USAGE:
    veil-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -t, --test <FILE>    Test a handshake using config file
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "listen_addr": "127.0.0.1:1080",
        "server_addr": "server.example.com:443",
        "encryption": "mlkem768.xorpub.600s.<base64>"
    }}

EXAMPLES:
    Test connection:
        veil-client --test client.json

    Run the local tunnel endpoint:
        veil-client --config client.json
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<ClientConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config: ClientConfigFile = serde_json::from_str(&content)?;
    Ok(config)
}

async fn dial(client: &ClientInstance, config: &ClientConfigFile) -> anyhow::Result<ClientStream<TcpStream>> {
    let tcp = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&config.server_addr))
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to {}", config.server_addr))??;
    tcp.set_nodelay(true)?;
    Ok(client.handshake(tcp).await?)
}

async fn test_connection(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let client = ClientInstance::new(config.params()?);

    tracing::info!("Testing handshake with {}", config.server_addr);

    match dial(&client, &config).await {
        Ok(mut conn) => {
            tracing::info!("Handshake complete, cipher {:?}", conn.cipher());
            conn.shutdown().await?;
        }
        Err(e) => {
            tracing::error!("Handshake failed: {}", e);
        }
    }

    Ok(())
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path)?);
    let client = Arc::new(ClientInstance::new(config.params()?));

    let listener = TcpListener::bind(config.listen_addr()?).await?;
    tracing::info!("Listening on {}, tunnelling to {}", listener.local_addr()?, config.server_addr);

    loop {
        match listener.accept().await {
            Ok((local, peer_addr)) => {
                let client = Arc::clone(&client);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Err(e) = tunnel(&client, &config, local).await {
                        tracing::debug!("Tunnel error for {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
            }
        }
    }
}

async fn tunnel(client: &ClientInstance, config: &ClientConfigFile, mut local: TcpStream) -> anyhow::Result<()> {
    local.set_nodelay(true)?;
    let mut remote = dial(client, config).await?;

    if !remote.is_resumed() {
        tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
        return Ok(());
    }

    // Until the server answers, a resumed connection may still be rejected.
    let mut opening = Opening::default();
    let mut reply = vec![0u8; 16 * 1024];
    match first_reply(&mut local, &mut remote, &mut opening, &mut reply).await {
        Ok(0) => Ok(()),
        Ok(n) => {
            local.write_all(&reply[..n]).await?;
            tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
            Ok(())
        }
        Err(e) if !opening.overflowed && is_rejection(&e) => {
            tracing::info!("Resumption rejected, retrying with a full handshake");
            let mut remote = dial(client, config).await?;
            remote.write_all(&opening.sent).await?;
            tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn is_rejection(err: &io::Error) -> bool {
    Error::from_io(err).is_some_and(|e| e.needs_full_handshake() || e.is_auth_failure())
}

#[derive(Default)]
struct Opening {
    sent: Vec<u8>,
    overflowed: bool,
    local_eof: bool,
}

/// Forward local data until the server's first bytes arrive.
async fn first_reply(
    local: &mut TcpStream,
    remote: &mut ClientStream<TcpStream>,
    opening: &mut Opening,
    reply: &mut [u8],
) -> io::Result<usize> {
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            n = remote.read(reply) => return n,
            n = local.read(&mut chunk), if !opening.local_eof => {
                let n = n?;
                if n == 0 {
                    opening.local_eof = true;
                    continue;
                }
                remote.write_all(&chunk[..n]).await?;
                remote.flush().await?;
                if opening.sent.len() + n <= REPLAY_LIMIT {
                    opening.sent.extend_from_slice(&chunk[..n]);
                } else {
                    opening.overflowed = true;
                }
            }
        }
    }
}

//! veil Server Binary
//!
//! Usage: veil-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate new server configuration
//!   -h, --help           Print help information

use std::env;

use veil::obfuscation::ObfuscationMode;
use veil::server::{ClientConfigFile, ServerConfig, ServerConfigFile, TunnelServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
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
        "-g" | "--generate" => {
            let mode = match args.get(2) {
                Some(mode) => mode.parse::<ObfuscationMode>()?,
                None => ObfuscationMode::PublicKey,
            };
            generate_config(mode)?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        "--show-client" => {
            if args.len() < 3 {
                eprintln!("Error: --show-client requires a config file path");
                return Ok(());
            }
            show_client(&args[2])?;
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
        r#"veil Server - obfuscated post-quantum tunnel

USAGE:
    veil-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>        Path to configuration file
    -g, --generate [MODE]      Generate new server configuration
                               (MODE: native, xorpub, random; default xorpub)
    --show-client <FILE>       Print the client.json matching a config
    -h, --help                 Print help information

EXAMPLES:
    Generate a new configuration:
        veil-server --generate > server.toml

    Run the server:
        veil-server --config server.toml

    Show client settings:
        veil-server --show-client server.toml
"#
    );
}

fn generate_config(mode: ObfuscationMode) -> anyhow::Result<()> {
    let config = ServerConfig::new_random("0.0.0.0:443".parse()?, "127.0.0.1:8080", mode)?;
    let config_file = ServerConfigFile::from_config(&config);

    println!("# veil Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);
    println!();
    println!("# Client encryption string (put this in client.json):");
    println!("# {}", config.params.client_encryption_string());

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config_file: ServerConfigFile = toml::from_str(&content)?;
    Ok(config_file.to_config()?)
}

fn show_client(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let client = ClientConfigFile::for_server(&config, format!("YOUR_SERVER_IP:{}", config.listen_addr.port()));

    println!("{}", serde_json::to_string_pretty(&client)?);
    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!("Starting veil server on {}", config.listen_addr);
    tracing::info!("Forwarding to {}", config.forward_addr);
    tracing::info!(
        "Obfuscation: {}, resumption TTL: {}s, keys: {}",
        config.params.obfuscation(),
        config.params.resumption_ttl().as_secs(),
        config.params.keys().len()
    );

    let server = TunnelServer::new(config)?;
    server.run().await?;

    Ok(())
}

//! Screenlink CLI - relay server and headless client entry points.
//!
//! See the `screenlink` library for the core functionality; this binary
//! wires it to the command line with a logging host bridge.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use screenlink::transport::{ConnectionInfo, ConnectionMode};
use screenlink::{
    CertificateManager, DenyAllPrompt, LoggingBridge, RelayServer, RemoteClient, Settings,
};

#[derive(Parser)]
#[command(name = "screenlink", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a relay server until interrupted.
    Serve {
        /// Port to listen on (IPv4 and IPv6).
        #[arg(long, default_value_t = 6837)]
        port: u16,
        /// Channel key clients must present to join.
        #[arg(long)]
        key: String,
    },
    /// Connect to a relay as the controlling endpoint.
    Lead {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 6837)]
        port: u16,
        #[arg(long)]
        key: String,
        /// Skip certificate validation for this connection.
        #[arg(long)]
        insecure: bool,
    },
    /// Connect to a relay as the controlled endpoint.
    Follow {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 6837)]
        port: u16,
        #[arg(long)]
        key: String,
        /// Skip certificate validation for this connection.
        #[arg(long)]
        insecure: bool,
    },
    /// Print the relay certificate fingerprint, provisioning it if absent.
    Fingerprint,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, key } => serve(port, key).await,
        Command::Lead {
            host,
            port,
            key,
            insecure,
        } => run_client(ConnectionMode::Leader, host, port, key, insecure).await,
        Command::Follow {
            host,
            port,
            key,
            insecure,
        } => run_client(ConnectionMode::Follower, host, port, key, insecure).await,
        Command::Fingerprint => fingerprint(),
    }
}

async fn serve(port: u16, key: String) -> Result<()> {
    let mut settings = Settings::load();
    let manager = CertificateManager::new(CertificateManager::default_dir()?);
    manager.ensure_valid_cert_exists(&mut settings)?;
    settings.save().context("persist settings")?;

    let tls = manager.server_config()?;
    let server = RelayServer::bind(port, key, tls).await?;
    println!("Relay listening on port {}", server.local_port());
    if let Some(fp) = manager.current_fingerprint() {
        println!("Certificate fingerprint: {fp}");
    }

    let handle = server.spawn();
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    println!("Shutting down");
    handle.stop().await;
    Ok(())
}

async fn run_client(
    mode: ConnectionMode,
    host: String,
    port: u16,
    key: String,
    insecure: bool,
) -> Result<()> {
    let settings = Settings::load();
    let mut client = RemoteClient::new(
        Arc::new(LoggingBridge),
        settings,
        Arc::new(DenyAllPrompt),
    );
    client.connect(ConnectionInfo {
        mode,
        hostname: host,
        port,
        key,
        insecure,
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = client.next_event() => match event {
                Some((mode, event)) => client.handle_event(mode, event),
                None => break,
            },
        }
    }
    client.disconnect().await;
    Ok(())
}

fn fingerprint() -> Result<()> {
    let mut settings = Settings::load();
    let manager = CertificateManager::new(CertificateManager::default_dir()?);
    manager.ensure_valid_cert_exists(&mut settings)?;
    settings.save().context("persist settings")?;
    let fp = manager
        .current_fingerprint()
        .context("fingerprint unreadable after provisioning")?;
    println!("{fp}");
    Ok(())
}

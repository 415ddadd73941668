// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use wiremesh_agent::api;
use wiremesh_agent::config::{self, AgentConfig};
use wiremesh_agent::device::Device;
use wiremesh_agent::firewall::CurrentFirewall;
use wiremesh_agent::netlink::CurrentPlatform;
use wiremesh_agent::reconcile::Context;
use wiremesh_agent::records::LocalRecords;
use wiremesh_agent::slot::TcpConnector;
use wiremesh_agent::Agent;
use wiremesh_bus::{Bus, Credentials, RemoteConnection};
use wiremesh_store::FileStore;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "WireGuard mesh agent for wiremesh networks")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "WIREMESH_AGENT_CONFIG", default_value = "/etc/wiremesh/agent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent (default)
    Run,

    /// Register this device using an invitation token
    Register {
        /// Bus address of the server
        #[arg(long)]
        server: Option<String>,

        #[arg(long, env = "WIREMESH_INVITE", hide_env_values = true)]
        token: String,
    },

    /// Join a network
    Join { network: String },

    /// Leave a network
    Leave { network: String },

    /// Deregister this device from the server
    LeaveServer,

    /// Print the networks this device has locally
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let config = config::load(&args.config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Register { server, token } => register(config, server, token).await,
        Command::Join { network } => {
            let (conn, device, timeout) = connect(&config).await?;
            let member = api::join(&conn, &device.public_key, &join_request(&device, network), timeout).await?;
            print_json(&member)?;
            conn.drain().await;
            Ok(())
        }
        Command::Leave { network } => {
            let (conn, device, timeout) = connect(&config).await?;
            api::leave(&conn, &device.public_key, &network, timeout).await?;
            conn.drain().await;
            Ok(())
        }
        Command::LeaveServer => {
            let (conn, mut device, timeout) = connect(&config).await?;
            api::leave_server(&conn, &device.public_key, timeout).await?;
            conn.drain().await;
            device.server = None;
            records(&config).put_device(&device).await?;
            Ok(())
        }
        Command::Status => status(&config).await,
    }
}

fn records(config: &AgentConfig) -> LocalRecords<FileStore> {
    LocalRecords::new(FileStore::new(&config.data_dir))
}

async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(&config.data_dir);
    let device = Device::load_or_create(&LocalRecords::new(store.clone())).await?;
    let server = device.server()?.to_string();
    info!(
        server = %server,
        public_key = %device.public_key,
        data_dir = %config.data_dir.display(),
        "starting wiremesh-agent"
    );

    let ctx = Context::new(
        config,
        &device,
        Arc::new(CurrentPlatform::default()),
        Arc::new(CurrentFirewall::default()),
        store,
    );
    let agent = Agent::new(TcpConnector::new(server), ctx, device)?;
    agent.start().await;

    shutdown_signal().await?;
    info!("shutdown signal received");
    agent.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn register(
    config: AgentConfig,
    server: Option<String>,
    token: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = records(&config);
    let mut device = Device::load_or_create(&records).await?;
    let server = server.unwrap_or_else(|| config.server.clone());

    let conn = RemoteConnection::connect(server.as_str(), &Credentials::Invite(token.clone())).await?;
    let result = api::register(&conn, &device.register_request(&token)?, config.request_timeout()).await;
    conn.drain().await;
    if let Err(e) = &result {
        error!(server = %server, error = %e, "registration failed");
    }
    result?;

    device.server = Some(server);
    records.put_device(&device).await?;
    println!("{}", device.public_key);
    Ok(())
}

/// A one-shot connection as this registered device.
async fn connect(config: &AgentConfig) -> Result<(RemoteConnection, Device, Duration), Box<dyn std::error::Error>> {
    let device = Device::load_or_create(&records(config)).await?;
    let conn = RemoteConnection::connect(device.server()?, &device.credentials()?).await?;
    Ok((conn, device, config.request_timeout()))
}

fn join_request(device: &Device, network: String) -> wiremesh_types::proto::JoinRequest {
    wiremesh_types::proto::JoinRequest {
        network,
        listen_port: 0,
        public_listen_port: 0,
        endpoint: device.endpoint,
        private_endpoint: None,
        hostname: device.hostname.clone(),
    }
}

#[derive(Serialize)]
struct NetworkStatus {
    network: String,
    interface: String,
    address: Option<std::net::Ipv4Addr>,
    listen_port: u16,
    public_listen_port: u16,
    peers: usize,
}

async fn status(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let records = records(config);
    let device = Device::load_or_create(&records).await?;
    let rows: Vec<NetworkStatus> = records
        .list_memberships()
        .await?
        .into_iter()
        .map(|m| NetworkStatus {
            address: m.network.peer(&device.public_key).map(|p| p.address),
            peers: m.network.peers.len().saturating_sub(1),
            network: m.network.name,
            interface: m.interface,
            listen_port: m.listen_port,
            public_listen_port: m.public_listen_port,
        })
        .collect();
    print_json(&rows)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

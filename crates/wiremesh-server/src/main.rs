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

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wiremesh_bus::{Broker, Bus, Credentials, RemoteConnection, remote, request_json};
use wiremesh_server::config::Config;
use wiremesh_server::{Authority, Dispatcher, sweep};
use wiremesh_store::FileStore;
use wiremesh_types::Reply;
use wiremesh_types::proto::{
    AddRelayRequest, AddSubnetRouterRequest, CreateInviteRequest, CreateInviteResponse,
    CreateNetworkRequest, DeleteNetworkRequest, DeleteRelayRequest, DeleteSubnetRouterRequest,
    Empty, ListNetworksResponse,
};
use wiremesh_types::subject::admin_subject;
use wiremesh_types::{Network, NetworkPeer};

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
#[command(about = "Membership authority for wiremesh networks")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default)
    Serve,

    /// Administer a running server over its bus endpoint
    Admin {
        /// Bus address of the server
        #[arg(long, env = "WIREMESH_SERVER", default_value = "127.0.0.1:4222")]
        server: String,

        /// Admin token configured on the server
        #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
        token: String,

        #[command(subcommand)]
        op: AdminOp,
    },
}

#[derive(Debug, Subcommand)]
enum AdminOp {
    /// Create a network
    CreateNetwork { name: String, cidr: String },

    /// Delete a network and disconnect its members
    DeleteNetwork { name: String },

    /// Create an invitation token for new devices
    CreateInvite {
        #[arg(long, default_value_t = 1)]
        uses: u32,

        /// Lifetime in seconds
        #[arg(long)]
        ttl: Option<i64>,
    },

    /// Route peers through a relay
    AddRelay {
        network: String,
        relay: String,
        #[arg(required = true)]
        relayed: Vec<String>,
    },

    /// Stop relaying through a peer
    DeleteRelay { network: String, relay: String },

    /// Advertise a subnet behind a peer
    AddSubnetRouter {
        network: String,
        public_key: String,
        subnet: Ipv4Network,

        /// Advertise this subnet instead and map it 1:1 onto SUBNET
        #[arg(long)]
        virt_subnet: Option<Ipv4Network>,

        /// Masquerade traffic leaving into the subnet
        #[arg(long)]
        nat: bool,
    },

    /// Stop advertising a peer's subnet
    DeleteSubnetRouter { network: String, public_key: String },

    /// Print every network as JSON
    ListNetworks,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Admin { server, token, op } => admin(&server, token, op).await,
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    info!(
        bind = %config.bus_bind_addr,
        data_dir = %config.data_dir.display(),
        "starting wiremesh-server"
    );

    let store = FileStore::new(&config.data_dir);
    let broker = Broker::new(Some(config.admin_token.clone()));
    let bus = broker.connect(&Credentials::Server)?;
    let authority = Arc::new(Authority::new(store, broker.clone(), bus.clone()));
    authority.restore_identities().await?;

    let listener = match TcpListener::bind(&config.bus_bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %config.bus_bind_addr, error = %e, "failed to bind bus endpoint");
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let endpoint = tokio::spawn(remote::serve(listener, broker.clone(), shutdown.clone()));
    let dispatcher = Dispatcher::new(authority.clone(), bus.clone())
        .spawn(shutdown.clone())
        .await?;
    let sweeper = tokio::spawn(sweep::run(
        authority.clone(),
        config.stale_after / 2,
        config.stale_after,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = endpoint.await;
        let _ = dispatcher.await;
        let _ = sweeper.await;
    })
    .await;
    bus.drain().await;
    info!("wiremesh-server stopped");
    Ok(())
}

async fn admin(server: &str, token: String, op: AdminOp) -> Result<(), Box<dyn std::error::Error>> {
    let conn = RemoteConnection::connect(server, &Credentials::Admin(token)).await?;

    match op {
        AdminOp::CreateNetwork { name, cidr } => {
            call::<_, Network>(&conn, "createNetwork", &CreateNetworkRequest { name, cidr }).await?
        }
        AdminOp::DeleteNetwork { name } => {
            call::<_, Network>(&conn, "deleteNetwork", &DeleteNetworkRequest { name }).await?
        }
        AdminOp::CreateInvite { uses, ttl } => {
            let req = CreateInviteRequest {
                uses,
                ttl_secs: ttl,
            };
            call::<_, CreateInviteResponse>(&conn, "createInvite", &req).await?
        }
        AdminOp::AddRelay {
            network,
            relay,
            relayed,
        } => {
            let req = AddRelayRequest {
                network,
                relay,
                relayed: relayed.into_iter().collect(),
            };
            call::<_, NetworkPeer>(&conn, "addRelay", &req).await?
        }
        AdminOp::DeleteRelay { network, relay } => {
            call::<_, NetworkPeer>(&conn, "deleteRelay", &DeleteRelayRequest { network, relay })
                .await?
        }
        AdminOp::AddSubnetRouter {
            network,
            public_key,
            subnet,
            virt_subnet,
            nat,
        } => {
            let req = AddSubnetRouterRequest {
                network,
                public_key,
                subnet,
                virt_subnet,
                use_nat: nat,
            };
            call::<_, NetworkPeer>(&conn, "addSubnetRouter", &req).await?
        }
        AdminOp::DeleteSubnetRouter {
            network,
            public_key,
        } => {
            let req = DeleteSubnetRouterRequest {
                network,
                public_key,
            };
            call::<_, NetworkPeer>(&conn, "deleteSubnetRouter", &req).await?
        }
        AdminOp::ListNetworks => {
            call::<_, ListNetworksResponse>(&conn, "listNetworks", &Empty {}).await?
        }
    }

    conn.drain().await;
    Ok(())
}

/// Send one admin request and print the answer as JSON.
async fn call<Req, Resp>(
    conn: &RemoteConnection,
    op: &str,
    req: &Req,
) -> Result<(), Box<dyn std::error::Error>>
where
    Req: Serialize + Sync,
    Resp: Serialize + DeserializeOwned,
{
    let reply: Reply<Resp> =
        request_json(conn, &admin_subject(op), req, Duration::from_secs(10)).await?;
    let resp = reply.into_result()?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

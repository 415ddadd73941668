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

//! One task per network, so events for a network apply in order while
//! networks progress independently.

use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info_span};

use wiremesh_store::KvStore;
use wiremesh_types::proto::UpdatePortsRequest;
use wiremesh_types::{DirectUpdate, Network, NetworkEvent};

use crate::firewall::Firewall;
use crate::netlink::Platform;
use crate::reconcile::{Outcome, Reconciler};

#[derive(Debug)]
pub enum Command {
    /// Bring the network up from a snapshot.
    Start(Network),
    Event(NetworkEvent),
    Direct(DirectUpdate),
    /// Replace the snapshot with a fresh one from the server.
    Resync(Network),
    /// Remove the interface but keep the local record, then stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Sent from actors back to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Ports(UpdatePortsRequest),
    /// The actor tore its network down and exited.
    Removed { network: String, actor: u64 },
}

#[derive(Debug, Clone)]
pub struct ActorHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl ActorHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hands the command back if the actor has exited.
    pub fn send(&self, command: Command) -> Result<(), Command> {
        self.tx.send(command).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn spawn<P, F, S>(
    id: u64,
    reconciler: Reconciler<P, F, S>,
    reports: mpsc::UnboundedSender<Report>,
    network: &str,
) -> ActorHandle
where
    P: Platform,
    F: Firewall,
    S: KvStore,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let span = info_span!("network", name = network, actor = id);
    tokio::spawn(run(id, network.to_string(), reconciler, rx, reports).instrument(span));
    ActorHandle { id, tx }
}

async fn run<P, F, S>(
    id: u64,
    network: String,
    mut reconciler: Reconciler<P, F, S>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    reports: mpsc::UnboundedSender<Report>,
) where
    P: Platform,
    F: Firewall,
    S: KvStore,
{
    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Start(snapshot) | Command::Resync(snapshot) => reconciler.sync(snapshot).await,
            Command::Event(event) => reconciler.apply_event(event).await,
            Command::Direct(update) => reconciler.apply_direct(update).await,
            Command::Shutdown { done } => {
                reconciler.teardown(false).await;
                let _ = done.send(());
                break;
            }
        };

        match result {
            Ok(Outcome::Applied) => {}
            Ok(Outcome::Report(req)) => {
                let _ = reports.send(Report::Ports(req));
            }
            Ok(Outcome::Removed) => {
                let _ = reports.send(Report::Removed {
                    network: network.clone(),
                    actor: id,
                });
                break;
            }
            Err(e) => error!(error = %e, "reconciliation failed, keeping previous state"),
        }
    }
    debug!("network actor stopped");
}

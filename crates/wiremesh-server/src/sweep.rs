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

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use wiremesh_store::KvStore;

use crate::authority::Authority;

/// Periodically mark peers that stopped checking in as disconnected.
pub async fn run<S: KvStore>(
    authority: Arc<Authority<S>>,
    interval: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
        warn!(?stale_after, "stale threshold out of range, sweep disabled");
        return;
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match authority.sweep_stale(Utc::now(), stale_after).await {
                    Ok(0) => {}
                    Ok(swept) => debug!(swept, "stale sweep complete"),
                    Err(e) => error!(error = %e, "stale sweep failed"),
                }
            }
        }
    }
}

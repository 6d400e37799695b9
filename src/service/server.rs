// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::decoder::CommandDecoder;
use crate::network::SharedEngine;
use crate::transport::TransportDriver;
use crate::{AppError, AppResult};

use super::{NetworkConfig, Shutdown};

/// Drives a [`SharedEngine`] from the tokio runtime.
///
/// On every tick the engine is drained on the blocking pool until the transport goes idle
/// or the per-tick frame budget is spent, so a chatty peer cannot starve the runtime.
#[derive(Debug)]
pub struct Server<T, D> {
    engine: SharedEngine<T, D>,
    poll_interval: Duration,
    max_drain_per_tick: usize,
    report_interval: Option<Duration>,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<T, D> Server<T, D>
where
    T: TransportDriver + Send + 'static,
    D: CommandDecoder + Send + 'static,
{
    pub fn new(
        engine: SharedEngine<T, D>,
        network: &NetworkConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Server {
            engine,
            poll_interval: Duration::from_millis(network.poll_interval_ms.max(1)),
            max_drain_per_tick: network.max_drain_per_tick.max(1),
            report_interval: (network.report_interval_secs > 0)
                .then(|| Duration::from_secs(network.report_interval_secs)),
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Polls the engine until the shutdown signal arrives.
    ///
    /// Returns an error only when a drain task panicked.
    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = time::interval(self.report_interval.unwrap_or(Duration::from_secs(3600)));
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "engine loop started, polling every {:?}",
            self.poll_interval
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("engine loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let engine = self.engine.clone();
                    let budget = self.max_drain_per_tick;
                    let handled = tokio::task::spawn_blocking(move || engine.drain(budget))
                        .await
                        .map_err(|e| AppError::IllegalStateError(format!("engine drain task failed: {}", e)))?;
                    if handled > 0 {
                        trace!("handled {} receives in this tick", handled);
                    }
                }
                _ = report.tick(), if self.report_interval.is_some() => {
                    let stats = self.engine.stats();
                    info!(
                        active_sessions = self.engine.active_sessions(),
                        frames = stats.frames_dispatched,
                        responses = stats.responses_sent,
                        corrupt = stats.corrupt_frames,
                        closed = stats.sessions_closed,
                        "session report"
                    );
                }
            }
        }
        debug!("engine loop exited");
        Ok(())
    }
}

impl<T, D> Drop for Server<T, D> {
    fn drop(&mut self) {
        debug!("engine server dropped");
    }
}

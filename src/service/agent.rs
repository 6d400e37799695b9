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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::{Handle, Runtime};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::decoder::{MemoryMapDecoder, SharedRegion};
use crate::network::{ProtocolEngine, SharedEngine, NET_DISCOVERY};
use crate::transport::{TcpTransport, TransportDriver, UdpTransport};
use crate::{AppError, AppResult};

use super::{AgentConfig, Server, Shutdown, TransportKind};

type DynTransport = Box<dyn TransportDriver + Send>;

/// The monitoring agent: one transport, one engine, and the variable region it exposes.
///
/// The first four bytes of the region hold the agent uptime in seconds (big endian) so a
/// remote tool can check the link right after connecting.
pub struct Agent {
    config: AgentConfig,
    region: SharedRegion,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let region = Arc::new(RwLock::new(vec![0u8; config.general.region_size]));
        Agent { config, region }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Region served to remote tools, the host application may write its variables here.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    fn bind_address(&self) -> AppResult<SocketAddr> {
        let network = &self.config.network;
        let address = format!("{}:{}", network.ip, network.port);
        address
            .parse()
            .map_err(|e| AppError::InvalidValue(format!("listen address {}: {}", address, e)))
    }

    fn build_transport(&self, runtime: Handle) -> AppResult<DynTransport> {
        let bind_address = self.bind_address()?;
        let engine = &self.config.engine;
        let transport: DynTransport = match self.config.network.transport {
            TransportKind::Tcp => Box::new(
                TcpTransport::new(bind_address, engine.max_sessions, engine.discovery_enabled, runtime)
                    .with_send_timeout(Duration::from_millis(self.config.network.send_timeout_ms)),
            ),
            TransportKind::Udp => Box::new(UdpTransport::new(
                bind_address,
                engine.discovery_enabled.then_some(NET_DISCOVERY),
                runtime,
            )),
        };
        info!(
            "{:?} transport binding to {}",
            self.config.network.transport, bind_address
        );
        Ok(transport)
    }

    /// Builds the engine and runs it on `rt` until ctrl-c, then waits for every task to stop.
    pub fn start(&mut self, rt: &Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let decoder = MemoryMapDecoder::new(
            self.region.clone(),
            self.config.engine.application_name.clone(),
        );
        let transport = self.build_transport(rt.handle().clone())?;
        let mut engine = ProtocolEngine::new(self.config.engine.clone(), transport, decoder);
        if let Err(err) = engine.init() {
            error!("failed to initialize transport: {}", err);
            return Err(err);
        }
        let engine = SharedEngine::new(engine);

        rt.spawn(run_uptime_counter(
            self.region.clone(),
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx.clone(),
        ));

        let server = Server::new(
            engine,
            &self.config.network,
            notify_shutdown.clone(),
            shutdown_complete_tx,
        );
        rt.block_on(async {
            tokio::select! {
                res = server.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "engine loop failed");
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("get shutdown signal");
                }
            }
        });

        // receivers may already be gone, that is fine
        let _ = notify_shutdown.send(());
        drop(server);
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("agent shutdown complete");
        Ok(())
    }
}

async fn run_uptime_counter(
    region: SharedRegion,
    mut shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    while !shutdown.is_shutdown() {
        tokio::select! {
            _ = ticker.tick() => {
                let seconds = started.elapsed().as_secs().min(u32::MAX as u64) as u32;
                let mut region = region.write();
                if let Some(slot) = region.get_mut(0..4) {
                    slot.copy_from_slice(&seconds.to_be_bytes());
                }
            }
            _ = shutdown.recv() => {}
        }
    }
    debug!("uptime counter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_from_config() {
        let mut config = AgentConfig::default();
        config.network.ip = "127.0.0.1".to_string();
        config.network.port = 4000;
        let agent = Agent::new(config);
        assert_eq!(agent.bind_address().unwrap(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(agent.region().read().len(), 1024);
    }

    #[test]
    fn test_bad_ip_is_rejected() {
        let mut config = AgentConfig::default();
        config.network.ip = "not-an-ip".to_string();
        let agent = Agent::new(config);
        assert!(matches!(agent.bind_address(), Err(AppError::InvalidValue(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_counter_writes_region() {
        let region: SharedRegion = Arc::new(RwLock::new(vec![0u8; 8]));
        let (notify, _) = broadcast::channel(1);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(run_uptime_counter(
            region.clone(),
            Shutdown::new(notify.subscribe()),
            done_tx,
        ));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let uptime = u32::from_be_bytes(region.read()[0..4].try_into().unwrap());
        assert!(uptime >= 2);

        notify.send(()).unwrap();
        task.await.unwrap();
        assert!(done_rx.recv().await.is_none());
    }
}

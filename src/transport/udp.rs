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

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{Capabilities, RecvOutcome, TransportDriver};
use crate::network::{PeerAddress, FRAME_HEADER_LEN};

const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Connectionless driver on a single tokio socket.
///
/// Every peer shares the socket, so closing a session releases nothing here. A datagram
/// carrying the discovery command is flagged as broadcast, since the destination address
/// of a received datagram is not portably observable. Like [`super::TcpTransport`] it is
/// driven from blocking code only.
#[derive(Debug)]
pub struct UdpTransport {
    bind_address: SocketAddr,
    runtime: Handle,
    socket: Option<UdpSocket>,
    discovery_code: Option<u8>,
}

impl UdpTransport {
    pub fn new(bind_address: SocketAddr, discovery_code: Option<u8>, runtime: Handle) -> Self {
        UdpTransport {
            bind_address,
            runtime,
            socket: None,
            discovery_code,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn is_discovery(&self, datagram: &[u8]) -> bool {
        match self.discovery_code {
            Some(code) => datagram.len() >= FRAME_HEADER_LEN && datagram[3] == code,
            None => false,
        }
    }
}

impl TransportDriver for UdpTransport {
    fn init(&mut self) -> io::Result<()> {
        let _runtime = self.runtime.enter();
        let socket = std::net::UdpSocket::bind(self.bind_address)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let socket = UdpSocket::from_std(socket)?;
        debug!("udp transport bound to {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    fn poll(&mut self) {}

    fn recv(&mut self, buffer: &mut [u8]) -> RecvOutcome {
        let Some(socket) = &self.socket else {
            return RecvOutcome::Idle;
        };
        match socket.try_recv_from(buffer) {
            Ok((0, _)) => RecvOutcome::Idle,
            Ok((len, remote)) => {
                trace!("udp datagram of {} bytes from {}", len, remote);
                RecvOutcome::Received {
                    len,
                    from: PeerAddress::from(remote),
                    broadcast: self.is_discovery(&buffer[..len]),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                RecvOutcome::Idle
            }
            Err(e) => {
                // ICMP unreachable and similar, not attributable to a peer
                debug!("udp receive error: {}", e);
                RecvOutcome::Idle
            }
        }
    }

    fn send(&mut self, address: &PeerAddress, buffer: &[u8]) -> io::Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "udp transport not initialized"))?;
        let target = address
            .to_socket_addr()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid peer address"))?;
        match socket.try_send_to(buffer, target) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => self
                .runtime
                .block_on(async { timeout(SEND_TIMEOUT, socket.send_to(buffer, target)).await })
                .map_err(|_| io::Error::new(ErrorKind::TimedOut, "udp send timed out"))?,
            sent => sent,
        }
    }

    fn close(&mut self, _address: &PeerAddress) {}

    fn capabilities(&self) -> Capabilities {
        Capabilities::DATAGRAM
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_datagram_exchange() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), Some(0xC2), rt.handle().clone());
        transport.init().unwrap();
        let server = transport.local_addr().unwrap();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(&[0, 7, 1, 0xC2, 0, 0, 0], server).unwrap();

        let mut buffer = [0u8; 32];
        let mut outcome = RecvOutcome::Idle;
        for _ in 0..500 {
            outcome = transport.recv(&mut buffer);
            if outcome != RecvOutcome::Idle {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let from = PeerAddress::from(client.local_addr().unwrap());
        assert_eq!(
            outcome,
            RecvOutcome::Received {
                len: 7,
                from,
                broadcast: true
            }
        );

        assert_eq!(transport.send(&from, &[4, 2]).unwrap(), 2);
        let mut reply = [0u8; 8];
        let (n, _) = client.recv_from(&mut reply).unwrap();
        assert_eq!(&reply[..n], &[4, 2]);
    }
}

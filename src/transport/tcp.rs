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

use std::future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{Capabilities, RecvOutcome, TransportDriver};
use crate::network::PeerAddress;

#[derive(Debug, Default)]
struct TcpSlot {
    stream: Option<TcpStream>,
    address: PeerAddress,
    receive_pending: bool,
}

impl TcpSlot {
    /// Drops the connection, which closes the socket.
    fn reset(&mut self) {
        self.stream = None;
        self.address = PeerAddress::default();
        self.receive_pending = false;
    }
}

/// UDP socket on the listening port answering discovery broadcasts.
#[derive(Debug)]
struct DiscoverySlot {
    socket: UdpSocket,
    /// sender of the last broadcast
    last_peer: PeerAddress,
    /// set while the datagram just received still waits for its answer
    reply_pending: bool,
    receive_pending: bool,
}

/// TCP driver with a fixed number of connection slots, built on tokio sockets.
///
/// A connection is only accepted while a slot is free, further clients wait in the
/// listen backlog. With discovery enabled a UDP socket bound to the same port receives
/// broadcasts, it is never closed by the engine.
///
/// The driver is called from blocking code: it uses the non-blocking `try_*` socket calls
/// and enters the runtime through `runtime` only to accept and to wait for send space.
/// It must not be polled from inside an async task.
#[derive(Debug)]
pub struct TcpTransport {
    bind_address: SocketAddr,
    runtime: Handle,
    listener: Option<TcpListener>,
    discovery_enabled: bool,
    discovery: Option<DiscoverySlot>,
    slots: Vec<TcpSlot>,
    send_timeout: Duration,
}

impl TcpTransport {
    pub fn new(bind_address: SocketAddr, max_connections: usize, discovery_enabled: bool, runtime: Handle) -> Self {
        TcpTransport {
            bind_address,
            runtime,
            listener: None,
            discovery_enabled,
            discovery: None,
            slots: (0..max_connections).map(|_| TcpSlot::default()).collect(),
            send_timeout: Duration::from_millis(500),
        }
    }

    /// Bounds the time a send waits for socket buffer space.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Address the listener is bound to, available after `init`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn connection_count(&self) -> usize {
        self.slots.iter().filter(|s| s.stream.is_some()).count()
    }

    fn any_pending(&self) -> bool {
        self.discovery.as_ref().is_some_and(|d| d.receive_pending)
            || self.slots.iter().any(|s| s.stream.is_some() && s.receive_pending)
    }

    fn accept(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let Some(slot) = self.slots.iter_mut().find(|s| s.stream.is_none()) else {
            return;
        };
        // a single poll of the listener, a pending accept is simply retried next time
        let accepted = self
            .runtime
            .block_on(future::poll_fn(|cx| Poll::Ready(listener.poll_accept(cx))));
        match accepted {
            Poll::Ready(Ok((stream, remote))) => {
                let _ = stream.set_nodelay(true);
                slot.address = PeerAddress::from(remote);
                slot.stream = Some(stream);
                slot.receive_pending = false;
                debug!("accepted tcp connection from {}", remote);
            }
            Poll::Ready(Err(e)) => warn!("tcp accept error: {}", e),
            Poll::Pending => {}
        }
    }

    fn recv_discovery(&mut self, buffer: &mut [u8]) -> Option<RecvOutcome> {
        let discovery = self.discovery.as_mut()?;
        if !discovery.receive_pending {
            return None;
        }
        match discovery.socket.try_recv_from(buffer) {
            Ok((0, _)) => {
                discovery.receive_pending = false;
                None
            }
            Ok((len, remote)) => {
                discovery.last_peer = PeerAddress::from(remote);
                discovery.reply_pending = true;
                trace!("discovery datagram of {} bytes from {}", len, remote);
                Some(RecvOutcome::Received {
                    len,
                    from: discovery.last_peer,
                    broadcast: true,
                })
            }
            Err(e) => {
                if e.kind() != ErrorKind::WouldBlock {
                    debug!("discovery socket receive error: {}", e);
                }
                discovery.receive_pending = false;
                None
            }
        }
    }

    /// Writes what the socket takes, waiting up to `send_timeout` for buffer space.
    fn write_bounded(runtime: &Handle, stream: &TcpStream, buffer: &[u8], send_timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + send_timeout;
        loop {
            match stream.try_write(buffer) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    runtime
                        .block_on(async { timeout(remaining, stream.writable()).await })
                        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "tcp send timed out"))??;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl TransportDriver for TcpTransport {
    fn init(&mut self) -> io::Result<()> {
        let _runtime = self.runtime.enter();
        let listener = std::net::TcpListener::bind(self.bind_address)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local = listener.local_addr()?;
        debug!("tcp transport listening on {}", local);

        if self.discovery_enabled {
            let socket = std::net::UdpSocket::bind(SocketAddr::new(self.bind_address.ip(), local.port()))?;
            socket.set_nonblocking(true)?;
            socket.set_broadcast(true)?;
            self.discovery = Some(DiscoverySlot {
                socket: UdpSocket::from_std(socket)?,
                last_peer: PeerAddress::default(),
                reply_pending: false,
                receive_pending: false,
            });
        }
        self.listener = Some(listener);
        Ok(())
    }

    fn poll(&mut self) {
        // sockets that signalled data are drained first
        if self.any_pending() {
            return;
        }

        self.accept();

        if let Some(discovery) = self.discovery.as_mut() {
            discovery.receive_pending = true;
        }
        for slot in self.slots.iter_mut().filter(|s| s.stream.is_some()) {
            slot.receive_pending = true;
        }
    }

    fn recv(&mut self, buffer: &mut [u8]) -> RecvOutcome {
        if self.listener.is_none() {
            return RecvOutcome::Idle;
        }
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.reply_pending = false;
        }
        if let Some(outcome) = self.recv_discovery(buffer) {
            return outcome;
        }

        for slot in self.slots.iter_mut() {
            if !slot.receive_pending {
                continue;
            }
            let Some(stream) = slot.stream.as_ref() else {
                slot.receive_pending = false;
                continue;
            };
            match stream.try_read(buffer) {
                Ok(0) => {
                    // orderly shutdown by the peer, the slot is free for the next client
                    let from = slot.address;
                    debug!("tcp peer {} closed the connection", from);
                    slot.reset();
                    return RecvOutcome::Failed { from };
                }
                Ok(len) => {
                    return RecvOutcome::Received {
                        len,
                        from: slot.address,
                        broadcast: false,
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    slot.receive_pending = false;
                }
                Err(e) => {
                    let from = slot.address;
                    debug!("tcp receive error from {}: {}", from, e);
                    slot.reset();
                    return RecvOutcome::Failed { from };
                }
            }
        }
        RecvOutcome::Idle
    }

    fn send(&mut self, address: &PeerAddress, buffer: &[u8]) -> io::Result<usize> {
        if let Some(discovery) = self.discovery.as_mut() {
            if discovery.reply_pending && discovery.last_peer == *address {
                discovery.reply_pending = false;
                discovery.receive_pending = false;
                let target = address
                    .to_socket_addr()
                    .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid peer address"))?;
                return discovery.socket.try_send_to(buffer, target);
            }
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.stream.is_some() && s.address == *address)
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "no connection for peer"))?;
        slot.receive_pending = false;
        match slot.stream.as_ref() {
            Some(stream) => Self::write_bounded(&self.runtime, stream, buffer, self.send_timeout),
            None => Err(io::Error::new(ErrorKind::NotConnected, "no connection for peer")),
        }
    }

    fn close(&mut self, address: &PeerAddress) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.stream.is_some() && s.address == *address)
        {
            debug!("closing tcp connection of {}", address);
            slot.reset();
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STREAM
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use tokio::runtime::Runtime;

    use super::*;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn poll_until_received(transport: &mut TcpTransport, buffer: &mut [u8]) -> RecvOutcome {
        for _ in 0..500 {
            transport.poll();
            let outcome = transport.recv(buffer);
            if outcome != RecvOutcome::Idle {
                return outcome;
            }
            thread::sleep(Duration::from_millis(2));
        }
        RecvOutcome::Idle
    }

    #[test]
    fn test_accept_receive_and_reply() {
        let rt = runtime();
        let mut transport = TcpTransport::new("127.0.0.1:0".parse().unwrap(), 2, false, rt.handle().clone());
        transport.init().unwrap();
        let server = transport.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(server).unwrap();
        client.write_all(&[1, 2, 3]).unwrap();

        let mut buffer = [0u8; 16];
        let outcome = poll_until_received(&mut transport, &mut buffer);
        let RecvOutcome::Received { len, from, broadcast } = outcome else {
            panic!("expected data, got {:?}", outcome);
        };
        assert_eq!(&buffer[..len], &[1, 2, 3][..len]);
        assert!(!broadcast);
        assert_eq!(from, PeerAddress::from(client.local_addr().unwrap()));

        assert_eq!(transport.send(&from, &[9, 9]).unwrap(), 2);
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [9, 9]);

        transport.close(&from);
        assert_eq!(transport.connection_count(), 0);
        assert!(transport.send(&from, &[1]).is_err());
    }

    #[test]
    fn test_peer_close_frees_slot() {
        let rt = runtime();
        let mut transport = TcpTransport::new("127.0.0.1:0".parse().unwrap(), 1, false, rt.handle().clone());
        transport.init().unwrap();
        let server = transport.local_addr().unwrap();

        // connects and leaves without sending anything
        let quiet = std::net::TcpStream::connect(server).unwrap();
        let expected = PeerAddress::from(quiet.local_addr().unwrap());
        drop(quiet);

        let mut buffer = [0u8; 16];
        assert_eq!(
            poll_until_received(&mut transport, &mut buffer),
            RecvOutcome::Failed { from: expected }
        );
        assert_eq!(transport.connection_count(), 0);
        for _ in 0..10 {
            transport.poll();
            assert_eq!(transport.recv(&mut buffer), RecvOutcome::Idle);
        }

        // the only slot is free again for the next client
        let mut next = std::net::TcpStream::connect(server).unwrap();
        next.write_all(&[7]).unwrap();
        let outcome = poll_until_received(&mut transport, &mut buffer);
        assert_eq!(
            outcome,
            RecvOutcome::Received {
                len: 1,
                from: PeerAddress::from(next.local_addr().unwrap()),
                broadcast: false
            }
        );
    }

    #[test]
    fn test_discovery_reply_leaves_by_udp_only_once() {
        let rt = runtime();
        let mut transport = TcpTransport::new("127.0.0.1:0".parse().unwrap(), 1, true, rt.handle().clone());
        transport.init().unwrap();
        let server = transport.local_addr().unwrap();

        let tool = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        tool.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        tool.send_to(&[0, 7, 1, 0xC2, 0, 0, 0], server).unwrap();

        let mut buffer = [0u8; 32];
        let outcome = poll_until_received(&mut transport, &mut buffer);
        let RecvOutcome::Received { from, broadcast, .. } = outcome else {
            panic!("expected a datagram, got {:?}", outcome);
        };
        assert!(broadcast);
        assert_eq!(transport.send(&from, &[1, 2]).unwrap(), 2);
        let mut reply = [0u8; 8];
        let (n, _) = tool.recv_from(&mut reply).unwrap();
        assert_eq!(&reply[..n], &[1, 2]);

        // the answer has been sent, the same address is no longer routed to the udp socket
        assert_eq!(
            transport.send(&from, &[3]).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }
}

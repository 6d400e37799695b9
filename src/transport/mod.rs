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

//! Transport drivers
//!
//! A transport driver moves raw bytes between the protocol engine and a concrete medium.
//! The engine never blocks on its own, every wait happens inside a driver's `poll`.
//!
//! # Components
//!
//! - `TransportDriver`: the primitives the engine relies on
//! - `TcpTransport`: stream sockets, one per peer, plus an optional UDP discovery socket
//! - `UdpTransport`: a single datagram socket shared by all peers
//! - `MemoryTransport`: scripted in-memory driver for tests and simulations

use std::io;
use std::ops::{BitOr, BitOrAssign};

use crate::network::PeerAddress;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

mod memory;
mod tcp;
mod udp;

/// Capability flags advertised by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// connection oriented byte stream
    pub const STREAM: Capabilities = Capabilities(0x01);
    /// connectionless datagrams
    pub const DATAGRAM: Capabilities = Capabilities(0x02);

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Result of a single receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// nothing pending
    Idle,
    /// `len` bytes were written to the start of the buffer
    Received {
        len: usize,
        from: PeerAddress,
        broadcast: bool,
    },
    /// the peer closed its side or the read failed
    Failed { from: PeerAddress },
}

/// Raw byte transport over one medium.
pub trait TransportDriver {
    fn init(&mut self) -> io::Result<()>;

    /// Advances accept and ready-state bookkeeping, bounded by the driver's own timeout.
    fn poll(&mut self);

    fn recv(&mut self, buffer: &mut [u8]) -> RecvOutcome;

    /// Sends a prefix of `buffer` to `address` and returns how much went out.
    fn send(&mut self, address: &PeerAddress, buffer: &[u8]) -> io::Result<usize>;

    /// Releases whatever the driver holds for `address`.
    fn close(&mut self, address: &PeerAddress);

    fn capabilities(&self) -> Capabilities;
}

impl<T: TransportDriver + ?Sized> TransportDriver for Box<T> {
    fn init(&mut self) -> io::Result<()> {
        (**self).init()
    }

    fn poll(&mut self) {
        (**self).poll()
    }

    fn recv(&mut self, buffer: &mut [u8]) -> RecvOutcome {
        (**self).recv(buffer)
    }

    fn send(&mut self, address: &PeerAddress, buffer: &[u8]) -> io::Result<usize> {
        (**self).send(address, buffer)
    }

    fn close(&mut self, address: &PeerAddress) {
        (**self).close(address)
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::STREAM | Capabilities::DATAGRAM;
        assert!(caps.contains(Capabilities::STREAM));
        assert!(caps.contains(Capabilities::DATAGRAM));
        assert!(!Capabilities::STREAM.contains(Capabilities::DATAGRAM));
        assert!(!caps.contains(Capabilities::NONE));
    }
}

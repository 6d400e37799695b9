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

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AddressFamily {
    /// zeroed or malformed address
    #[default]
    Invalid = 0,
    V4 = 4,
    V6 = 6,
}

/// Canonical peer address used as the session key.
///
/// The value has a fixed size: the family tag, sixteen address bytes (a v4 address only
/// uses the first four, the rest stay zero) and the port. Two addresses are equal when all
/// of these bytes are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddress {
    family: AddressFamily,
    octets: [u8; 16],
    port: u16,
}

impl PeerAddress {
    /// Normalizes a raw transport address given as family tag, address bytes and port.
    ///
    /// Anything that is not a 4-byte v4 or a 16-byte v6 address yields the zeroed address.
    pub fn normalize(family: AddressFamily, bytes: &[u8], port: u16) -> PeerAddress {
        let expected = match family {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
            AddressFamily::Invalid => return PeerAddress::default(),
        };
        if bytes.len() != expected {
            return PeerAddress::default();
        }
        let mut octets = [0u8; 16];
        octets[..expected].copy_from_slice(bytes);
        PeerAddress {
            family,
            octets,
            port,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_valid(&self) -> bool {
        self.family != AddressFamily::Invalid
    }

    /// Converts back into a socket address, `None` for the zeroed address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family {
            AddressFamily::V4 => {
                let ip = Ipv4Addr::new(self.octets[0], self.octets[1], self.octets[2], self.octets[3]);
                Some(SocketAddr::new(IpAddr::V4(ip), self.port))
            }
            AddressFamily::V6 => Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(self.octets)),
                self.port,
            )),
            AddressFamily::Invalid => None,
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => PeerAddress::normalize(AddressFamily::V4, &ip.octets(), addr.port()),
            IpAddr::V6(ip) => PeerAddress::normalize(AddressFamily::V6, &ip.octets(), addr.port()),
        }
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "<invalid>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_v4() {
        let addr = PeerAddress::normalize(AddressFamily::V4, &[192, 168, 1, 7], 3344);
        assert!(addr.is_valid());
        assert_eq!(addr.port(), 3344);
        assert_eq!(
            addr.to_socket_addr(),
            Some("192.168.1.7:3344".parse().unwrap())
        );
    }

    #[test]
    fn test_socket_addr_equality() {
        let a: PeerAddress = "10.0.0.1:5000".parse::<SocketAddr>().unwrap().into();
        let b: PeerAddress = "10.0.0.1:5000".parse::<SocketAddr>().unwrap().into();
        let c: PeerAddress = "10.0.0.1:5001".parse::<SocketAddr>().unwrap().into();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_v6_round_trip() {
        let raw: SocketAddr = "[fe80::1]:8080".parse().unwrap();
        let addr = PeerAddress::from(raw);
        assert_eq!(addr.family(), AddressFamily::V6);
        assert_eq!(addr.to_socket_addr(), Some(raw));
    }

    #[test]
    fn test_malformed_is_zeroed() {
        let addr = PeerAddress::normalize(AddressFamily::V4, &[1, 2, 3], 80);
        assert_eq!(addr, PeerAddress::default());
        assert!(!addr.is_valid());
        assert_eq!(addr.to_string(), "<invalid>");
        assert_eq!(
            PeerAddress::normalize(AddressFamily::Invalid, &[1, 2, 3, 4], 80),
            PeerAddress::default()
        );
    }
}

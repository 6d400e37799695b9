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

use std::collections::{HashSet, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Capabilities, RecvOutcome, TransportDriver};
use crate::network::PeerAddress;

#[derive(Debug)]
enum Inbound {
    Data {
        from: PeerAddress,
        bytes: Vec<u8>,
        broadcast: bool,
    },
    Failure {
        from: PeerAddress,
    },
}

#[derive(Debug, Default)]
struct MemoryInner {
    inbox: VecDeque<Inbound>,
    sent: Vec<(PeerAddress, Vec<u8>)>,
    closed: Vec<PeerAddress>,
    failing_peers: HashSet<PeerAddress>,
    send_chunk: Option<usize>,
    initialized: bool,
}

/// Scripted in-memory transport.
///
/// Clones share the same state, so a test keeps one handle to feed inbound bytes and
/// inspect what the engine sent while the engine owns the other.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
    capabilities: Capabilities,
}

impl MemoryTransport {
    pub fn new(capabilities: Capabilities) -> Self {
        MemoryTransport {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            capabilities,
        }
    }

    /// Queues bytes from `from`; a chunk bigger than the receive buffer is handed out in
    /// several reads like a stream would.
    pub fn push(&self, from: PeerAddress, bytes: &[u8]) {
        self.inner.lock().inbox.push_back(Inbound::Data {
            from,
            bytes: bytes.to_vec(),
            broadcast: false,
        });
    }

    pub fn push_broadcast(&self, from: PeerAddress, bytes: &[u8]) {
        self.inner.lock().inbox.push_back(Inbound::Data {
            from,
            bytes: bytes.to_vec(),
            broadcast: true,
        });
    }

    /// Queues a receive failure, as if `from` had disconnected.
    pub fn push_failure(&self, from: PeerAddress) {
        self.inner.lock().inbox.push_back(Inbound::Failure { from });
    }

    /// Makes every later send to `address` fail.
    pub fn fail_sends_to(&self, address: PeerAddress) {
        self.inner.lock().failing_peers.insert(address);
    }

    /// Limits how many bytes a single send call accepts.
    pub fn set_send_chunk(&self, chunk: usize) {
        self.inner.lock().send_chunk = Some(chunk.max(1));
    }

    /// Removes and concatenates everything sent to `address` so far.
    pub fn take_sent_to(&self, address: &PeerAddress) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let mut bytes = Vec::new();
        inner.sent.retain(|(to, chunk)| {
            if to == address {
                bytes.extend_from_slice(chunk);
                false
            } else {
                true
            }
        });
        bytes
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().sent.len()
    }

    pub fn closed(&self) -> Vec<PeerAddress> {
        self.inner.lock().closed.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }
}

impl TransportDriver for MemoryTransport {
    fn init(&mut self) -> io::Result<()> {
        self.inner.lock().initialized = true;
        Ok(())
    }

    fn poll(&mut self) {}

    fn recv(&mut self, buffer: &mut [u8]) -> RecvOutcome {
        let mut inner = self.inner.lock();
        match inner.inbox.pop_front() {
            None => RecvOutcome::Idle,
            Some(Inbound::Failure { from }) => RecvOutcome::Failed { from },
            Some(Inbound::Data {
                from,
                mut bytes,
                broadcast,
            }) => {
                let len = bytes.len().min(buffer.len());
                buffer[..len].copy_from_slice(&bytes[..len]);
                if len < bytes.len() {
                    let rest = bytes.split_off(len);
                    inner.inbox.push_front(Inbound::Data {
                        from,
                        bytes: rest,
                        broadcast,
                    });
                }
                if len == 0 {
                    return RecvOutcome::Idle;
                }
                RecvOutcome::Received {
                    len,
                    from,
                    broadcast,
                }
            }
        }
    }

    fn send(&mut self, address: &PeerAddress, buffer: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.failing_peers.contains(address) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "peer unreachable"));
        }
        let len = inner.send_chunk.map_or(buffer.len(), |c| c.min(buffer.len()));
        inner.sent.push((*address, buffer[..len].to_vec()));
        Ok(len)
    }

    fn close(&mut self, address: &PeerAddress) {
        self.inner.lock().closed.push(*address);
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

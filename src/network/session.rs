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

use tracing::debug;

use super::PeerAddress;
use crate::decoder::SessionContext;

/// Per-peer reassembly and response state.
///
/// The same buffer holds the request being reassembled and, once a frame is complete,
/// the response being sent, so a session is strictly half-duplex.
#[derive(Debug)]
pub struct Session {
    /// slot in the table, `None` for the ad-hoc session
    slot: Option<usize>,
    id: u32,
    /// last-used stamp, the smaller the older, zero means free
    age: u32,
    address: PeerAddress,
    pub(crate) buffer: Box<[u8]>,
    pub(crate) rx_len: usize,
    pub(crate) seq: u8,
}

impl Session {
    pub(crate) fn new(slot: Option<usize>, frame_size: usize) -> Self {
        Session {
            slot,
            id: 0,
            age: 0,
            address: PeerAddress::default(),
            buffer: vec![0u8; frame_size].into_boxed_slice(),
            rx_len: 0,
            seq: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn is_free(&self) -> bool {
        self.age == 0
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            id: self.id,
            address: self.address,
            handle: self.slot.map(SessionHandle),
        }
    }

    /// Number of bytes of a partial frame currently buffered.
    pub fn buffered(&self) -> usize {
        self.rx_len
    }

    pub(crate) fn set_address(&mut self, address: PeerAddress) {
        self.address = address;
    }

    /// Resets the session to the free state.
    ///
    /// `on_release` runs only when the session was in use, so the transport resource and any
    /// upper-layer state bound to the address get released exactly once.
    pub(crate) fn close<F: FnMut(&Session)>(&mut self, mut on_release: F) {
        if self.age > 0 {
            debug!("closing session {} of {}", self.id, self.address);
            on_release(self);
            self.address = PeerAddress::default();
        }
        self.age = 0;
        self.rx_len = 0;
        self.id = 0;
    }
}

/// Index of a slot in the [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) usize);

impl SessionHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Fixed ring of reusable session slots keyed by peer address.
#[derive(Debug)]
pub struct SessionTable {
    sessions: Vec<Session>,
    age_counter: u32,
    id_counter: u32,
}

impl SessionTable {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        SessionTable {
            sessions: (0..capacity)
                .map(|slot| Session::new(Some(slot), frame_size))
                .collect(),
            age_counter: 0,
            id_counter: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, handle: SessionHandle) -> &Session {
        &self.sessions[handle.0]
    }

    pub(crate) fn get_mut(&mut self, handle: SessionHandle) -> &mut Session {
        &mut self.sessions[handle.0]
    }

    /// Sessions currently bound to a peer.
    pub fn active(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| !s.is_free())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Looks a session up by address, optionally binding a slot to it.
    ///
    /// A hit becomes the most recently used session. On a miss with `create` set, the first
    /// free slot is taken, or else the least recently used one (first in table order on a
    /// tie); the victim is closed through `on_release` before it is rebound.
    pub fn find<F: FnMut(&Session)>(
        &mut self,
        address: &PeerAddress,
        create: bool,
        on_release: F,
    ) -> Option<SessionHandle> {
        if let Some(index) = self
            .sessions
            .iter()
            .position(|s| !s.is_free() && s.address == *address)
        {
            let age = self.next_age();
            self.sessions[index].age = age;
            return Some(SessionHandle(index));
        }

        if !create {
            return None;
        }

        let victim = self.victim()?;
        self.sessions[victim].close(on_release);

        let id = self.next_id();
        let age = self.next_age();
        let session = &mut self.sessions[victim];
        session.id = id;
        session.age = age;
        session.address = *address;
        session.rx_len = 0;
        session.seq = 0;
        debug!("session {} bound to {} in slot {}", id, address, victim);
        Some(SessionHandle(victim))
    }

    pub fn close<F: FnMut(&Session)>(&mut self, handle: SessionHandle, on_release: F) {
        self.sessions[handle.0].close(on_release);
    }

    fn victim(&self) -> Option<usize> {
        if let Some(free) = self.sessions.iter().position(Session::is_free) {
            return Some(free);
        }
        let mut oldest: Option<usize> = None;
        for (index, session) in self.sessions.iter().enumerate() {
            match oldest {
                Some(o) if self.sessions[o].age <= session.age => {}
                _ => oldest = Some(index),
            }
        }
        oldest
    }

    fn next_age(&mut self) -> u32 {
        if self.age_counter == u32::MAX {
            self.rebase_ages();
        }
        self.age_counter += 1;
        self.age_counter
    }

    fn next_id(&mut self) -> u32 {
        if self.id_counter == u32::MAX {
            self.id_counter = 0;
        }
        self.id_counter += 1;
        self.id_counter
    }

    /// Renumbers the ages of the bound sessions to `1..=n` keeping their order, so the
    /// counter restarts without ever handing out zero to a live session.
    fn rebase_ages(&mut self) {
        let mut order: Vec<usize> = (0..self.sessions.len())
            .filter(|i| !self.sessions[*i].is_free())
            .collect();
        order.sort_by_key(|i| (self.sessions[*i].age, *i));
        for (rank, index) in order.iter().enumerate() {
            self.sessions[*index].age = rank as u32 + 1;
        }
        self.age_counter = order.len() as u32;
        debug!("session ages rebased, {} sessions active", order.len());
    }

    #[cfg(test)]
    pub(crate) fn set_counters(&mut self, age: u32, id: u32) {
        self.age_counter = age;
        self.id_counter = id;
    }
}

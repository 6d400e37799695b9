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

//! Command decoding
//!
//! The protocol engine hands every frame it does not handle itself to a
//! [`CommandDecoder`]. The decoder writes its response payload into the buffer it is
//! given and returns the status code; the engine frames and sends the response.

use bytes::BytesMut;

use crate::network::{PeerAddress, SessionHandle};

pub use memory_map::{
    MemoryMapDecoder, SharedRegion, CMD_GET_CONFIG, CMD_READ_MEM, CMD_WRITE_MEM, CMD_WRITE_MEM_MASK,
};

mod memory_map;

/// Response status codes.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const INVALID_COMMAND: u8 = 0x81;
    pub const RESPONSE_BUFFER_OVERFLOW: u8 = 0x84;
    pub const INVALID_BUFFER: u8 = 0x85;
    pub const INVALID_SIZE: u8 = 0x86;
    pub const SERVICE_BUSY: u8 = 0x87;
    pub const NOT_INITIALIZED: u8 = 0x88;
    pub const ACCESS_DENIED: u8 = 0x89;
}

/// Identifies the session a command arrived on.
///
/// Only valid for the duration of one `decode` call, the slot may be rebound to another
/// peer afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub id: u32,
    pub address: PeerAddress,
    /// `None` for the ad-hoc session serving broadcasts
    pub handle: Option<SessionHandle>,
}

#[derive(Debug)]
pub struct CommandRequest<'a> {
    pub code: u8,
    pub payload: &'a [u8],
    pub session: SessionContext,
}

pub trait CommandDecoder {
    /// Decodes one command, writes the response payload into `response` and returns the
    /// status code to send with it.
    fn decode(&mut self, request: CommandRequest<'_>, response: &mut BytesMut) -> u8;

    /// Releases state bound to a session that was just closed.
    fn session_closed(&mut self, _session: &SessionContext) {}
}

impl<D: CommandDecoder + ?Sized> CommandDecoder for Box<D> {
    fn decode(&mut self, request: CommandRequest<'_>, response: &mut BytesMut) -> u8 {
        (**self).decode(request, response)
    }

    fn session_closed(&mut self, session: &SessionContext) {
        (**self).session_closed(session)
    }
}

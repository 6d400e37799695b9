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

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::frame::encode_frame_in_place;
use super::{Frame, PeerAddress, Session, SessionHandle, SessionTable, FRAME_HEADER_LEN, FRAME_OVERHEAD};
use crate::decoder::{status, CommandDecoder, CommandRequest, SessionContext};
use crate::transport::{Capabilities, RecvOutcome, TransportDriver};
use crate::AppError::{self, Incomplete};
use crate::AppResult;

/// Answered by the engine itself with an empty OK response.
pub const NET_PING: u8 = 0xC1;
/// Answered by the engine with the identity of the device, when enabled.
pub const NET_DISCOVERY: u8 = 0xC2;
pub const DISCOVERY_VERSION: u8 = 1;
pub const PROTOCOL_TCP: u8 = 1;
pub const PROTOCOL_UDP: u8 = 2;

/// Receives above this size are treated like a receive failure.
const MAX_RECEIVE: usize = 0xFFFF;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// number of concurrent peer sessions
    pub max_sessions: usize,
    /// largest accepted `total_length`, header and checksum included
    pub max_frame_size: usize,
    pub discovery_enabled: bool,
    /// name announced in discovery responses
    pub application_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_sessions: 4,
            max_frame_size: 512 + FRAME_OVERHEAD,
            discovery_enabled: true,
            application_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl EngineConfig {
    pub fn max_payload(&self) -> usize {
        self.max_frame_size.saturating_sub(FRAME_OVERHEAD)
    }

    /// Session table capacity, one extra slot is reserved for discovery.
    pub fn table_capacity(&self) -> usize {
        self.max_sessions + usize::from(self.discovery_enabled)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_dispatched: u64,
    pub responses_sent: u64,
    pub corrupt_frames: u64,
    pub sessions_closed: u64,
    pub send_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Table(SessionHandle),
    AdHoc,
}

/// Session multiplexer driving one transport and one command decoder.
///
/// The engine is polled from an outer loop. Every call to [`ProtocolEngine::poll`] runs to
/// completion: at most one receive, at most one reassembled frame, at most one response.
#[derive(Debug)]
pub struct ProtocolEngine<T, D> {
    config: EngineConfig,
    transport: T,
    decoder: D,
    table: SessionTable,
    adhoc: Session,
    response: BytesMut,
    stats: EngineStats,
}

impl<T: TransportDriver, D: CommandDecoder> ProtocolEngine<T, D> {
    /// Builds an engine; a `max_frame_size` outside `8..=65535` is clamped into that range.
    pub fn new(mut config: EngineConfig, transport: T, decoder: D) -> Self {
        let frame_size = config.max_frame_size.clamp(FRAME_OVERHEAD + 1, u16::MAX as usize);
        if frame_size != config.max_frame_size {
            warn!(
                "max_frame_size {} out of range, using {}",
                config.max_frame_size, frame_size
            );
            config.max_frame_size = frame_size;
        }
        ProtocolEngine {
            table: SessionTable::new(config.table_capacity(), frame_size),
            adhoc: Session::new(None, frame_size),
            response: BytesMut::with_capacity(frame_size),
            stats: EngineStats::default(),
            config,
            transport,
            decoder,
        }
    }

    pub fn init(&mut self) -> AppResult<()> {
        self.transport.init()?;
        debug!(
            "protocol engine ready, {} session slots, frames up to {} bytes",
            self.table.capacity(),
            self.config.max_frame_size
        );
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Polls the transport and processes at most one frame.
    ///
    /// Returns `true` when something was received, meaning another call right away may
    /// find more work; `false` when the transport was idle.
    pub fn poll(&mut self) -> bool {
        self.transport.poll();
        self.process()
    }

    /// Sends a response on a session outside of the decode call.
    ///
    /// The context must still refer to the same session, a stale context (the slot was
    /// closed or rebound since) is rejected.
    pub fn send_response(&mut self, context: &SessionContext, payload: &[u8], status_code: u8) -> AppResult<()> {
        let target = match context.handle {
            Some(handle) => {
                if handle.index() >= self.table.capacity() {
                    return Err(AppError::InvalidValue(format!("no session slot {}", handle.index())));
                }
                let session = self.table.get(handle);
                if session.is_free() || session.id() != context.id {
                    return Err(AppError::IllegalStateError(format!(
                        "session {} is no longer open",
                        context.id
                    )));
                }
                Target::Table(handle)
            }
            None => {
                let adhoc = &self.adhoc;
                if !adhoc.address().is_valid() || *adhoc.address() != context.address || adhoc.id() != context.id {
                    return Err(AppError::IllegalStateError(format!(
                        "broadcast from {} is no longer being served",
                        context.address
                    )));
                }
                Target::AdHoc
            }
        };
        self.response.clear();
        self.response.put_slice(payload);
        self.respond(target, status_code)
    }

    fn process(&mut self) -> bool {
        self.adhoc.rx_len = 0;
        let (len, from, broadcast) = match self.transport.recv(&mut self.adhoc.buffer) {
            RecvOutcome::Idle => return false,
            RecvOutcome::Failed { from } => {
                debug!("receive from {} failed", from);
                self.close_peer(&from);
                return true;
            }
            RecvOutcome::Received { len, from, .. } if len == 0 => {
                trace!("empty receive from {}", from);
                return false;
            }
            RecvOutcome::Received { len, from, .. } if len > MAX_RECEIVE || len > self.adhoc.buffer.len() => {
                warn!("implausible receive of {} bytes from {}", len, from);
                self.close_peer(&from);
                return true;
            }
            RecvOutcome::Received {
                len,
                from,
                broadcast,
            } => (len, from, broadcast),
        };

        let target = if broadcast {
            // broadcasts are never accumulated, they are handled on the spot
            self.adhoc.set_address(from);
            self.adhoc.rx_len = len;
            Target::AdHoc
        } else {
            let Some(handle) = self.find_session(&from, true) else {
                return false;
            };
            let session = self.table.get_mut(handle);
            let buffered = session.rx_len + len;
            if buffered > session.buffer.len() {
                self.reject(Target::Table(handle), AppError::BufferOverflow(buffered));
                return true;
            }
            session.buffer[session.rx_len..buffered].copy_from_slice(&self.adhoc.buffer[..len]);
            session.rx_len = buffered;
            Target::Table(handle)
        };

        self.process_session(target);
        true
    }

    fn process_session(&mut self, target: Target) {
        let max_frame_size = self.config.max_frame_size;
        let session = match target {
            Target::Table(handle) => self.table.get_mut(handle),
            Target::AdHoc => &mut self.adhoc,
        };

        let total = match Frame::check(&session.buffer[..session.rx_len], max_frame_size) {
            Ok(total) => total,
            // partial frame, keep the bytes for the next poll
            Err(Incomplete) => return,
            Err(err) => return self.reject(target, err),
        };
        // the frame is consumed, anything behind it in the same read is dropped
        session.rx_len = 0;

        let context = session.context();
        let frame = match Frame::parse_complete(&session.buffer[..total]) {
            Ok(frame) => frame,
            Err(err) => return self.reject(target, err),
        };
        if let Err(err) = frame.validate() {
            return self.reject(target, err);
        }

        let seq = frame.header.seq;
        let code = frame.header.code;
        trace!(
            "frame seq {} code {:#04x} with {} payload bytes from {}",
            seq,
            code,
            frame.payload.len(),
            context.address
        );
        self.stats.frames_dispatched += 1;
        self.response.clear();
        let status_code = match code {
            NET_PING => status::OK,
            NET_DISCOVERY if self.config.discovery_enabled => compose_discovery(
                self.transport.capabilities(),
                &self.config.application_name,
                self.config.max_payload(),
                &mut self.response,
            ),
            _ => self.decoder.decode(
                CommandRequest {
                    code,
                    payload: frame.payload,
                    session: context,
                },
                &mut self.response,
            ),
        };
        session.seq = seq;

        // a send failure has already closed the session
        let _ = self.respond(target, status_code);
    }

    /// Frames the pending response in the session's own buffer and sends it.
    fn respond(&mut self, target: Target, status_code: u8) -> AppResult<()> {
        let max_payload = self.config.max_payload();
        let (len, status_code) = if self.response.len() > max_payload {
            let err = AppError::ResponseTooLarge {
                length: self.response.len(),
                max: max_payload,
            };
            warn!("{}, answering with an overflow status", err);
            (0, status::RESPONSE_BUFFER_OVERFLOW)
        } else {
            (self.response.len(), status_code)
        };

        let session = match target {
            Target::Table(handle) => self.table.get_mut(handle),
            Target::AdHoc => &mut self.adhoc,
        };
        session.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].copy_from_slice(&self.response[..len]);
        let total = encode_frame_in_place(&mut session.buffer, session.seq, status_code, len);

        let mut sent = 0;
        let mut failure = None;
        while sent < total {
            match self.transport.send(session.address(), &session.buffer[sent..total]) {
                Ok(n) if n > 0 && sent + n <= total => sent += n,
                Ok(n) => {
                    failure = Some(AppError::TransportError(format!(
                        "send accepted {} of {} bytes",
                        n,
                        total - sent
                    )));
                    break;
                }
                Err(e) => {
                    failure = Some(AppError::TransportError(e.to_string()));
                    break;
                }
            }
        }

        match failure {
            None => {
                self.stats.responses_sent += 1;
                Ok(())
            }
            Some(err) => {
                warn!("send to {} failed: {}", session.address(), err);
                self.stats.send_errors += 1;
                if err.closes_session() {
                    self.close(target);
                }
                Err(err)
            }
        }
    }

    fn find_session(&mut self, address: &PeerAddress, create: bool) -> Option<SessionHandle> {
        let transport = &mut self.transport;
        let decoder = &mut self.decoder;
        let stats = &mut self.stats;
        self.table.find(address, create, |session| {
            release(&mut *transport, &mut *decoder, session);
            stats.sessions_closed += 1;
        })
    }

    /// Closes the session of a peer whose receive failed.
    ///
    /// A peer without a session still gets its transport resources released.
    fn close_peer(&mut self, address: &PeerAddress) {
        match self.find_session(address, false) {
            Some(handle) => self.close(Target::Table(handle)),
            None => self.transport.close(address),
        }
    }

    /// Counts a malformed frame and closes its session when the error is session fatal.
    fn reject(&mut self, target: Target, err: AppError) {
        let session = match target {
            Target::Table(handle) => self.table.get(handle),
            Target::AdHoc => &self.adhoc,
        };
        warn!("session {} of {}: {}", session.id(), session.address(), err);
        self.stats.corrupt_frames += 1;
        if err.closes_session() {
            self.close(target);
        }
    }

    fn close(&mut self, target: Target) {
        let transport = &mut self.transport;
        let decoder = &mut self.decoder;
        let stats = &mut self.stats;
        let on_release = |session: &Session| {
            release(&mut *transport, &mut *decoder, session);
            stats.sessions_closed += 1;
        };
        match target {
            Target::Table(handle) => self.table.close(handle, on_release),
            Target::AdHoc => self.adhoc.close(on_release),
        }
    }
}

fn release<T: TransportDriver, D: CommandDecoder>(transport: &mut T, decoder: &mut D, session: &Session) {
    transport.close(session.address());
    decoder.session_closed(&session.context());
}

/// Writes the discovery answer: version, protocol family, name length and the name.
///
/// The name carries a terminating zero when it fits, otherwise it is trimmed to the
/// space left in the payload.
fn compose_discovery(capabilities: Capabilities, name: &str, max_payload: usize, out: &mut BytesMut) -> u8 {
    let protocol = if capabilities.contains(Capabilities::DATAGRAM) {
        PROTOCOL_UDP
    } else if capabilities.contains(Capabilities::STREAM) {
        PROTOCOL_TCP
    } else {
        0
    };
    let name = name.as_bytes();
    let room = max_payload.saturating_sub(4);

    out.put_u8(DISCOVERY_VERSION);
    out.put_u8(protocol);
    if name.len() <= room && name.len() < u8::MAX as usize {
        out.put_u8(name.len() as u8 + 1);
        out.put_slice(name);
        out.put_u8(0);
    } else {
        let trimmed = room.min(u8::MAX as usize);
        out.put_u8(trimmed as u8);
        out.put_slice(&name[..trimmed]);
    }
    status::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_capacity() {
        let mut config = EngineConfig::default();
        config.max_sessions = 3;
        config.discovery_enabled = false;
        assert_eq!(config.table_capacity(), 3);
        config.discovery_enabled = true;
        assert_eq!(config.table_capacity(), 4);
        config.max_frame_size = 9;
        assert_eq!(config.max_payload(), 2);
    }

    #[test]
    fn test_discovery_payload() {
        let mut out = BytesMut::new();
        assert_eq!(compose_discovery(Capabilities::STREAM, "rig", 64, &mut out), status::OK);
        assert_eq!(&out[..], &[DISCOVERY_VERSION, PROTOCOL_TCP, 4, b'r', b'i', b'g', 0]);
    }

    #[test]
    fn test_discovery_name_trimmed() {
        let mut out = BytesMut::new();
        compose_discovery(Capabilities::DATAGRAM, "a-very-long-board-name", 10, &mut out);
        assert_eq!(out[1], PROTOCOL_UDP);
        assert_eq!(out[2], 6);
        assert_eq!(&out[3..], b"a-very");
        assert!(out.len() <= 10);
    }
}

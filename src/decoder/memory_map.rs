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

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use integer_encoding::VarInt;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{status, CommandDecoder, CommandRequest, SessionContext};

pub const CMD_READ_MEM: u8 = 0x04;
pub const CMD_WRITE_MEM: u8 = 0x05;
pub const CMD_WRITE_MEM_MASK: u8 = 0x06;
pub const CMD_GET_CONFIG: u8 = 0x20;

/// How long a command waits for the application to release the region.
const REGION_LOCK_WAIT: Duration = Duration::from_millis(10);

/// Variable region shared between the application and the decoder.
pub type SharedRegion = Arc<RwLock<Vec<u8>>>;

/// Reads and writes a byte region on behalf of remote monitoring tools.
///
/// Addresses and sizes travel as unsigned LEB128 varints and are offsets into the region.
#[derive(Debug)]
pub struct MemoryMapDecoder {
    region: SharedRegion,
    name: String,
    /// commands served per session id
    served: HashMap<u32, u64>,
}

/// Cursor over a command payload.
struct PayloadReader<'a> {
    payload: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn varint(&mut self) -> Option<usize> {
        let (value, read) = u64::decode_var(self.payload)?;
        self.payload = &self.payload[read..];
        usize::try_from(value).ok()
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.payload.len() < len {
            return None;
        }
        let (head, tail) = self.payload.split_at(len);
        self.payload = tail;
        Some(head)
    }

    fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl MemoryMapDecoder {
    pub fn new(region: SharedRegion, name: impl Into<String>) -> Self {
        MemoryMapDecoder {
            region,
            name: name.into(),
            served: HashMap::new(),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Commands served on a session that is still open.
    pub fn served(&self, session_id: u32) -> u64 {
        self.served.get(&session_id).copied().unwrap_or(0)
    }

    fn read_mem(&self, payload: &[u8], response: &mut BytesMut) -> u8 {
        let mut reader = PayloadReader { payload };
        let (Some(address), Some(size)) = (reader.varint(), reader.varint()) else {
            return status::INVALID_BUFFER;
        };
        let Some(region) = self.region.try_read_for(REGION_LOCK_WAIT) else {
            return status::SERVICE_BUSY;
        };
        if region.is_empty() {
            return status::NOT_INITIALIZED;
        }
        let Some(range) = region_range(region.len(), address, size) else {
            return status::ACCESS_DENIED;
        };
        response.put_slice(&region[range]);
        status::OK
    }

    fn write_mem(&self, payload: &[u8], masked: bool) -> u8 {
        let mut reader = PayloadReader { payload };
        let (Some(address), Some(size)) = (reader.varint(), reader.varint()) else {
            return status::INVALID_BUFFER;
        };
        let Some(data) = reader.bytes(size) else {
            return status::INVALID_SIZE;
        };
        let mask = if masked {
            match reader.bytes(size) {
                Some(mask) => Some(mask),
                None => return status::INVALID_SIZE,
            }
        } else {
            None
        };
        if !reader.is_empty() {
            return status::INVALID_SIZE;
        }

        let Some(mut region) = self.region.try_write_for(REGION_LOCK_WAIT) else {
            return status::SERVICE_BUSY;
        };
        if region.is_empty() {
            return status::NOT_INITIALIZED;
        }
        let Some(range) = region_range(region.len(), address, size) else {
            return status::ACCESS_DENIED;
        };
        let target = &mut region[range];
        match mask {
            Some(mask) => {
                for ((byte, value), mask) in target.iter_mut().zip(data).zip(mask) {
                    *byte = (*byte & !mask) | (value & mask);
                }
            }
            None => target.copy_from_slice(data),
        }
        status::OK
    }

    fn get_config(&self, response: &mut BytesMut) -> u8 {
        let size = self.region.read().len() as u64;
        response.put_slice(&size.encode_var_vec());
        response.put_u8(self.name.len().min(u8::MAX as usize) as u8);
        response.put_slice(&self.name.as_bytes()[..self.name.len().min(u8::MAX as usize)]);
        status::OK
    }
}

fn region_range(len: usize, address: usize, size: usize) -> Option<Range<usize>> {
    let end = address.checked_add(size)?;
    (end <= len).then_some(address..end)
}

impl CommandDecoder for MemoryMapDecoder {
    fn decode(&mut self, request: CommandRequest<'_>, response: &mut BytesMut) -> u8 {
        trace!(
            "command {:#04x} with {} bytes on session {}",
            request.code,
            request.payload.len(),
            request.session.id
        );
        let status = match request.code {
            CMD_READ_MEM => self.read_mem(request.payload, response),
            CMD_WRITE_MEM => self.write_mem(request.payload, false),
            CMD_WRITE_MEM_MASK => self.write_mem(request.payload, true),
            CMD_GET_CONFIG => self.get_config(response),
            _ => status::INVALID_COMMAND,
        };
        if request.session.handle.is_some() {
            *self.served.entry(request.session.id).or_default() += 1;
        }
        status
    }

    fn session_closed(&mut self, session: &SessionContext) {
        if let Some(count) = self.served.remove(&session.id) {
            debug!("session {} closed after {} commands", session.id, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerAddress, SessionHandle};

    fn context() -> SessionContext {
        SessionContext {
            id: 7,
            address: PeerAddress::default(),
            handle: Some(SessionHandle(0)),
        }
    }

    fn request(code: u8, payload: &[u8]) -> CommandRequest<'_> {
        CommandRequest {
            code,
            payload,
            session: context(),
        }
    }

    fn decoder() -> MemoryMapDecoder {
        let region: SharedRegion = Arc::new(RwLock::new((0u8..32).collect()));
        MemoryMapDecoder::new(region, "bench")
    }

    #[test]
    fn test_read_mem() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        assert_eq!(decoder.decode(request(CMD_READ_MEM, &[4, 3]), &mut response), status::OK);
        assert_eq!(&response[..], &[4, 5, 6]);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        assert_eq!(
            decoder.decode(request(CMD_READ_MEM, &[30, 3]), &mut response),
            status::ACCESS_DENIED
        );
        assert!(response.is_empty());
    }

    #[test]
    fn test_write_and_masked_write() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        assert_eq!(
            decoder.decode(request(CMD_WRITE_MEM, &[0, 2, 0xAA, 0xBB]), &mut response),
            status::OK
        );
        assert_eq!(
            decoder.decode(request(CMD_WRITE_MEM_MASK, &[0, 1, 0x0F, 0x0F]), &mut response),
            status::OK
        );
        let region = decoder.region().read();
        assert_eq!(region[0], 0xAF);
        assert_eq!(region[1], 0xBB);
    }

    #[test]
    fn test_write_size_mismatch() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        assert_eq!(
            decoder.decode(request(CMD_WRITE_MEM, &[0, 3, 1]), &mut response),
            status::INVALID_SIZE
        );
        assert_eq!(
            decoder.decode(request(CMD_READ_MEM, &[0x80]), &mut response),
            status::INVALID_BUFFER
        );
    }

    #[test]
    fn test_get_config_and_unknown() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        assert_eq!(decoder.decode(request(CMD_GET_CONFIG, &[]), &mut response), status::OK);
        assert_eq!(&response[..], &[32, 5, b'b', b'e', b'n', b'c', b'h']);
        assert_eq!(
            decoder.decode(request(0x7F, &[]), &mut response),
            status::INVALID_COMMAND
        );
    }

    #[test]
    fn test_locked_region_reports_busy() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        let region = decoder.region().clone();
        let guard = region.write();
        assert_eq!(
            decoder.decode(request(CMD_READ_MEM, &[0, 1]), &mut response),
            status::SERVICE_BUSY
        );
        assert_eq!(
            decoder.decode(request(CMD_WRITE_MEM, &[0, 1, 9]), &mut response),
            status::SERVICE_BUSY
        );
        drop(guard);
        assert_eq!(decoder.decode(request(CMD_READ_MEM, &[0, 1]), &mut response), status::OK);
    }

    #[test]
    fn test_empty_region_not_initialized() {
        let mut decoder = MemoryMapDecoder::new(SharedRegion::default(), "empty");
        let mut response = BytesMut::new();
        assert_eq!(
            decoder.decode(request(CMD_READ_MEM, &[0, 0]), &mut response),
            status::NOT_INITIALIZED
        );
        assert_eq!(
            decoder.decode(request(CMD_WRITE_MEM, &[0, 1, 9]), &mut response),
            status::NOT_INITIALIZED
        );
    }

    #[test]
    fn test_session_state_released() {
        let mut decoder = decoder();
        let mut response = BytesMut::new();
        decoder.decode(request(CMD_READ_MEM, &[0, 1]), &mut response);
        decoder.decode(request(CMD_READ_MEM, &[0, 1]), &mut response);
        assert_eq!(decoder.served(7), 2);
        decoder.session_closed(&context());
        assert_eq!(decoder.served(7), 0);
    }
}

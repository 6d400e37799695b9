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

//! Network Module Implementation
//!
//! This module provides the session multiplexing core: it frames and checksums requests,
//! attributes them to per-peer sessions and dispatches them to a command decoder.
//!
//! # Architecture
//!
//! The module is poll driven and single threaded. Nothing in here blocks, every wait is
//! delegated to the transport driver.
//!
//! # Components
//!
//! - `PeerAddress`: canonical, comparable peer address used as session key
//! - `Frame`: wire frame codec with the CRC8 trailer
//! - `SessionTable`: fixed ring of session slots with LRU eviction
//! - `ProtocolEngine`: receive, reassembly, validation, dispatch and response
//! - `SharedEngine`: mutex guarded engine for multi-threaded hosts

pub use address::{AddressFamily, PeerAddress};
pub use engine::{
    EngineConfig, EngineStats, ProtocolEngine, DISCOVERY_VERSION, NET_DISCOVERY, NET_PING,
    PROTOCOL_TCP, PROTOCOL_UDP,
};
pub use frame::{encode_frame, Crc8, Frame, FrameHeader, FRAME_HEADER_LEN, FRAME_OVERHEAD};
pub use session::{Session, SessionHandle, SessionTable};
pub use shared::SharedEngine;

mod address;
mod engine;
mod frame;
mod session;
mod shared;

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

use std::sync::Arc;

use parking_lot::Mutex;

use super::{EngineStats, ProtocolEngine};
use crate::decoder::CommandDecoder;
use crate::transport::TransportDriver;

/// Engine shared between threads.
///
/// Session lookup, eviction and close scan and then mutate the table, so the whole engine
/// sits behind one mutex and every operation takes it once.
#[derive(Debug)]
pub struct SharedEngine<T, D> {
    inner: Arc<Mutex<ProtocolEngine<T, D>>>,
}

impl<T, D> Clone for SharedEngine<T, D> {
    fn clone(&self) -> Self {
        SharedEngine {
            inner: self.inner.clone(),
        }
    }
}

impl<T: TransportDriver, D: CommandDecoder> SharedEngine<T, D> {
    pub fn new(engine: ProtocolEngine<T, D>) -> Self {
        SharedEngine {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn poll(&self) -> bool {
        self.inner.lock().poll()
    }

    /// Polls until the transport is idle or `max_frames` polls made progress.
    ///
    /// Returns the number of polls that made progress.
    pub fn drain(&self, max_frames: usize) -> usize {
        let mut engine = self.inner.lock();
        let mut progressed = 0;
        while progressed < max_frames && engine.poll() {
            progressed += 1;
        }
        progressed
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.lock().sessions().active_count()
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.lock().stats()
    }
}
